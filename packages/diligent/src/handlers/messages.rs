use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use diligent_session::HistoryEntry;

use super::error_response;
use crate::AppState;

#[derive(Deserialize)]
pub struct AppendRequest {
    /// Client-assigned message id; appending it again is a no-op
    id: String,
    from: String,
    to: String,
    body: String,
}

#[derive(Serialize)]
pub struct AppendResponse {
    id: i64,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    from: String,
    to: String,
}

pub async fn append_message_handler(
    State(state): State<AppState>,
    Json(req): Json<AppendRequest>,
) -> Response {
    if req.body.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Message body is empty");
    }
    if req.id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Message id is empty");
    }
    for id in [&req.from, &req.to] {
        match state.repository.get_user(id).await {
            Ok(Some(_)) => {}
            Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("Unknown user {id}")),
            Err(e) => {
                error!("Failed to look up user: {}", e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    match state
        .repository
        .insert_message(&req.id, &req.from, &req.to, &req.body)
        .await
    {
        Ok((id, true)) => {
            state.metrics.message_stored();
            debug!(id, message_id = %req.id, from = %req.from, to = %req.to, "Stored message");
            Json(AppendResponse { id }).into_response()
        }
        Ok((id, false)) => {
            debug!(id, message_id = %req.id, "Message already stored");
            Json(AppendResponse { id }).into_response()
        }
        Err(e) => {
            error!("Failed to store message: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state
        .repository
        .conversation_history(&query.from, &query.to)
        .await
    {
        Ok(messages) => {
            let entries: Vec<HistoryEntry> = messages.iter().map(|m| m.history_entry()).collect();
            Json(entries).into_response()
        }
        Err(e) => {
            error!("Failed to load history: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
