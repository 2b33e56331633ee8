use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::ws;

/// Switchboard websocket - one connection per logged-in session
pub async fn switchboard_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let switchboard = state.switchboard.clone();
    let repository = state.repository.clone();
    let metrics = state.metrics.clone();
    let outbound_buffer = state.config.file.server.outbound_buffer;

    ws.on_upgrade(move |socket| {
        ws::handle_socket(socket, switchboard, repository, metrics, outbound_buffer)
    })
}
