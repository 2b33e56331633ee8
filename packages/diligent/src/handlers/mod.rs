use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub mod auth;
pub mod health;
pub mod messages;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use auth::{contacts_handler, login_handler, register_handler, set_avatar_handler};
pub use health::{
    database_stats_handler, health_handler, health_live_handler, health_ready_handler,
    metrics_handler,
};
pub use messages::{append_message_handler, history_handler};
pub use websocket::switchboard_websocket_handler;

/// JSON `{"error": ...}` body with the given status.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}
