//! Switchboard WebSocket endpoint
//!
//! JSON text frames from `diligent_session::protocol` over a single socket
//! per logged-in session.

mod handler;

pub use handler::handle_socket;
