//! Error taxonomy for the session core.
//!
//! None of these are fatal: the session manager converts every one of them into
//! a [`crate::SessionUpdate`] instead of returning it to the UI.

use tokio_tungstenite::tungstenite;

/// The connection could not be opened, registered, or used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("server is unreachable: {0}")]
    Unreachable(String),

    #[error("registration handshake failed: {0}")]
    Handshake(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io_err) => Self::Unreachable(io_err.to_string()),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            other => Self::Handshake(other.to_string()),
        }
    }
}

/// History load failed on focus switch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("history request failed: {0}")]
    Transport(String),

    #[error("history request returned status {0}")]
    Status(u16),

    #[error("history response could not be decoded: {0}")]
    Decode(String),
}

/// The durable append failed after the optimistic message was shown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("append request failed: {0}")]
    Transport(String),

    #[error("append request returned status {0}")]
    Status(u16),
}

/// Local input rejected before anything is transmitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message body is empty")]
    EmptyBody,
}

/// Failures of the HTTP identity endpoints (login, register, avatar, contacts).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("server is unavailable")]
    Unavailable,

    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Http(err)
        }
    }
}

/// Failures reading or writing the persisted local identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityStoreError {
    #[error("identity file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
