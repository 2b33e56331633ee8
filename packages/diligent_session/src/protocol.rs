//! Wire Protocol Types
//!
//! JSON text frames exchanged between a session and the router over the
//! persistent websocket.

use serde::{Deserialize, Serialize};

use crate::model::{IdentityId, MessageId};

/// Frames sent FROM a client TO the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Associate this connection with an identity so addressed sends reach it.
    Register { user_id: IdentityId },
    /// Deliver `body` to the connection registered for `to`.
    /// `to` is either an identity id or the broadcast room id; `id` is
    /// forwarded untouched so the recipient can tell events apart.
    Send {
        to: String,
        from: IdentityId,
        id: MessageId,
        body: String,
    },
}

/// Frames sent FROM the router TO a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Registration accepted
    Registered { user_id: IdentityId },
    /// A message from another connection
    Deliver {
        from: IdentityId,
        to: String,
        id: MessageId,
        body: String,
    },
    /// Protocol-level error (malformed frame, send before register, ...)
    Error { message: String },
}
