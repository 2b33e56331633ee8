use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use diligent_session::{HistoryEntry, Identity};

// === Auth models ===

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub avatar_image: String,
    pub avatar_set: bool,
    pub created_at: i64,
}

impl User {
    /// Build a new account row with a fresh id.
    pub fn new(username: &str, email: &str, password_hash: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            avatar_image: String::new(),
            avatar_set: false,
            created_at: Utc::now().timestamp(),
        }
    }

    /// Public view handed to clients (no email, no password hash).
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.as_str().into(),
            username: self.username.clone(),
            avatar: (!self.avatar_image.is_empty()).then(|| self.avatar_image.clone()),
            avatar_set: self.avatar_set,
        }
    }
}

impl From<User> for Identity {
    fn from(u: User) -> Self {
        u.identity()
    }
}

// === Message models ===

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    /// Client-assigned id, shared with the live delivery of the same message
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub created_at: i64,
}

impl StoredMessage {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.created_at, 0).single()
    }

    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            id: self.message_id.as_str().into(),
            author: self.sender.as_str().into(),
            body: self.body.clone(),
            created_at: self.created_at(),
        }
    }
}
