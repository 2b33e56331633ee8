use anyhow::{Context, Result};

use super::Repository;
use crate::models::StoredMessage;

impl Repository {
    /// Append a message between two users under its client-assigned
    /// `message_id`. Returns the row id and whether the row is new; a
    /// `message_id` already stored leaves the table untouched.
    pub async fn insert_message(
        &self,
        message_id: &str,
        sender: &str,
        recipient: &str,
        body: &str,
    ) -> Result<(i64, bool)> {
        let result = sqlx::query(
            "INSERT INTO messages (message_id, sender, recipient, body, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(sender)
        .bind(recipient)
        .bind(body)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;
        if result.rows_affected() == 1 {
            return Ok((result.last_insert_rowid(), true));
        }

        let id: i64 = sqlx::query_scalar("SELECT id FROM messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to look up existing message")?;
        Ok((id, false))
    }

    /// Every message exchanged between `a` and `b` in either direction,
    /// oldest first.
    pub async fn conversation_history(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>> {
        let messages = sqlx::query_as::<_, StoredMessage>(
            "SELECT id, message_id, sender, recipient, body, created_at FROM messages
             WHERE (sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?)
             ORDER BY id ASC",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load conversation history")?;
        Ok(messages)
    }
}
