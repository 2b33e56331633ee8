//! Argon2-hashed user accounts, avatars and the contact list.

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use super::Repository;
use crate::models::User;

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

const USER_COLUMNS: &str = "id, username, email, password_hash, avatar_image, avatar_set, created_at";

impl Repository {
    pub async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, avatar_image, avatar_set, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.avatar_image)
        .bind(user.avatar_set)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to create user")?;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn username_taken(&self, username: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn email_taken(&self, email: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Verify password against stored argon2 hash. Returns the User on success.
    pub async fn verify_user_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>> {
        let user = match self.get_user_by_username(username).await? {
            Some(u) => u,
            None => return Ok(None),
        };
        if verify_password(password, &user.password_hash)? {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    /// Store `image` as the user's avatar. Returns false if no such user.
    pub async fn set_avatar(&self, id: &str, image: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET avatar_image = ?, avatar_set = 1 WHERE id = ?")
            .bind(image)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to set avatar")?;
        Ok(result.rows_affected() > 0)
    }

    /// Every user except `id`, ordered by username.
    pub async fn list_contacts(&self, id: &str) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id != ? ORDER BY username"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Hash a password with argon2 for user creation.
    pub fn hash_password(password: &str) -> Result<String> {
        hash_password(password)
    }
}
