use sqlx::sqlite::SqlitePoolOptions;

use crate::models::User;

/// Create a fresh Repository backed by an in-memory SQLite database.
/// Each call returns an isolated database with all migrations applied.
pub async fn test_repository() -> super::Repository {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("Failed to enable foreign keys");

    super::Repository::new(pool)
}

/// Insert a user named `username` with password "password123".
pub async fn seed_user(repo: &super::Repository, username: &str) -> User {
    let hash = super::Repository::hash_password("password123").expect("hash");
    let user = User::new(username, &format!("{username}@example.com"), hash);
    repo.create_user(&user).await.expect("create user");
    user
}
