use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use diligent_session::Identity;

use super::error_response;
use crate::AppState;
use crate::models::User;
use crate::repository::Repository;

const MIN_USERNAME_LEN: usize = 3;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Deserialize)]
pub struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
pub struct AvatarRequest {
    image: String,
}

#[derive(Serialize)]
pub struct AvatarResponse {
    is_set: bool,
    image: String,
}

fn validate_registration(req: &RegisterRequest) -> Result<(), &'static str> {
    if req.username.trim().chars().count() < MIN_USERNAME_LEN {
        return Err("Username should be at least 3 characters");
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err("Password should be at least 8 characters");
    }
    if !req.email.contains('@') {
        return Err("A valid email is required");
    }
    Ok(())
}

pub async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if let Err(msg) = validate_registration(&req) {
        return error_response(StatusCode::BAD_REQUEST, msg);
    }
    let username = req.username.trim();

    match state.repository.username_taken(username).await {
        Ok(true) => return error_response(StatusCode::CONFLICT, "Username already used"),
        Ok(false) => {}
        Err(e) => {
            error!("Failed to check username: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    match state.repository.email_taken(&req.email).await {
        Ok(true) => return error_response(StatusCode::CONFLICT, "Email already used"),
        Ok(false) => {}
        Err(e) => {
            error!("Failed to check email: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let hash = match Repository::hash_password(&req.password) {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to hash password: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let user = User::new(username, &req.email, hash);
    if let Err(e) = state.repository.create_user(&user).await {
        error!("Failed to create user: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    info!(user = %user.id, username = %user.username, "Registered new user");
    (StatusCode::CREATED, Json(user.identity())).into_response()
}

pub async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Response {
    match state
        .repository
        .verify_user_password(req.username.trim(), &req.password)
        .await
    {
        Ok(Some(user)) => {
            info!(user = %user.id, "Login");
            Json(user.identity()).into_response()
        }
        Ok(None) => error_response(StatusCode::UNAUTHORIZED, "Incorrect username or password"),
        Err(e) => {
            error!("Failed to verify password: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn set_avatar_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AvatarRequest>,
) -> Response {
    if req.image.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Please select an avatar");
    }
    match state.repository.set_avatar(&id, &req.image).await {
        Ok(true) => Json(AvatarResponse {
            is_set: true,
            image: req.image,
        })
        .into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Unknown user"),
        Err(e) => {
            error!("Failed to set avatar: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn contacts_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.repository.list_contacts(&id).await {
        Ok(users) => {
            let contacts: Vec<Identity> = users.into_iter().map(Identity::from).collect();
            Json(contacts).into_response()
        }
        Err(e) => {
            error!("Failed to list contacts: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::Request,
        routing::{get, post},
    };
    use tower::ServiceExt;

    async fn test_router() -> (Router, tempfile::TempDir) {
        let (state, tmp) = crate::test_helpers::test_app_state().await;
        let router = Router::new()
            .route("/api/auth/register", post(register_handler))
            .route("/api/auth/login", post(login_handler))
            .route("/api/auth/avatar/{id}", post(set_avatar_handler))
            .route("/api/users/{id}/contacts", get(contacts_handler))
            .with_state(state);
        (router, tmp)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn register(app: &Router, username: &str) -> serde_json::Value {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/auth/register",
                serde_json::json!({
                    "username": username,
                    "email": format!("{username}@example.com"),
                    "password": "password123",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    #[tokio::test]
    async fn test_register_returns_identity() {
        let (app, _tmp) = test_router().await;
        let json = register(&app, "alice").await;
        assert_eq!(json["username"], "alice");
        assert_eq!(json["avatar_set"], false);
        assert!(json["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(json.get("password_hash").is_none());
        assert!(json.get("email").is_none());
    }

    #[tokio::test]
    async fn test_register_validations() {
        let (app, _tmp) = test_router().await;

        let cases = [
            (
                serde_json::json!({"username": "al", "email": "al@example.com", "password": "password123"}),
                "Username should be at least 3 characters",
            ),
            (
                serde_json::json!({"username": "alice", "email": "alice@example.com", "password": "short"}),
                "Password should be at least 8 characters",
            ),
            (
                serde_json::json!({"username": "alice", "email": "nope", "password": "password123"}),
                "A valid email is required",
            ),
        ];
        for (body, message) in cases {
            let resp = app.clone().oneshot(post_json("/api/auth/register", body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(resp).await["error"], message);
        }
    }

    #[tokio::test]
    async fn test_register_duplicates_rejected() {
        let (app, _tmp) = test_router().await;
        register(&app, "alice").await;

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/auth/register",
                serde_json::json!({"username": "alice", "email": "other@example.com", "password": "password123"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"], "Username already used");

        let resp = app
            .oneshot(post_json(
                "/api/auth/register",
                serde_json::json!({"username": "alice2", "email": "alice@example.com", "password": "password123"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"], "Email already used");
    }

    #[tokio::test]
    async fn test_login() {
        let (app, _tmp) = test_router().await;
        let created = register(&app, "bob").await;

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/auth/login",
                serde_json::json!({"username": "bob", "password": "password123"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"], created["id"]);

        let resp = app
            .oneshot(post_json(
                "/api/auth/login",
                serde_json::json!({"username": "bob", "password": "wrong-password"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "Incorrect username or password");
    }

    #[tokio::test]
    async fn test_set_avatar() {
        let (app, _tmp) = test_router().await;
        let created = register(&app, "carol").await;
        let id = created["id"].as_str().unwrap();

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/auth/avatar/{id}"),
                serde_json::json!({"image": "data:image/svg+xml;base64,PHN2Zz4="}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["is_set"], true);
        assert_eq!(json["image"], "data:image/svg+xml;base64,PHN2Zz4=");

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/auth/avatar/u-missing",
                serde_json::json!({"image": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(post_json(
                &format!("/api/auth/avatar/{id}"),
                serde_json::json!({"image": "  "}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_contacts_exclude_self() {
        let (app, _tmp) = test_router().await;
        let alice = register(&app, "alice").await;
        register(&app, "bob").await;
        register(&app, "carol").await;

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/users/{}/contacts", alice["id"].as_str().unwrap()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let names: Vec<_> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["username"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["bob", "carol"]);
    }
}
