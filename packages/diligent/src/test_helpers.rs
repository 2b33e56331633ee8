use std::sync::Arc;

use crate::AppState;
use crate::config::DiligentConfig;
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::Repository;
use crate::router::Switchboard;

/// Build a fully-wired `AppState` backed by an in-memory SQLite database.
///
/// Returns `(AppState, TempDir)`; callers **must** hold the `TempDir` for
/// the lifetime of the test so the data directory stays valid.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = DiligentConfig::new(Some(tmp.path().to_path_buf())).expect("config");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("pragma");

    let metrics = Arc::new(ServerMetrics::new());
    let state = AppState {
        config: Arc::new(config),
        switchboard: Arc::new(Switchboard::new(metrics.clone())),
        metrics,
        db: Arc::new(Database { pool: pool.clone() }),
        repository: Arc::new(Repository::new(pool)),
    };

    (state, tmp)
}

/// Serve the full router on an ephemeral localhost port.
/// Returns the base URL (`http://127.0.0.1:<port>`).
pub async fn spawn_server(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = crate::build_router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    format!("http://{addr}")
}
