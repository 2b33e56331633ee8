use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cli;
mod config;
mod db;
mod handlers;
mod metrics;
mod models;
mod repository;
mod router;
mod ws;

#[cfg(test)]
mod test_helpers;

use std::path::PathBuf;

use crate::config::DiligentConfig;
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::Repository;
use crate::router::Switchboard;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "diligent")]
#[command(about = "Realtime one-to-one and room chat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.diligent)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server in the foreground
    Server(ServerArgs),

    /// Open the terminal chat client
    Chat(cli::ChatArgs),

    /// Forget the saved identity
    Logout,
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (defaults to [server] port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (defaults to [server] host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub config: Arc<DiligentConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    pub repository: Arc<Repository>,
    /// Live websocket registrations
    pub switchboard: Arc<Switchboard>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = DiligentConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Server(args) => run_server(args, config).await,
        Commands::Chat(args) => cli::chat_command(&config, args).await,
        Commands::Logout => cli::logout_command(&config),
    }
}

pub(crate) fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/admin/db", get(handlers::database_stats_handler))
        .route("/api/auth/register", post(handlers::register_handler))
        .route("/api/auth/login", post(handlers::login_handler))
        .route("/api/auth/avatar/{id}", post(handlers::set_avatar_handler))
        .route("/api/users/{id}/contacts", get(handlers::contacts_handler))
        .route(
            "/api/messages",
            get(handlers::history_handler).post(handlers::append_message_handler),
        )
        .route("/api/ws", get(handlers::switchboard_websocket_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

async fn run_server(args: ServerArgs, config: DiligentConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "diligent=debug,diligent_session=debug,tower_http=debug,info"
    } else {
        "diligent=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Diligent chat server");

    let config = Arc::new(config);

    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);
    let repository = Arc::new(Repository::new(db.pool.clone()));
    let metrics = Arc::new(ServerMetrics::new());
    let switchboard = Arc::new(Switchboard::new(metrics.clone()));

    let app_state = AppState {
        config: config.clone(),
        metrics,
        db,
        repository,
        switchboard,
    };
    let app = build_router(app_state);

    let host = args
        .host
        .unwrap_or_else(|| config.file.server.host.clone());
    let port = args.port.unwrap_or(config.file.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Diligent listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/auth/register          - Create an account");
    info!("  POST   /api/auth/login             - Log in");
    info!("  POST   /api/auth/avatar/:id        - Set avatar");
    info!("  GET    /api/users/:id/contacts     - List contacts");
    info!("  GET    /api/messages?from=&to=     - Conversation history");
    info!("  POST   /api/messages               - Store a message");
    info!("  GET    /api/ws                     - Switchboard WebSocket");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    info!("Shutdown complete");
    server_result
}
