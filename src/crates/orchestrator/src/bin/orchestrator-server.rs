//! Orchestrator server binary: a thin `axum` HTTP surface over [`GraphRuntime`].
//!
//! Grounded on the teacher's server binary for its shutdown-signal and
//! tracing setup; the routes themselves follow the session lifecycle
//! (`start`/`resume`/`cancel`/`state`) described for this service.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use orchestrator::bridge::{MockToolBackend, ToolBridge};
use orchestrator::checkpoint::CheckpointStore;
use orchestrator::config::OrchestratorConfig;
use orchestrator::db::DatabaseConnection;
use orchestrator::gpulock::GpuLock;
use orchestrator::graph::{GraphRuntime, RunResult};
use orchestrator::model::{UserContext, UserRole};
use orchestrator::nodes::Executor;
use orchestrator::ratelimit::RateLimiter;
use orchestrator::runkey::RunKeyStore;
use orchestrator::schema::SchemaRegistry;
use orchestrator::{OrchestratorError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

struct AppState {
    runtime: GraphRuntime,
}

#[derive(Debug, Parser)]
#[command(name = "orchestrator-server", about = "HTTP surface over the session graph runtime")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config/orchestrator.yaml")]
    config_path: String,

    /// Host to bind the HTTP listener to.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the HTTP listener to.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let config = match OrchestratorConfig::load(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "no configuration file found at {}, using defaults", cli.config_path);
            OrchestratorConfig {
                database_path: "orchestrator.db".to_string(),
                rate_limits: Default::default(),
                circuit_breaker: Default::default(),
                gpu_lock: Default::default(),
                routing_policy: Default::default(),
                roles: Default::default(),
                graph: Default::default(),
                checkpoint_dir: "./data/checkpoints".to_string(),
            }
        }
    };

    tracing::info!(database_path = %config.database_path, checkpoint_dir = %config.checkpoint_dir, "starting orchestrator server");

    let db = DatabaseConnection::new(&format!("sqlite://{}?mode=rwc", config.database_path)).await?;
    db.run_migrations().await?;

    let run_keys = RunKeyStore::new(db.pool().clone());
    let rate_limiter = RateLimiter::new(db.pool().clone());
    let gpu_lock = GpuLock::with_config(config.gpu_lock.clone());
    let bridge = ToolBridge::new(Box::new(MockToolBackend), run_keys, rate_limiter, gpu_lock)
        .with_schema_registry(SchemaRegistry::with_builtin_tools());
    let executor = Executor::new(bridge);
    let checkpoints = CheckpointStore::new(config.checkpoint_dir.clone());
    let runtime = GraphRuntime::new(checkpoints, executor, config.graph.clone());

    let state = Arc::new(AppState { runtime });

    let app = Router::new()
        .route("/sessions", post(start_session))
        .route("/sessions/:id/resume", post(resume_session))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/sessions/:id", get(session_state))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;

    tracing::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("orchestrator server shut down gracefully");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    session_id: Option<String>,
    goal: String,
    user_id: String,
    #[serde(default)]
    role: UserRole,
}

async fn start_session(State(state): State<Arc<AppState>>, Json(request): Json<StartSessionRequest>) -> Result<Response> {
    let session_id = request.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let user = UserContext::new(request.user_id, request.role);
    let result = state.runtime.start(session_id, request.goal, user).await?;
    Ok(run_result_response(result))
}

async fn resume_session(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> Result<Response> {
    let result = state.runtime.resume(&session_id).await?;
    Ok(run_result_response(result))
}

async fn cancel_session(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> Response {
    let cancelled = state.runtime.cancel(&session_id);
    let status = if cancelled { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (status, Json(serde_json::json!({"session_id": session_id, "cancelled": cancelled}))).into_response()
}

async fn session_state(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> Result<Response> {
    match state.runtime.state(&session_id).await? {
        Some(session) => Ok((StatusCode::OK, Json(session)).into_response()),
        None => Err(OrchestratorError::SessionNotFound(session_id)),
    }
}

fn run_result_response(result: RunResult) -> Response {
    match result {
        RunResult::Finished { session_id, report } => {
            (StatusCode::OK, Json(serde_json::json!({"session_id": session_id, "report": report}))).into_response()
        }
        RunResult::InProgress { session_id, next_node } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"session_id": session_id, "status": "in_progress", "next_node": next_node})),
        )
            .into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received CTRL-C signal, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM signal, shutting down"),
    }
}
