//! End-to-end HTTP surface tests: real `reqwest` client against a real
//! `axum` server bound to an ephemeral port, backed by a temp-dir checkpoint
//! store and an in-memory sqlite pool.

use orchestrator::bridge::{MockToolBackend, ToolBridge};
use orchestrator::checkpoint::CheckpointStore;
use orchestrator::config::GraphConfig;
use orchestrator::db::DatabaseConnection;
use orchestrator::gpulock::GpuLock;
use orchestrator::graph::GraphRuntime;
use orchestrator::nodes::Executor;
use orchestrator::ratelimit::RateLimiter;
use orchestrator::runkey::RunKeyStore;
use orchestrator::schema::SchemaRegistry;
use std::net::SocketAddr;
use std::sync::Arc;

struct AppState {
    runtime: GraphRuntime,
}

async fn spawn_server() -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = DatabaseConnection::new("sqlite::memory:").await.expect("db connect");
    db.run_migrations().await.expect("run migrations");

    let run_keys = RunKeyStore::new(db.pool().clone());
    let rate_limiter = RateLimiter::new(db.pool().clone());
    let gpu_lock = GpuLock::new();
    let bridge = ToolBridge::new(Box::new(MockToolBackend), run_keys, rate_limiter, gpu_lock)
        .with_schema_registry(SchemaRegistry::with_builtin_tools());
    let executor = Executor::new(bridge);
    let checkpoints = CheckpointStore::new(dir.path());
    let runtime = GraphRuntime::new(checkpoints, executor, GraphConfig::default());

    let state = Arc::new(AppState { runtime });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.ok();
    });

    (addr, dir)
}

fn build_router(state: Arc<AppState>) -> axum::Router {
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use orchestrator::graph::RunResult;
    use orchestrator::model::{UserContext, UserRole};
    use orchestrator::{OrchestratorError, Result};
    use serde::Deserialize;

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

    Router::new()
        .route("/sessions", post(start_session))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/sessions/:id", get(session_state))
        .with_state(state)
}

#[tokio::test]
async fn starting_an_image_session_over_http_returns_a_completed_report() {
    let (addr, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/sessions"))
        .json(&serde_json::json!({"goal": "/img a red bicycle", "user_id": "u1"}))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["report"]["status"], "completed");
    assert!(body["report"]["steps_completed"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn fetching_an_unknown_session_returns_404() {
    let (addr, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/sessions/does-not-exist"))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancelling_an_unknown_session_reports_not_found_without_erroring() {
    let (addr, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/sessions/does-not-exist/cancel"))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["cancelled"], false);
}
