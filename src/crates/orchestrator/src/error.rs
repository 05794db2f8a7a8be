//! Crate-wide error type.
//!
//! Every subsystem (checkpoint store, run-key store, rate limiter, breaker,
//! GPU lock, router, bridge, nodes, graph runtime, schema registry) returns
//! its errors through this type so callers never need to match on a dozen
//! different enums to tell a retryable failure from a terminal one.

use thiserror::Error;

/// Result type used throughout the orchestrator crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Configuration was missing or malformed. Fatal at startup, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tool call's arguments failed schema validation. Not retryable.
    #[error("validation error: {0}")]
    Validation(String),

    /// The external tool backend returned an error or timed out.
    #[error("tool execution failed: {0}")]
    ToolFailed(String),

    /// A tool call exceeded its configured timeout.
    #[error("tool '{0}' timed out after {1:?}")]
    Timeout(String, std::time::Duration),

    /// The provider router exhausted every fallback level.
    #[error("all provider fallbacks exhausted for role '{0}'")]
    AllFallbacksFailed(String),

    /// The circuit breaker for a backend is open; the call short-circuited.
    #[error("circuit open for backend '{0}'")]
    CircuitOpen(String),

    /// Requested session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// An internal invariant was violated. Always marks the session failed.
    #[error("critical error: {0}")]
    Critical(String),

    /// Two processes attempted to own the same session's checkpoint journal.
    #[error("session '{0}' is already owned by another process")]
    SessionLocked(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Llm(#[from] llm::LlmError),
}

impl OrchestratorError {
    /// Whether a failed plan item carrying this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ToolFailed(_)
                | OrchestratorError::Timeout(_, _)
                | OrchestratorError::CircuitOpen(_)
                | OrchestratorError::AllFallbacksFailed(_)
                | OrchestratorError::Database(_)
                | OrchestratorError::Llm(_)
        )
    }
}

impl axum::response::IntoResponse for OrchestratorError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let status = match &self {
            OrchestratorError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Validation(_) | OrchestratorError::Schema(_) | OrchestratorError::Configuration(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::SessionLocked(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, axum::Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
