//! Executor node: runs the chosen plan item through the tool bridge.
//!
//! Grounded on `ExecutorNode` in `ai/graph/nodes/executor.py`: mark running,
//! invoke the backend, fold the outcome back into the session. Must not
//! advance `current_step` on a failure that is still retryable.

use crate::bridge::ToolBridge;
use crate::error::{OrchestratorError, Result};
use crate::model::{ArtifactInfo, ErrorRecord, ErrorSeverity, Session, StepStatus};
use chrono::Utc;

pub struct Executor {
    bridge: ToolBridge,
}

impl Executor {
    pub fn new(bridge: ToolBridge) -> Self {
        Self { bridge }
    }

    /// Executes `item_id` within `session`, updating its status, artifacts,
    /// retry bookkeeping and error log in place.
    pub async fn execute(&self, session: &mut Session, item_id: &str) -> Result<()> {
        let step_index = session.current_step;
        let (action, params) = {
            let item = session
                .get_plan_item_mut(item_id)
                .ok_or_else(|| OrchestratorError::Validation(format!("unknown plan item '{item_id}'")))?;
            item.status = StepStatus::Running;
            item.started_at = Some(Utc::now());
            (item.action.clone(), item.params.clone())
        };

        let outcome = self.bridge.invoke(&session.session_id, step_index, &action, &params).await;

        match outcome {
            Ok(result) => {
                for artifact in &result.artifacts {
                    let info = ArtifactInfo::from_path(item_id, artifact.path.clone());
                    session.add_artifact(info);
                }

                let item = session.get_plan_item_mut(item_id).expect("item exists, looked up above");
                item.status = StepStatus::Completed;
                item.completed_at = Some(Utc::now());
                session.current_step += 1;
                Ok(())
            }
            Err(error) => {
                let retryable = error.is_retryable();
                // `Critical` is reserved for an internal invariant violation
                // (`OrchestratorError::Critical`); an expected, non-retryable
                // tool failure (bad arguments, schema mismatch, ...) is a
                // plain step-level error and must not fail the whole session.
                let severity = match &error {
                    OrchestratorError::Critical(_) => ErrorSeverity::Critical,
                    _ => ErrorSeverity::Error,
                };

                let item = session.get_plan_item_mut(item_id).expect("item exists, looked up above");
                item.status = StepStatus::Failed;
                item.retry_count += 1;
                let will_retry = retryable && item.retry_count < item.max_retries;

                session.used_retries += 1;
                session.add_error(ErrorRecord::new(severity, error.to_string()).for_step(item_id.to_string()));

                if !will_retry {
                    session.current_step += 1;
                }

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockToolBackend;
    use crate::db::DatabaseConnection;
    use crate::gpulock::GpuLock;
    use crate::model::{PlanItem, UserContext, UserRole};
    use crate::ratelimit::RateLimiter;
    use crate::runkey::RunKeyStore;

    async fn executor() -> Executor {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        conn.run_migrations().await.unwrap();
        let run_keys = RunKeyStore::new(conn.pool().clone());
        let rate_limiter = RateLimiter::new(conn.pool().clone());
        let bridge = ToolBridge::new(Box::new(MockToolBackend), run_keys, rate_limiter, GpuLock::new())
            .with_schema_registry(crate::schema::SchemaRegistry::with_builtin_tools());
        Executor::new(bridge)
    }

    #[tokio::test]
    async fn successful_step_completes_and_advances() {
        let executor = executor().await;
        let mut session = Session::new("s1", "/img cat", UserContext::new("u1", UserRole::User));
        session.plan.push(PlanItem::new("a", "sd_generate", serde_json::json!({"prompt": "a cat"})));

        executor.execute(&mut session, "a").await.unwrap();

        let item = session.get_plan_item("a").unwrap();
        assert_eq!(item.status, StepStatus::Completed);
        assert_eq!(session.current_step, 1);
        assert_eq!(session.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn validation_failure_records_a_step_error_without_failing_the_session() {
        let executor = executor().await;
        let mut session = Session::new("s1", "/img", UserContext::new("u1", UserRole::User));
        session.plan.push(PlanItem::new("a", "sd_generate", serde_json::json!({"steps": 20})));

        executor.execute(&mut session, "a").await.unwrap();

        let item = session.get_plan_item("a").unwrap();
        assert_eq!(item.status, StepStatus::Failed);
        assert_ne!(session.status, crate::model::SessionStatus::Failed);
        assert_eq!(session.errors.last().unwrap().severity, crate::model::ErrorSeverity::Error);
    }

    #[tokio::test]
    async fn unknown_tool_pass_through_still_completes() {
        let executor = executor().await;
        let mut session = Session::new("s1", "do a thing", UserContext::new("u1", UserRole::User));
        session.plan.push(PlanItem::new("a", "totally_unknown_tool", serde_json::json!({"x": 1})));

        executor.execute(&mut session, "a").await.unwrap();

        assert_eq!(session.get_plan_item("a").unwrap().status, StepStatus::Completed);
    }
}
