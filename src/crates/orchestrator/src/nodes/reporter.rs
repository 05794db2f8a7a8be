//! Reporter node: composes the terminal `SessionReport`.
//!
//! Grounded on `ReporterNode` in `ai/graph/nodes/reporter.py`, trimmed down
//! to the structured summary this crate returns to its caller — formatting
//! and delivery to a chat channel is explicitly out of scope (§1 Non-goals).

use crate::model::{ArtifactKind, ErrorRecord, Session, SessionStatus, StepStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub goal: String,
    pub status: SessionStatus,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub steps_failed: usize,
    pub total_execution_time_s: f64,
    pub retry_count: u32,
    pub artifacts_by_kind: HashMap<ArtifactKind, usize>,
    pub recent_errors: Vec<ErrorRecord>,
}

pub struct Reporter;

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    pub fn new() -> Self {
        Self
    }

    pub fn report(&self, session: &Session) -> SessionReport {
        let completed = session.plan.iter().filter(|i| i.status == StepStatus::Completed).count();
        let failed = session.plan.iter().filter(|i| i.status == StepStatus::Failed).count();

        let total_execution_time_s = session
            .plan
            .iter()
            .filter_map(|item| match (item.started_at, item.completed_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
                _ => None,
            })
            .sum();

        let mut artifacts_by_kind: HashMap<ArtifactKind, usize> = HashMap::new();
        for artifact in &session.artifacts {
            *artifacts_by_kind.entry(artifact.kind).or_insert(0) += 1;
        }

        let mut recent_errors: Vec<ErrorRecord> = session.errors.clone();
        recent_errors.sort_by_key(|e| e.timestamp);
        let recent_errors = recent_errors.into_iter().rev().take(5).collect();

        SessionReport {
            session_id: session.session_id.clone(),
            goal: session.goal.clone(),
            status: session.status,
            steps_completed: completed,
            total_steps: session.plan.len(),
            steps_failed: failed,
            total_execution_time_s,
            retry_count: session.used_retries,
            artifacts_by_kind,
            recent_errors,
        }
    }
}
