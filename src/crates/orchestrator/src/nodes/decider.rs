//! Decider node: chooses the next plan item to execute, or decides to stop.
//!
//! Grounded on `DeciderNode` in `ai/graph/nodes/decider.py`, generalized to
//! the rule order spelled out for this crate: terminal check, max-steps cap,
//! critical errors, retry-budget exhaustion, retry-eligible failures, ready
//! pending items, then a GPU-slot check on the winning candidate.

use crate::config::GraphConfig;
use crate::model::{PlanItem, Session, SessionStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run this plan item now.
    Execute(String),
    /// No step can run this tick (e.g. GPU slots full); try again later.
    Wait(String),
    /// Stop the session and produce a report.
    StopReport(String),
}

pub struct Decider {
    config: GraphConfig,
}

impl Decider {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }

    pub fn decide(&self, session: &mut Session) -> Decision {
        if matches!(session.status, SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled) {
            return Decision::StopReport("session already in a terminal status".to_string());
        }

        if session.current_step as u32 >= self.config.max_steps {
            let remaining = session.pending_steps().count() + running_steps(session).count();
            session.status = if remaining > 0 { SessionStatus::Failed } else { SessionStatus::Completed };
            return Decision::StopReport(format!("maximum steps ({}) reached", self.config.max_steps));
        }

        if session.has_critical_errors() {
            session.status = SessionStatus::Failed;
            return Decision::StopReport("critical errors present".to_string());
        }

        if session.used_retries >= session.retry_budget {
            session.status = SessionStatus::Failed;
            return Decision::StopReport("retry budget exhausted".to_string());
        }

        let candidate = self.select_retry_candidate(session).or_else(|| self.select_ready_pending(session));

        let Some(item_id) = candidate else {
            let all_completed = !session.plan.is_empty() && session.plan.iter().all(|i| i.status == StepStatus::Completed);
            session.status = if all_completed { SessionStatus::Completed } else { SessionStatus::Failed };
            return Decision::StopReport("no executable steps remaining".to_string());
        };

        let item = session.get_plan_item(&item_id).expect("candidate id comes from session.plan");
        if item.requires_gpu && session.running_gpu_count() >= self.config.max_parallel_gpu {
            return Decision::Wait(format!(
                "GPU slots full ({}/{})",
                session.running_gpu_count(),
                self.config.max_parallel_gpu
            ));
        }

        Decision::Execute(item_id)
    }

    fn select_retry_candidate(&self, session: &Session) -> Option<String> {
        best_candidate(session.failed_steps().filter(|item| item.can_retry()))
    }

    fn select_ready_pending(&self, session: &Session) -> Option<String> {
        best_candidate(session.pending_steps().filter(|item| session.dependencies_satisfied(item)))
    }
}

fn running_steps(session: &Session) -> impl Iterator<Item = &PlanItem> {
    session.plan.iter().filter(|p| p.status == StepStatus::Running)
}

fn action_priority(action: &str) -> u32 {
    match action {
        "sd_generate" | "transcribe_audio" | "synthesize_speech" => 1,
        "upscale_image" => 2,
        "generate_animation" => 3,
        "upload_file" => 4,
        _ => 5,
    }
}

fn best_candidate<'a>(items: impl Iterator<Item = &'a PlanItem>) -> Option<String> {
    items
        .min_by_key(|item| action_priority(&item.action) + 2 * item.retry_count)
        .map(|item| item.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UserContext, UserRole};

    fn session_with(items: Vec<PlanItem>) -> Session {
        let mut session = Session::new("s1", "/img cat", UserContext::new("u1", UserRole::User));
        session.plan = items;
        session.status = SessionStatus::Executing;
        session
    }

    #[test]
    fn stops_immediately_when_already_terminal() {
        let decider = Decider::new(GraphConfig::default());
        let mut session = session_with(vec![]);
        session.status = SessionStatus::Completed;
        assert!(matches!(decider.decide(&mut session), Decision::StopReport(_)));
    }

    #[test]
    fn max_steps_cap_fails_with_pending_items_remaining() {
        let mut config = GraphConfig::default();
        config.max_steps = 1;
        let decider = Decider::new(config);
        let mut session = session_with(vec![PlanItem::new("a", "sd_generate", serde_json::json!({}))]);
        session.current_step = 1;
        decider.decide(&mut session);
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[test]
    fn max_steps_cap_completes_when_nothing_left_pending() {
        let mut config = GraphConfig::default();
        config.max_steps = 1;
        let decider = Decider::new(config);
        let mut item = PlanItem::new("a", "sd_generate", serde_json::json!({}));
        item.status = StepStatus::Completed;
        let mut session = session_with(vec![item]);
        session.current_step = 1;
        decider.decide(&mut session);
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn prefers_retry_eligible_failed_item_over_pending() {
        let decider = Decider::new(GraphConfig::default());
        let mut failed = PlanItem::new("a", "sd_generate", serde_json::json!({}));
        failed.status = StepStatus::Failed;
        failed.retry_count = 0;
        let pending = PlanItem::new("b", "synthesize_speech", serde_json::json!({}));
        let mut session = session_with(vec![failed, pending]);

        assert_eq!(decider.decide(&mut session), Decision::Execute("a".to_string()));
    }

    #[test]
    fn selects_ready_pending_item_respecting_dependencies() {
        let decider = Decider::new(GraphConfig::default());
        let mut first = PlanItem::new("a", "sd_generate", serde_json::json!({}));
        first.status = StepStatus::Completed;
        let second = PlanItem::new("b", "upscale_image", serde_json::json!({})).depends_on(["a".to_string()]);
        let third = PlanItem::new("c", "synthesize_speech", serde_json::json!({}));
        let mut session = session_with(vec![first, second, third]);

        assert_eq!(decider.decide(&mut session), Decision::Execute("c".to_string()));
    }

    #[test]
    fn gpu_slot_full_waits_instead_of_executing() {
        let decider = Decider::new(GraphConfig::default());
        let mut running = PlanItem::new("a", "sd_generate", serde_json::json!({})).with_gpu(true);
        running.status = StepStatus::Running;
        let mut pending = PlanItem::new("b", "upscale_image", serde_json::json!({})).with_gpu(true);
        pending.status = StepStatus::Pending;
        let mut session = session_with(vec![running, pending]);

        assert!(matches!(decider.decide(&mut session), Decision::Wait(_)));
    }

    #[test]
    fn completes_when_all_items_are_done() {
        let decider = Decider::new(GraphConfig::default());
        let mut item = PlanItem::new("a", "sd_generate", serde_json::json!({}));
        item.status = StepStatus::Completed;
        let mut session = session_with(vec![item]);
        decider.decide(&mut session);
        assert_eq!(session.status, SessionStatus::Completed);
    }
}
