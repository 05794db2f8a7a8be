//! Core data model: sessions, plan items, artifacts and error records.
//!
//! Grounded on `ai/graph/state.py` in the original implementation — the shapes
//! here are a direct Rust rendering of `GraphState`/`PlanItem`/`ArtifactInfo`,
//! with `chrono`/`uuid`/`serde` replacing the Python dataclasses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
    Guest,
}

impl Default for UserRole {
    fn default() -> Self {
        UserRole::User
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Video,
    Audio,
    Document,
    Unknown,
}

impl ArtifactKind {
    /// Infer a kind from a file extension, matching the extension tables the
    /// executor uses to tag an output path.
    pub fn from_extension(path: &str) -> Self {
        let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" => ArtifactKind::Image,
            "mp4" | "mov" | "avi" | "webm" | "mkv" => ArtifactKind::Video,
            "mp3" | "wav" | "ogg" | "flac" | "m4a" => ArtifactKind::Audio,
            "pdf" | "txt" | "md" | "docx" => ArtifactKind::Document,
            _ => ArtifactKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub role: UserRole,
    pub channel: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        Self { user_id: user_id.into(), role, channel: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: String,
    pub action: String,
    pub params: serde_json::Value,
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub estimated_duration_s: f64,
    pub requires_gpu: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlanItem {
    pub fn new(id: impl Into<String>, action: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            params,
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: 2,
            estimated_duration_s: 10.0,
            requires_gpu: false,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.dependencies.extend(ids);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_gpu(mut self, requires_gpu: bool) -> Self {
        self.requires_gpu = requires_gpu;
        self
    }

    pub fn with_estimated_duration(mut self, secs: f64) -> Self {
        self.estimated_duration_s = secs;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.status == StepStatus::Failed && self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub id: String,
    pub path: String,
    pub kind: ArtifactKind,
    pub step_id: String,
    pub size_bytes: Option<u64>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactInfo {
    pub fn from_path(step_id: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let kind = ArtifactKind::from_extension(&path);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path,
            kind,
            step_id: step_id.into(),
            size_bytes: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub step_id: Option<String>,
    pub severity: ErrorSeverity,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            step_id: None,
            severity,
            message: message.into(),
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// The next node a dispatched runtime tick should enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextNode {
    Planner,
    Decider,
    Executor,
    Reporter,
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user: UserContext,
    pub goal: String,
    pub plan: Vec<PlanItem>,
    pub current_step: usize,
    pub current_step_item: Option<String>,
    pub status: SessionStatus,
    pub next_node: NextNode,
    pub artifacts: Vec<ArtifactInfo>,
    pub errors: Vec<ErrorRecord>,
    pub retry_budget: u32,
    pub used_retries: u32,
    pub total_execution_time_s: f64,
}

impl Session {
    pub fn new(session_id: impl Into<String>, goal: impl Into<String>, user: UserContext) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            created_at: now,
            updated_at: now,
            user,
            goal: goal.into(),
            plan: Vec::new(),
            current_step: 0,
            current_step_item: None,
            status: SessionStatus::Planning,
            next_node: NextNode::Planner,
            artifacts: Vec::new(),
            errors: Vec::new(),
            retry_budget: 10,
            used_retries: 0,
            total_execution_time_s: 0.0,
        }
    }

    pub fn get_plan_item_mut(&mut self, id: &str) -> Option<&mut PlanItem> {
        self.plan.iter_mut().find(|p| p.id == id)
    }

    pub fn get_plan_item(&self, id: &str) -> Option<&PlanItem> {
        self.plan.iter().find(|p| p.id == id)
    }

    pub fn pending_steps(&self) -> impl Iterator<Item = &PlanItem> {
        self.plan.iter().filter(|p| p.status == StepStatus::Pending)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &PlanItem> {
        self.plan.iter().filter(|p| p.status == StepStatus::Failed)
    }

    pub fn running_gpu_count(&self) -> usize {
        self.plan
            .iter()
            .filter(|p| p.status == StepStatus::Running && p.requires_gpu)
            .count()
    }

    pub fn has_critical_errors(&self) -> bool {
        self.errors.iter().any(|e| e.severity == ErrorSeverity::Critical)
    }

    pub fn add_artifact(&mut self, artifact: ArtifactInfo) {
        self.artifacts.push(artifact);
        self.touch();
    }

    pub fn add_error(&mut self, error: ErrorRecord) {
        let is_critical = error.severity == ErrorSeverity::Critical;
        self.errors.push(error);
        if is_critical {
            self.status = SessionStatus::Failed;
        }
        self.touch();
    }

    pub fn dependencies_satisfied(&self, item: &PlanItem) -> bool {
        item.dependencies.iter().all(|dep| {
            self.get_plan_item(dep)
                .map(|p| p.status == StepStatus::Completed)
                .unwrap_or(false)
        })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
