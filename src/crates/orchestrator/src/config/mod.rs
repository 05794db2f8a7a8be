//! Orchestrator-wide configuration: the YAML `$include`/`${ENV:default}`
//! loader plus the aggregate [`OrchestratorConfig`] it populates.

pub mod loader;

pub use loader::{deep_merge, load_yaml_config, load_yaml_file};

use crate::breaker::CircuitBreakerConfig;
use crate::error::{OrchestratorError, Result};
use crate::gpulock::GpuLockConfig;
use crate::ratelimit::RateLimitConfig;
use crate::router::{ModelSpec, RoleRoute, RoutingPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use utils::config::ValidateConfig;

/// Bounds on a session's graph run: how many plan-step attempts it may take
/// before it is forced to `Failed` even with items still pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_max_parallel_gpu")]
    pub max_parallel_gpu: usize,
}

fn default_max_steps() -> u32 {
    20
}

fn default_retry_budget() -> u32 {
    10
}

fn default_max_parallel_gpu() -> usize {
    1
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            retry_budget: default_retry_budget(),
            max_parallel_gpu: default_max_parallel_gpu(),
        }
    }
}

/// Top-level configuration aggregate, loaded from a single YAML file via
/// [`loader::load_yaml_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub database_path: String,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub gpu_lock: GpuLockConfig,
    #[serde(default)]
    pub routing_policy: RoutingPolicy,
    #[serde(default)]
    pub roles: HashMap<String, RoleRoute>,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
}

fn default_checkpoint_dir() -> String {
    "./sessions".to_string()
}

impl OrchestratorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = loader::load_yaml_config(path.as_ref())
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        config.validate().map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        Ok(config)
    }
}

impl ValidateConfig for OrchestratorConfig {
    fn validate(&self) -> utils::Result<()> {
        if self.database_path.is_empty() {
            return Err(utils::UtilsError::ConfigError("database_path must not be empty".into()));
        }
        for (role, route) in &self.roles {
            if route.primary.provider.is_empty() {
                return Err(utils::UtilsError::ConfigError(format!("role '{role}' has no primary provider")));
            }
        }
        Ok(())
    }
}

/// Shorthand for wiring a single role with no fallback, used by tests and
/// minimal deployments that only run one provider.
pub fn single_provider_role(provider: &str, model: &str) -> RoleRoute {
    RoleRoute {
        primary: ModelSpec { provider: provider.to_string(), model: model.to_string(), temperature: None, max_tokens: None, system_prompt: None },
        fallback: Vec::new(),
    }
}
