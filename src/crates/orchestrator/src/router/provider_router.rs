//! Provider router (C6): role-based primary+fallback cascade over `ChatModel`s.
//!
//! Grounded on `_Router`/`get_provider_for_request` in `ai/adapters/router.py`,
//! generalized from a single-provider-by-name lookup to a per-role fallback
//! chain wrapped in retry and [`CircuitBreakerRegistry`].

use crate::breaker::CircuitBreakerRegistry;
use crate::error::OrchestratorError;
use crate::router::retry::RetryConfig;
use dashmap::DashMap;
use llm::{ChatModel, ChatRequest, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::sleep;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRoute {
    pub primary: ModelSpec,
    #[serde(default)]
    pub fallback: Vec<ModelSpec>,
}

impl RoleRoute {
    /// Every candidate in cascade order: primary first, then fallbacks.
    fn levels(&self) -> Vec<ModelSpec> {
        std::iter::once(self.primary.clone()).chain(self.fallback.iter().cloned()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingPolicy {
    ComplexityBased,
    CostOptimized,
    SpeedOptimized,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        RoutingPolicy::ComplexityBased
    }
}

impl RoutingPolicy {
    /// Reorder cascade levels per policy. Retry semantics within a level are
    /// unaffected; this only changes which level is tried first.
    fn order(&self, levels: Vec<ModelSpec>) -> Vec<ModelSpec> {
        match self {
            RoutingPolicy::ComplexityBased => levels,
            RoutingPolicy::CostOptimized => levels.into_iter().rev().collect(),
            RoutingPolicy::SpeedOptimized => {
                let (local, remote): (Vec<_>, Vec<_>) =
                    levels.into_iter().partition(|spec| spec.provider.starts_with("local"));
                local.into_iter().chain(remote).collect()
            }
        }
    }
}

/// Registry of named `ChatModel` backends a [`ModelSpec::provider`] addresses.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Box<dyn ChatModel>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Box<dyn ChatModel>) {
        self.providers.insert(name.into(), provider);
    }

    fn get(&self, name: &str) -> Option<&dyn ChatModel> {
        self.providers.get(name).map(|p| p.as_ref())
    }
}

pub struct ProviderRouter {
    routes: DashMap<String, RoleRoute>,
    registry: ProviderRegistry,
    breakers: CircuitBreakerRegistry,
    retry: RetryConfig,
    policy: RoutingPolicy,
}

impl ProviderRouter {
    pub fn new(registry: ProviderRegistry, breakers: CircuitBreakerRegistry) -> Self {
        Self { routes: DashMap::new(), registry, breakers, retry: RetryConfig::default(), policy: RoutingPolicy::default() }
    }

    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn set_route(&self, role: impl Into<String>, route: RoleRoute) {
        self.routes.insert(role.into(), route);
    }

    /// Run the full primary+fallback cascade for `role`.
    pub async fn invoke(&self, role: &str, messages: Vec<Message>) -> Result<llm::ChatResponse, OrchestratorError> {
        let levels = {
            let route = self.routes.get(role).ok_or_else(|| OrchestratorError::Configuration(format!("no route for role {role}")))?;
            self.policy.order(route.levels())
        };

        let mut last_err: Option<OrchestratorError> = None;
        for spec in &levels {
            match self.invoke_level(spec, &messages).await {
                Ok(response) => return Ok(response),
                Err(err) => last_err = Some(err),
            }
        }
        Err(OrchestratorError::AllFallbacksFailed(last_err.map(|e| e.to_string()).unwrap_or_else(|| role.to_string())))
    }

    async fn invoke_level(&self, spec: &ModelSpec, messages: &[Message]) -> Result<llm::ChatResponse, OrchestratorError> {
        if !self.breakers.before_request(&spec.provider) {
            return Err(OrchestratorError::CircuitOpen(spec.provider.clone()));
        }

        let model = self
            .registry
            .get(&spec.provider)
            .ok_or_else(|| OrchestratorError::Configuration(format!("provider {} not registered", spec.provider)))?;

        let mut request = ChatRequest::new(messages.to_vec());
        if let Some(t) = spec.temperature {
            request = request.with_temperature(t);
        }
        request.config.max_tokens = spec.max_tokens;

        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                sleep(self.retry.delay_for(attempt - 1)).await;
            }
            match model.chat(request.clone()).await {
                Ok(response) => {
                    self.breakers.after_success(&spec.provider);
                    return Ok(response);
                }
                Err(err) => {
                    last_err = Some(err);
                }
            }
        }

        self.breakers.after_failure(&spec.provider);
        Err(OrchestratorError::ToolFailed(last_err.map(|e| e.to_string()).unwrap_or_else(|| spec.provider.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llm::{ChatResponse, Result as LlmResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct FlakyModel {
        calls: Arc<AtomicUsize>,
        fail_times: usize,
    }

    #[async_trait]
    impl ChatModel for FlakyModel {
        async fn chat(&self, _request: ChatRequest) -> LlmResult<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(llm::LlmError::ProviderError("simulated failure".into()));
            }
            Ok(ChatResponse { message: Message::assistant("ok"), usage: None, metadata: Default::default() })
        }

        fn clone_box(&self) -> Box<dyn ChatModel> {
            Box::new(self.clone())
        }
    }

    fn spec(provider: &str) -> ModelSpec {
        ModelSpec { provider: provider.into(), model: "test".into(), temperature: None, max_tokens: None, system_prompt: None }
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_a_level() {
        let mut registry = ProviderRegistry::new();
        registry.register("primary", Box::new(FlakyModel { calls: Arc::new(AtomicUsize::new(0)), fail_times: 1 }));

        let router = ProviderRouter::new(registry, CircuitBreakerRegistry::new(Default::default()))
            .with_retry(RetryConfig { max_attempts: 3, initial_delay_ms: 1, backoff_factor: 1.0, max_delay_ms: 5 });
        router.set_route("writer", RoleRoute { primary: spec("primary"), fallback: vec![] });

        let response = router.invoke("writer", vec![Message::human("hi")]).await.unwrap();
        assert_eq!(response.message.content, "ok");
    }

    #[tokio::test]
    async fn falls_back_when_primary_exhausts_retries() {
        let mut registry = ProviderRegistry::new();
        registry.register("primary", Box::new(FlakyModel { calls: Arc::new(AtomicUsize::new(0)), fail_times: 99 }));
        registry.register("fallback", Box::new(FlakyModel { calls: Arc::new(AtomicUsize::new(0)), fail_times: 0 }));

        let router = ProviderRouter::new(registry, CircuitBreakerRegistry::new(Default::default()))
            .with_retry(RetryConfig { max_attempts: 1, initial_delay_ms: 1, backoff_factor: 1.0, max_delay_ms: 5 });
        router.set_route("writer", RoleRoute { primary: spec("primary"), fallback: vec![spec("fallback")] });

        let response = router.invoke("writer", vec![Message::human("hi")]).await.unwrap();
        assert_eq!(response.message.content, "ok");
    }

    #[tokio::test]
    async fn all_fallbacks_exhausted_raises() {
        let mut registry = ProviderRegistry::new();
        registry.register("primary", Box::new(FlakyModel { calls: Arc::new(AtomicUsize::new(0)), fail_times: 99 }));

        let router = ProviderRouter::new(registry, CircuitBreakerRegistry::new(Default::default()))
            .with_retry(RetryConfig { max_attempts: 1, initial_delay_ms: 1, backoff_factor: 1.0, max_delay_ms: 5 });
        router.set_route("writer", RoleRoute { primary: spec("primary"), fallback: vec![] });

        let err = router.invoke("writer", vec![Message::human("hi")]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AllFallbacksFailed(_)));
    }

    #[test]
    fn cost_optimized_prefers_deepest_fallback_first() {
        let route = RoleRoute { primary: spec("a"), fallback: vec![spec("b"), spec("c")] };
        let ordered = RoutingPolicy::CostOptimized.order(route.levels());
        assert_eq!(ordered[0].provider, "c");
        assert_eq!(ordered[2].provider, "a");
    }

    #[test]
    fn speed_optimized_prefers_local_provider_first() {
        let route = RoleRoute { primary: spec("remote-openai"), fallback: vec![spec("local-ollama")] };
        let ordered = RoutingPolicy::SpeedOptimized.order(route.levels());
        assert_eq!(ordered[0].provider, "local-ollama");
    }
}
