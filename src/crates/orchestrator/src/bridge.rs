//! Tool invocation bridge (C7): translates a tool call into an ordered
//! sequence of StepSpecs and funnels each through the cross-cutting wrapping
//! pipeline (run-key check, rate-limit, GPU lock, timeout, backend call).
//!
//! Grounded on `run_tool()` in `ai/graph/bridge.py`, generalized from a
//! single-step call into a multi-step StepSpec sequence per tool.

use crate::error::{OrchestratorError, Result};
use crate::gpulock::{gpu_family_for_action, GpuLock};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::runkey::RunKeyStore;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub step_type: String,
    pub params: serde_json::Value,
    pub depends_on: Vec<String>,
}

impl StepSpec {
    fn new(name: &str, step_type: &str, params: serde_json::Value) -> Self {
        Self { name: name.to_string(), step_type: step_type.to_string(), params, depends_on: Vec::new() }
    }

    fn depends_on(mut self, steps: &[&str]) -> Self {
        self.depends_on = steps.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub outputs: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactResult {
    pub step_name: String,
    pub path: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub outputs: serde_json::Value,
    pub artifacts: Vec<ArtifactResult>,
    /// Stable idempotency/correlation id for this invocation: an MD5 hex
    /// digest over the canonical JSON of `{tool, params}`. Equal tool calls
    /// always derive the same id, in this process or any other.
    pub correlation_id: String,
}

/// Derives the correlation id for a tool call. `serde_json::Map` is a
/// `BTreeMap` in this workspace (the `preserve_order` feature is not
/// enabled), so `to_vec` already serializes object keys in sorted order —
/// the canonical form the digest is taken over.
fn correlation_id(tool: &str, params: &serde_json::Value) -> String {
    let workflow = serde_json::json!({"tool": tool, "params": params});
    let canonical = serde_json::to_vec(&workflow).expect("json values always serialize");
    format!("{:x}", md5::compute(canonical))
}

/// Backend that actually performs a step's work. Real image/speech/video/
/// upload backends are out-of-scope external collaborators; this crate ships
/// only the trait and a deterministic in-memory fixture for tests.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn execute(&self, name: &str, params: &serde_json::Value, timeout: Duration) -> Result<ToolOutcome>;
}

/// Deterministic fixture backend: echoes params back and, for well-known
/// step names, fabricates a plausible output path so artifact extraction has
/// something to find.
pub struct MockToolBackend;

#[async_trait]
impl ToolBackend for MockToolBackend {
    async fn execute(&self, name: &str, params: &serde_json::Value, _timeout: Duration) -> Result<ToolOutcome> {
        let outputs = match name {
            "generate_image" | "upscale_image" => serde_json::json!({"image_path": format!("/tmp/{name}.png")}),
            "render_animation" => serde_json::json!({"video_path": format!("/tmp/{name}.mp4")}),
            "synthesize_speech" | "save_audio" => serde_json::json!({"audio_path": format!("/tmp/{name}.wav")}),
            _ => params.clone(),
        };
        Ok(ToolOutcome { outputs })
    }
}

/// Builds the StepSpec sequence for a known tool call. Unknown tools get a
/// single pass-through step named after the tool itself.
pub fn plan_steps(tool: &str, params: &serde_json::Value) -> Vec<StepSpec> {
    match tool {
        "sd_generate" => vec![
            StepSpec::new("generate_image", "generate_image", params.clone()),
            StepSpec::new("save_artifact", "save_artifact", serde_json::json!({})).depends_on(&["generate_image"]),
        ],
        "upscale_image" => vec![
            StepSpec::new("load_image", "load_image", params.clone()),
            StepSpec::new("upscale_image", "upscale_image", params.clone()).depends_on(&["load_image"]),
            StepSpec::new("save_upscaled", "save_artifact", serde_json::json!({})).depends_on(&["upscale_image"]),
        ],
        "generate_animation" => vec![
            StepSpec::new("generate_keyframes", "generate_keyframes", params.clone()),
            StepSpec::new("interpolate_frames", "interpolate_frames", serde_json::json!({})).depends_on(&["generate_keyframes"]),
            StepSpec::new("render_animation", "render_animation", serde_json::json!({})).depends_on(&["interpolate_frames"]),
        ],
        "transcribe_audio" => vec![
            StepSpec::new("load_audio", "load_audio", params.clone()),
            StepSpec::new("transcribe_audio", "transcribe_audio", serde_json::json!({})).depends_on(&["load_audio"]),
            StepSpec::new("format_segments", "format_segments", serde_json::json!({})).depends_on(&["transcribe_audio"]),
        ],
        "synthesize_speech" => vec![
            StepSpec::new("prepare_text", "prepare_text", params.clone()),
            StepSpec::new("synthesize_speech", "synthesize_speech", serde_json::json!({})).depends_on(&["prepare_text"]),
            StepSpec::new("save_audio", "save_artifact", serde_json::json!({})).depends_on(&["synthesize_speech"]),
        ],
        "upload_file" => {
            let destination = params.get("destination").and_then(|v| v.as_str()).unwrap_or("local");
            let step = if destination == "telegram" { "upload_telegram" } else { "upload_local" };
            vec![StepSpec::new(step, "upload", params.clone())]
        }
        other => vec![StepSpec::new(other, "pass_through", params.clone())],
    }
}

fn artifact_kind_mime(key: &str) -> Option<&'static str> {
    match key {
        "image_path" => Some("image/png"),
        "video_path" => Some("video/mp4"),
        "audio_path" => Some("audio/wav"),
        _ => None,
    }
}

fn extract_artifacts(step_name: &str, outputs: &serde_json::Value) -> Vec<ArtifactResult> {
    let mut artifacts = Vec::new();
    if let Some(map) = outputs.as_object() {
        for (key, value) in map {
            if let (Some(mime_type), Some(path)) = (artifact_kind_mime(key), value.as_str()) {
                artifacts.push(ArtifactResult { step_name: step_name.to_string(), path: path.to_string(), mime_type: mime_type.to_string() });
            }
        }
    }
    artifacts
}

pub struct ToolBridge {
    backend: Box<dyn ToolBackend>,
    run_keys: RunKeyStore,
    rate_limiter: RateLimiter,
    gpu_lock: GpuLock,
    rate_limits: HashMap<String, RateLimitConfig>,
    default_timeout: Duration,
    schemas: Option<SchemaRegistry>,
}

impl ToolBridge {
    pub fn new(backend: Box<dyn ToolBackend>, run_keys: RunKeyStore, rate_limiter: RateLimiter, gpu_lock: GpuLock) -> Self {
        Self {
            backend,
            run_keys,
            rate_limiter,
            gpu_lock,
            rate_limits: HashMap::new(),
            default_timeout: Duration::from_secs(300),
            schemas: None,
        }
    }

    pub fn with_rate_limit(mut self, tool: impl Into<String>, config: RateLimitConfig) -> Self {
        self.rate_limits.insert(tool.into(), config);
        self
    }

    /// Validates every call's parameters against this registry before it is
    /// translated into steps. A tool absent from the registry is unchecked.
    pub fn with_schema_registry(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = Some(schemas);
        self
    }

    fn rate_limit_for(&self, tool: &str) -> RateLimitConfig {
        self.rate_limits.get(tool).cloned().unwrap_or_default()
    }

    /// Run every step of `tool`'s plan in dependency order, wrapping each in
    /// run-key, rate-limit, GPU lock and timeout, and returns the combined
    /// outputs with extracted artifacts.
    pub async fn invoke(&self, session_id: &str, step_index_base: usize, tool: &str, params: &serde_json::Value) -> Result<ToolResult> {
        if let Some(schemas) = &self.schemas {
            schemas.validate(tool, params)?;
        }

        let correlation_id = correlation_id(tool, params);

        let mut steps = plan_steps(tool, params);
        steps.sort_by(|a, b| a.name.cmp(&b.name));
        let steps = topological_order(steps)?;

        let mut combined = serde_json::Map::new();
        let mut artifacts = Vec::new();

        for (offset, step) in steps.iter().enumerate() {
            let outcome = self.run_step(session_id, step_index_base + offset, step).await?;
            artifacts.extend(extract_artifacts(&step.name, &outcome.outputs));
            if let Some(map) = outcome.outputs.as_object() {
                for (k, v) in map {
                    combined.insert(k.clone(), v.clone());
                }
            }
        }

        Ok(ToolResult { outputs: serde_json::Value::Object(combined), artifacts, correlation_id })
    }

    async fn run_step(&self, session_id: &str, step_index: usize, step: &StepSpec) -> Result<ToolOutcome> {
        let run_key = RunKeyStore::key(session_id, &step.name, step_index);

        if let Some(cached) = self.run_keys.get::<ToolOutcome>(&run_key).await? {
            return Ok(cached);
        }

        let rate_config = self.rate_limit_for(&step.name);
        self.rate_limiter.acquire(&step.name, &rate_config).await?;

        let _gpu_guard = match gpu_family_for_action(&step.step_type) {
            Some(family) => Some(self.gpu_lock.acquire(family, session_id).await),
            None => None,
        };

        let result = tokio::time::timeout(self.default_timeout, self.backend.execute(&step.name, &step.params, self.default_timeout))
            .await
            .map_err(|_| OrchestratorError::Timeout(step.name.clone(), self.default_timeout))??;

        self.run_keys.put(&run_key, &result).await
    }
}

/// Sorts steps so every dependency precedes its dependents. Ties among
/// independent steps keep the caller's (already name-sorted) order.
fn topological_order(steps: Vec<StepSpec>) -> Result<Vec<StepSpec>> {
    let mut remaining = steps;
    let mut ordered = Vec::new();
    let mut done: Vec<String> = Vec::new();

    while !remaining.is_empty() {
        let ready_idx = remaining
            .iter()
            .position(|s| s.depends_on.iter().all(|d| done.contains(d)))
            .ok_or_else(|| OrchestratorError::Validation("cyclic step dependencies".to_string()))?;
        let step = remaining.remove(ready_idx);
        done.push(step.name.clone());
        ordered.push(step);
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConnection;
    use proptest::prelude::*;

    async fn bridge() -> ToolBridge {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        conn.run_migrations().await.unwrap();
        let run_keys = RunKeyStore::new(conn.pool().clone());
        let rate_limiter = RateLimiter::new(conn.pool().clone());
        ToolBridge::new(Box::new(MockToolBackend), run_keys, rate_limiter, GpuLock::new())
    }

    #[test]
    fn sd_generate_expands_to_generate_then_save() {
        let steps = plan_steps("sd_generate", &serde_json::json!({"prompt": "a cat"}));
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].depends_on, vec!["generate_image".to_string()]);
    }

    #[test]
    fn unknown_tool_is_single_pass_through() {
        let steps = plan_steps("totally_unknown_tool", &serde_json::json!({}));
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, "pass_through");
    }

    #[test]
    fn equal_tool_calls_produce_equal_step_sequences() {
        let a = plan_steps("generate_animation", &serde_json::json!({"prompt": "x"}));
        let b = plan_steps("generate_animation", &serde_json::json!({"prompt": "x"}));
        let names_a: Vec<_> = a.iter().map(|s| s.name.clone()).collect();
        let names_b: Vec<_> = b.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names_a, names_b);
    }

    #[tokio::test]
    async fn invoke_rejects_params_failing_schema_validation() {
        let bridge = bridge().await.with_schema_registry(crate::schema::SchemaRegistry::with_builtin_tools());
        let result = bridge.invoke("s1", 0, "sd_generate", &serde_json::json!({"steps": 20})).await;
        assert!(matches!(result, Err(OrchestratorError::Schema(_))));
    }

    #[tokio::test]
    async fn invoke_extracts_image_artifact() {
        let bridge = bridge().await;
        let result = bridge.invoke("s1", 0, "sd_generate", &serde_json::json!({"prompt": "a cat"})).await.unwrap();
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].mime_type, "image/png");
    }

    #[test]
    fn correlation_id_is_a_stable_32_char_hex_digest() {
        let params = serde_json::json!({"prompt": "a cat", "width": 512});
        let a = correlation_id("sd_generate", &params);
        let b = correlation_id("sd_generate", &params);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn correlation_id_is_stable_regardless_of_key_construction_order() {
        // Two `serde_json::Value`s built with the same keys in different
        // insertion order must still hash to the same id: canonicalization
        // must not depend on call-site key order.
        let a = serde_json::json!({"prompt": "a cat", "steps": 20});
        let mut map = serde_json::Map::new();
        map.insert("steps".to_string(), serde_json::json!(20));
        map.insert("prompt".to_string(), serde_json::json!("a cat"));
        let b = serde_json::Value::Object(map);

        assert_eq!(correlation_id("sd_generate", &a), correlation_id("sd_generate", &b));
    }

    #[test]
    fn correlation_id_differs_for_different_tools_or_params() {
        let params = serde_json::json!({"prompt": "a cat"});
        assert_ne!(correlation_id("sd_generate", &params), correlation_id("upscale_image", &params));
        assert_ne!(
            correlation_id("sd_generate", &params),
            correlation_id("sd_generate", &serde_json::json!({"prompt": "a dog"}))
        );
    }

    #[tokio::test]
    async fn invoke_attaches_a_stable_correlation_id() {
        let bridge = bridge().await;
        let params = serde_json::json!({"prompt": "a cat"});
        let first = bridge.invoke("s1", 0, "sd_generate", &params).await.unwrap();
        let second = bridge.invoke("s2", 0, "sd_generate", &params).await.unwrap();
        assert_eq!(first.correlation_id, second.correlation_id);
        assert_eq!(first.correlation_id, correlation_id("sd_generate", &params));
    }

    #[tokio::test]
    async fn repeated_invoke_is_idempotent() {
        let bridge = bridge().await;
        let first = bridge.invoke("s1", 0, "upload_file", &serde_json::json!({"destination": "local"})).await.unwrap();
        let second = bridge.invoke("s1", 0, "upload_file", &serde_json::json!({"destination": "local"})).await.unwrap();
        assert_eq!(first.outputs, second.outputs);
    }

    proptest! {
        /// A chain `step_0 <- step_1 <- ... <- step_n` fed in any shuffled
        /// order must always come back with every step after its dependency.
        #[test]
        fn topological_order_respects_declared_dependencies(shuffle_seed in 0u64..1000, chain_len in 1usize..8) {
            let mut steps: Vec<StepSpec> = (0..chain_len)
                .map(|i| {
                    let name = format!("step_{i}");
                    let mut step = StepSpec::new(&name, "noop", serde_json::json!({}));
                    if i > 0 {
                        step = step.depends_on(&[format!("step_{}", i - 1).as_str()]);
                    }
                    step
                })
                .collect();

            // Deterministic pseudo-shuffle so the same seed always reorders the
            // same way, keeping proptest's shrinker well-behaved.
            let mut rng_state = shuffle_seed.wrapping_add(1);
            for i in (1..steps.len()).rev() {
                rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
                let j = (rng_state >> 33) as usize % (i + 1);
                steps.swap(i, j);
            }

            let ordered = topological_order(steps).expect("acyclic chain must order");
            let positions: std::collections::HashMap<&str, usize> =
                ordered.iter().enumerate().map(|(idx, s)| (s.name.as_str(), idx)).collect();

            for step in &ordered {
                for dep in &step.depends_on {
                    prop_assert!(positions[dep.as_str()] < positions[step.name.as_str()]);
                }
            }
        }
    }
}
