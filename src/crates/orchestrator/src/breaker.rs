//! Circuit breaker (C4), one state machine per backend name.
//!
//! Grounded on `_CircuitBreaker` in `ai/adapters/router.py`. State does not
//! survive a process restart — a fresh breaker always starts closed, which
//! matches the original's in-memory behavior.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    state: State,
    failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_secs")]
    pub reset_timeout: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(30) }
    }
}

/// Registry of per-backend breakers, shared across the router.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<Mutex<BreakerState>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: DashMap::new() }
    }

    fn entry(&self, backend: &str) -> Arc<Mutex<BreakerState>> {
        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerState { state: State::Closed, failures: 0, opened_at: None })))
            .clone()
    }

    /// True if a call to `backend` should be admitted right now. A half-open
    /// probe is granted at most once per open period.
    pub fn before_request(&self, backend: &str) -> bool {
        let entry = self.entry(backend);
        let mut state = entry.lock();
        match state.state {
            State::Closed => true,
            State::HalfOpen => false,
            State::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    state.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn after_success(&self, backend: &str) {
        let entry = self.entry(backend);
        let mut state = entry.lock();
        state.state = State::Closed;
        state.failures = 0;
        state.opened_at = None;
    }

    pub fn after_failure(&self, backend: &str) {
        let entry = self.entry(backend);
        let mut state = entry.lock();
        match state.state {
            State::HalfOpen => {
                state.state = State::Open;
                state.opened_at = Some(Instant::now());
            }
            State::Closed => {
                state.failures += 1;
                if state.failures >= self.config.failure_threshold {
                    state.state = State::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            State::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold_failures() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        });

        for _ in 0..4 {
            assert!(registry.before_request("provider-a"));
            registry.after_failure("provider-a");
        }
        assert!(registry.before_request("provider-a"));
        registry.after_failure("provider-a");

        assert!(!registry.before_request("provider-a"));
    }

    #[test]
    fn half_open_probe_admits_exactly_once() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
        });

        assert!(registry.before_request("provider-a"));
        registry.after_failure("provider-a");
        assert!(!registry.before_request("provider-a"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.before_request("provider-a"));
        assert!(!registry.before_request("provider-a"));
    }

    #[test]
    fn success_resets_failure_count() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        registry.after_failure("provider-a");
        registry.after_failure("provider-a");
        registry.after_success("provider-a");

        for _ in 0..4 {
            assert!(registry.before_request("provider-a"));
            registry.after_failure("provider-a");
        }
        assert!(registry.before_request("provider-a"));
    }
}
