//! Exponential backoff with jitter for provider retries.
//!
//! Adapted from `executor/retry.rs`'s `RetryConfig` — same shape, stripped of
//! the error-message-sniffing classifier since the router already knows
//! which errors are retryable from the breaker and LLM client types.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, initial_delay_ms: 250, backoff_factor: 2.0, max_delay_ms: 10_000 }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (0-indexed), with up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let base = base.min(self.max_delay_ms as f64);
        let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
        let with_jitter = (base * (1.0 + jitter_frac)).max(0.0);
        Duration::from_millis(with_jitter as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let config = RetryConfig { max_attempts: 5, initial_delay_ms: 100, backoff_factor: 2.0, max_delay_ms: 100_000 };
        let d0 = config.delay_for(0).as_millis();
        let d2 = config.delay_for(2).as_millis();
        assert!(d0 >= 80 && d0 <= 120, "d0={d0}");
        assert!(d2 >= 320 && d2 <= 480, "d2={d2}");
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig { max_attempts: 10, initial_delay_ms: 1000, backoff_factor: 2.0, max_delay_ms: 1500 };
        let d = config.delay_for(8).as_millis();
        assert!(d <= 1800);
    }
}
