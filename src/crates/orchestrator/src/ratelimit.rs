//! Token-bucket rate limiter (C3), one bucket per tool name.
//!
//! Grounded on `_acquire_rate()` in `ai/graph/bridge.py`: the bucket is
//! persisted in the same sqlite database as the run-key store so limits are
//! shared across worker processes, not just in-process callers.

use crate::error::Result;
use sqlx::Row;
use std::time::Duration;

use crate::db::DatabasePool;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RateLimitConfig {
    pub rate_per_sec: f64,
    pub capacity: f64,
}

impl RateLimitConfig {
    pub fn new(rate_per_sec: f64) -> Self {
        Self { rate_per_sec, capacity: rate_per_sec }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(5.0)
    }
}

pub struct RateLimiter {
    pool: DatabasePool,
}

impl RateLimiter {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Block until a token for `tool` is available, replenishing the bucket
    /// by elapsed wall-clock time on every attempt.
    pub async fn acquire(&self, tool: &str, config: &RateLimitConfig) -> Result<()> {
        loop {
            if self.try_acquire(tool, config).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn try_acquire(&self, tool: &str, config: &RateLimitConfig) -> Result<bool> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT tokens, updated_at FROM rate_limits WHERE tool = ?")
            .bind(tool)
            .fetch_optional(&mut *tx)
            .await?;

        let (tokens, last_update) = match row {
            Some(row) => (row.try_get::<f64, _>("tokens")?, row.try_get::<f64, _>("updated_at")?),
            None => (config.capacity, now),
        };

        let elapsed = (now - last_update).max(0.0);
        let replenished = (tokens + elapsed * config.rate_per_sec).min(config.capacity);

        if replenished < 1.0 {
            sqlx::query(
                "INSERT INTO rate_limits (tool, tokens, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(tool) DO UPDATE SET tokens = excluded.tokens, updated_at = excluded.updated_at",
            )
            .bind(tool)
            .bind(replenished)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(false);
        }

        let remaining = replenished - 1.0;
        sqlx::query(
            "INSERT INTO rate_limits (tool, tokens, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(tool) DO UPDATE SET tokens = excluded.tokens, updated_at = excluded.updated_at",
        )
        .bind(tool)
        .bind(remaining)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConnection;

    async fn limiter() -> RateLimiter {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        conn.run_migrations().await.unwrap();
        RateLimiter::new(conn.pool().clone())
    }

    #[tokio::test]
    async fn drains_bucket_then_blocks_until_replenished() {
        let limiter = limiter().await;
        let config = RateLimitConfig { rate_per_sec: 20.0, capacity: 2.0 };

        assert!(limiter.try_acquire("sd_generate", &config).await.unwrap());
        assert!(limiter.try_acquire("sd_generate", &config).await.unwrap());
        assert!(!limiter.try_acquire("sd_generate", &config).await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire("sd_generate", &config).await.unwrap());
    }

    #[tokio::test]
    async fn buckets_are_independent_per_tool() {
        let limiter = limiter().await;
        let config = RateLimitConfig { rate_per_sec: 1.0, capacity: 1.0 };

        assert!(limiter.try_acquire("sd_generate", &config).await.unwrap());
        assert!(limiter.try_acquire("tts", &config).await.unwrap());
    }
}
