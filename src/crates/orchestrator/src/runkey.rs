//! Run-key store (C2): exactly-once bookkeeping for tool invocations.
//!
//! Grounded on the `run_keys` table in `ai/graph/bridge.py`. A run key is
//! `session_id:action:step_index`; once a row exists for a key, every later
//! caller gets back the first writer's payload instead of re-invoking the
//! backend.

use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::Row;

use crate::db::DatabasePool;

pub struct RunKeyStore {
    pool: DatabasePool,
}

impl RunKeyStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn key(session_id: &str, action: &str, step_index: usize) -> String {
        format!("{session_id}:{action}:{step_index}")
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row = sqlx::query("SELECT result_json FROM run_keys WHERE run_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.try_get("result_json")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Insert a result for `key`. On conflict (another writer raced us),
    /// discards our payload and returns the canonical one already stored.
    pub async fn put<T: Serialize + DeserializeOwned>(&self, key: &str, payload: &T) -> Result<T> {
        let json = serde_json::to_string(payload)?;
        let now = chrono::Utc::now().to_rfc3339();

        let inserted = sqlx::query(
            "INSERT INTO run_keys (run_key, result_json, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(run_key) DO NOTHING",
        )
        .bind(key)
        .bind(&json)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(serde_json::from_str(&json)?);
        }

        // Lost the race: read back the canonical value.
        self.get(key)
            .await?
            .ok_or_else(|| crate::error::OrchestratorError::Validation(format!("run key '{key}' vanished after conflict")))
    }
}
