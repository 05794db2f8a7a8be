//! Delta checkpoint store (C1).
//!
//! Grounded on `ai/graph/checkpoint.py`'s `DeltaCheckpointer`: one append-only
//! JSON-Lines journal per session, written as a shallow key-wise diff against
//! the last known state, with tmp-file-then-rename atomic writes so a crash
//! mid-write never leaves a readable partial record.

use crate::error::{OrchestratorError, Result};
use crate::model::Session;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    id: String,
    ts: chrono::DateTime<chrono::Utc>,
    delta: serde_json::Map<String, serde_json::Value>,
}

struct SessionCache {
    last_state: Option<serde_json::Value>,
    seq: u64,
}

/// Per-session exclusive access to the journal, plus a cache of the last
/// written state used to compute the next delta.
pub struct CheckpointStore {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<SessionCache>>>>>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), locks: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn journal_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<SessionCache>> {
        let mut locks = self.locks.lock();
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(SessionCache { last_state: None, seq: 0 }))
            })
            .clone()
    }

    /// Replay the journal and reconstruct the latest state, or `None` if no
    /// session with this id has ever been checkpointed. Corrupt lines are
    /// skipped rather than aborting the whole replay.
    pub async fn read(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.journal_path(session_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut acc = serde_json::Map::new();
        let mut last_seq = 0u64;
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointRecord>(line) {
                Ok(record) => {
                    for (k, v) in record.delta {
                        acc.insert(k, v);
                    }
                    last_seq += 1;
                }
                Err(e) => {
                    tracing::warn!(session_id, lineno, error = %e, "skipping corrupt checkpoint line");
                }
            }
        }

        if acc.is_empty() {
            return Ok(None);
        }

        let value = serde_json::Value::Object(acc);
        let session: Session = serde_json::from_value(value.clone())
            .map_err(|e| OrchestratorError::Validation(format!("checkpoint replay for '{session_id}' did not produce a valid session: {e}")))?;

        let cache = self.session_lock(session_id);
        let mut guard = cache.lock().await;
        guard.last_state = Some(value);
        guard.seq = last_seq;

        Ok(Some(session))
    }

    /// Compute the diff against the last persisted state and append it to
    /// the journal. A no-op if nothing changed since the last write.
    pub async fn write(&self, session: &Session) -> Result<()> {
        let new_value = serde_json::to_value(session)?;
        let cache = self.session_lock(&session.session_id);
        let mut guard = cache.lock().await;

        let delta = match &guard.last_state {
            Some(prev) => dict_diff(prev, &new_value),
            None => match &new_value {
                serde_json::Value::Object(map) => map.clone(),
                _ => return Err(OrchestratorError::Validation("session did not serialize to an object".into())),
            },
        };

        if delta.is_empty() {
            return Ok(());
        }

        guard.seq += 1;
        let record = CheckpointRecord {
            id: format!("{}:{}", session.session_id, guard.seq),
            ts: chrono::Utc::now(),
            delta,
        };

        append_atomic(&self.journal_path(&session.session_id), &record).await?;
        guard.last_state = Some(new_value);
        Ok(())
    }
}

/// Shallow key-wise diff: every top-level key whose value changed (or is
/// new) is included whole; unchanged keys are omitted.
fn dict_diff(
    prev: &serde_json::Value,
    next: &serde_json::Value,
) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    let (prev_map, next_map) = match (prev, next) {
        (serde_json::Value::Object(p), serde_json::Value::Object(n)) => (p, n),
        _ => return out,
    };
    for (k, v) in next_map {
        if prev_map.get(k) != Some(v) {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

async fn append_atomic(path: &Path, record: &CheckpointRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut existing = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut line = serde_json::to_vec(record)?;
    existing.append(&mut line);
    existing.push(b'\n');

    let tmp_path = path.with_extension("jsonl.tmp");
    {
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(&existing).await?;
        tmp.sync_all().await?;
    }
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserContext;
    use crate::model::UserRole;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let session = Session::new("s1", "/img cat", UserContext::new("u1", UserRole::User));

        store.write(&session).await.unwrap();
        let reloaded = store.read("s1").await.unwrap().unwrap();
        assert_eq!(reloaded.session_id, "s1");
        assert_eq!(reloaded.goal, "/img cat");
    }

    #[tokio::test]
    async fn unchanged_write_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let session = Session::new("s1", "goal", UserContext::new("u1", UserRole::User));

        store.write(&session).await.unwrap();
        let path = store.journal_path("s1");
        let size_after_first = fs::metadata(&path).await.unwrap().len();

        store.write(&session).await.unwrap();
        let size_after_second = fs::metadata(&path).await.unwrap().len();
        assert_eq!(size_after_first, size_after_second);
    }

    #[tokio::test]
    async fn missing_session_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.read("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_line_is_skipped_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut session = Session::new("s1", "goal", UserContext::new("u1", UserRole::User));
        store.write(&session).await.unwrap();

        session.current_step = 1;
        store.write(&session).await.unwrap();

        let path = store.journal_path("s1");
        let mut contents = fs::read_to_string(&path).await.unwrap();
        contents.push_str("not valid json\n");
        fs::write(&path, contents).await.unwrap();

        let reloaded = store.read("s1").await.unwrap().unwrap();
        assert_eq!(reloaded.current_step, 1);
    }
}
