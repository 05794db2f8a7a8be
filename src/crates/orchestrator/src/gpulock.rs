//! GPU fair-lock (C5): per-family FIFO mutual exclusion with a fairness window.
//!
//! Grounded on `_FamilyLock` in `ai/graph/gpu_lock.py`. A waiter is granted
//! the lock only when it is at the head of the queue, no one currently holds
//! the family, and at least `fairness_window` has elapsed since the previous
//! holder acquired — this stops a fast-cycling session from re-acquiring
//! ahead of a waiter that queued earlier but slightly later than a release.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

const FAIRNESS_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GpuLockConfig {
    #[serde(with = "duration_millis")]
    pub fairness_window: Duration,
}

impl Default for GpuLockConfig {
    fn default() -> Self {
        Self { fairness_window: FAIRNESS_WINDOW }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

struct FamilyState {
    holder: Option<String>,
    holder_acquired_at: Option<Instant>,
    queue: VecDeque<(String, oneshot::Sender<()>)>,
}

struct FamilyLock {
    state: Mutex<FamilyState>,
    fairness_window: Duration,
}

impl FamilyLock {
    fn new(fairness_window: Duration) -> Self {
        Self { state: Mutex::new(FamilyState { holder: None, holder_acquired_at: None, queue: VecDeque::new() }), fairness_window }
    }

    async fn acquire(&self, session_id: &str) {
        let rx = {
            let mut state = self.state.lock().await;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back((session_id.to_string(), tx));
            self.maybe_grant(&mut state);
            rx
        };
        let _ = rx.await;
    }

    async fn release(&self) {
        let mut state = self.state.lock().await;
        state.holder = None;
        state.holder_acquired_at = None;
        self.maybe_grant(&mut state);
    }

    fn maybe_grant(&self, state: &mut FamilyState) {
        if state.holder.is_some() {
            return;
        }
        let window_elapsed = state
            .holder_acquired_at
            .map(|t| t.elapsed() >= self.fairness_window)
            .unwrap_or(true);
        if !window_elapsed {
            return;
        }
        if let Some((session_id, tx)) = state.queue.pop_front() {
            state.holder = Some(session_id);
            state.holder_acquired_at = Some(Instant::now());
            let _ = tx.send(());
        }
    }
}

/// Registry of per-family locks. Cloneable handle shared across the bridge.
#[derive(Clone)]
pub struct GpuLock {
    families: Arc<DashMap<String, Arc<FamilyLock>>>,
    config: GpuLockConfig,
}

impl GpuLock {
    pub fn new() -> Self {
        Self::with_config(GpuLockConfig::default())
    }

    pub fn with_config(config: GpuLockConfig) -> Self {
        Self { families: Arc::new(DashMap::new()), config }
    }

    fn family(&self, name: &str) -> Arc<FamilyLock> {
        let window = self.config.fairness_window;
        self.families.entry(name.to_string()).or_insert_with(|| Arc::new(FamilyLock::new(window))).clone()
    }

    /// Acquire the named family's lock for `session_id`, returning a guard
    /// that releases it on drop.
    pub async fn acquire(&self, family: &str, session_id: &str) -> GpuLockGuard {
        let lock = self.family(family);
        lock.acquire(session_id).await;
        GpuLockGuard { lock }
    }
}

impl Default for GpuLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GpuLockGuard {
    lock: Arc<FamilyLock>,
}

impl Drop for GpuLockGuard {
    fn drop(&mut self) {
        let lock = self.lock.clone();
        tokio::spawn(async move {
            lock.release().await;
        });
    }
}

/// Maps an action name to the GPU family it contends on. Actions outside
/// this set do not require the lock at all.
pub fn gpu_family_for_action(action: &str) -> Option<&'static str> {
    match action {
        "txt2img" | "generate_image" | "img2img" => Some("sd"),
        "upscale" | "upscale_image" => Some("sd"),
        "generate_animation" | "generate_keyframes" | "interpolate_frames" | "render_animation" => Some("anim"),
        "avatar" | "style_transfer" => Some("sd"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn grants_are_fifo_and_mutually_exclusive() {
        let lock = GpuLock::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let g1 = lock.acquire("sd", "s1").await;
        let order2 = order.clone();
        let lock2 = lock.clone();
        let waiter = tokio::spawn(async move {
            let _g2 = lock2.acquire("sd", "s2").await;
            order2.lock().unwrap().push("s2");
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        order.lock().unwrap().push("s1-holds");
        drop(g1);
        waiter.await.unwrap();

        let seq = order.lock().unwrap().clone();
        assert_eq!(seq, vec!["s1-holds", "s2"]);
    }

    #[test]
    fn gpu_family_mapping_matches_known_actions() {
        assert_eq!(gpu_family_for_action("txt2img"), Some("sd"));
        assert_eq!(gpu_family_for_action("generate_animation"), Some("anim"));
        assert_eq!(gpu_family_for_action("transcribe_audio"), None);
    }
}
