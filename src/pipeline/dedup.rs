//! Duplicate-greeting guard.
//!
//! Process-local and best-effort: remembers when each sender last sent a
//! bare greeting and suppresses a repeat inside the window. Multi-instance
//! deployments need a shared store for this to hold across processes.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DedupConfig;

struct Inner {
    /// sender key → last seen (ms since epoch)
    seen: HashMap<String, i64>,
    last_eviction_ms: i64,
}

/// In-memory suppression map for rapid-fire duplicate greetings.
pub struct DedupGuard {
    window_ms: i64,
    eviction_age_ms: i64,
    inner: Mutex<Inner>,
}

/// Key identifying one participant on one channel account.
pub fn sender_key(tenant_id: &str, channel_account: &str, participant: &str) -> String {
    format!("{tenant_id}:{channel_account}:{participant}")
}

impl DedupGuard {
    pub fn new(config: &DedupConfig) -> Self {
        let window_ms = duration_ms(config.window);
        Self {
            window_ms,
            eviction_age_ms: window_ms.saturating_mul(i64::from(config.eviction_multiple.max(1))),
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                last_eviction_ms: 0,
            }),
        }
    }

    /// Whether a message from `key` at `now_ms` repeats one inside the window.
    pub async fn should_suppress(&self, key: &str, now_ms: i64) -> bool {
        let inner = self.inner.lock().await;
        inner
            .seen
            .get(key)
            .is_some_and(|last| now_ms.saturating_sub(*last) < self.window_ms)
    }

    /// Remember that `key` was seen at `now_ms`.
    pub async fn record(&self, key: &str, now_ms: i64) {
        let mut inner = self.inner.lock().await;
        inner.seen.insert(key.to_string(), now_ms);
        self.maybe_evict(&mut inner, now_ms);
    }

    /// Check and record in one step. Returns true when the message should be
    /// suppressed; the timestamp is recorded either way.
    pub async fn check_and_record(&self, key: &str, now_ms: i64) -> bool {
        let mut inner = self.inner.lock().await;
        let suppress = inner
            .seen
            .get(key)
            .is_some_and(|last| now_ms.saturating_sub(*last) < self.window_ms);
        inner.seen.insert(key.to_string(), now_ms);
        self.maybe_evict(&mut inner, now_ms);
        suppress
    }

    /// Drop entries older than the eviction age. Returns how many were removed.
    pub async fn evict(&self, now_ms: i64) -> usize {
        let mut inner = self.inner.lock().await;
        self.evict_locked(&mut inner, now_ms)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.seen.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn maybe_evict(&self, inner: &mut Inner, now_ms: i64) {
        if now_ms.saturating_sub(inner.last_eviction_ms) >= self.eviction_age_ms {
            self.evict_locked(inner, now_ms);
        }
    }

    fn evict_locked(&self, inner: &mut Inner, now_ms: i64) -> usize {
        let before = inner.seen.len();
        let max_age = self.eviction_age_ms;
        inner
            .seen
            .retain(|_, last| now_ms.saturating_sub(*last) < max_age);
        inner.last_eviction_ms = now_ms;
        let removed = before - inner.seen.len();
        if removed > 0 {
            debug!(removed, remaining = inner.seen.len(), "Dedup entries evicted");
        }
        removed
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> DedupGuard {
        DedupGuard::new(&DedupConfig {
            window: Duration::from_secs(10),
            eviction_multiple: 6,
        })
    }

    #[tokio::test]
    async fn repeat_inside_window_is_suppressed() {
        let guard = guard();
        let key = sender_key("t1", "620000", "6281");
        assert!(!guard.check_and_record(&key, 1_000).await);
        assert!(guard.check_and_record(&key, 5_000).await);
    }

    #[tokio::test]
    async fn repeat_after_window_passes() {
        let guard = guard();
        let key = sender_key("t1", "620000", "6281");
        guard.record(&key, 1_000).await;
        assert!(!guard.should_suppress(&key, 11_000).await);
    }

    #[tokio::test]
    async fn senders_are_independent() {
        let guard = guard();
        guard.record(&sender_key("t1", "620000", "6281"), 1_000).await;
        assert!(!guard.should_suppress(&sender_key("t1", "620000", "6282"), 1_500).await);
        assert!(!guard.should_suppress(&sender_key("t2", "620000", "6281"), 1_500).await);
    }

    #[tokio::test]
    async fn old_entries_evicted() {
        let guard = guard();
        guard.record("a", 0).await;
        guard.record("b", 50_000).await;
        // 60s eviction age: "a" is 70s old, "b" 20s.
        let removed = guard.evict(70_000).await;
        assert_eq!(removed, 1);
        assert_eq!(guard.len().await, 1);
    }

    #[tokio::test]
    async fn recording_triggers_periodic_eviction() {
        let guard = guard();
        guard.record("a", 0).await;
        guard.record("b", 120_000).await;
        assert_eq!(guard.len().await, 1);
    }
}
