use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::store::{WindowOutcome, WindowStore, WindowStoreError};

/// Idle windows are garbage collected once every this many hits.
const GC_EVERY: u64 = 256;

#[derive(Debug, Default)]
struct Window {
    /// Sorted request timestamps (ms).
    hits: VecDeque<i64>,
    expires_at: i64,
}

/// Process-local window store. Each key is locked by its dashmap shard, so
/// concurrent checks for one identifier serialize.
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, Window>,
    calls: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Drop every window whose expiry has passed.
    pub fn purge_expired(&self, now_ms: i64) {
        self.windows.retain(|_, w| w.expires_at > now_ms);
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<WindowOutcome, WindowStoreError> {
        if self.calls.fetch_add(1, Ordering::Relaxed) % GC_EVERY == GC_EVERY - 1 {
            self.purge_expired(now_ms);
        }

        let mut window = self.windows.entry(key.to_string()).or_default();
        let cutoff = now_ms.saturating_sub(window_ms);
        while window.hits.front().is_some_and(|&t| t <= cutoff) {
            window.hits.pop_front();
        }

        let count = window.hits.len() as u32;
        let oldest = window.hits.front().copied();
        if count >= limit {
            return Ok(WindowOutcome {
                count,
                oldest_ms: oldest,
                recorded: false,
            });
        }

        let pos = window.hits.partition_point(|&t| t <= now_ms);
        window.hits.insert(pos, now_ms);
        window.expires_at = now_ms.saturating_add(window_ms);
        Ok(WindowOutcome {
            count,
            oldest_ms: window.hits.front().copied(),
            recorded: true,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prunes_entries_at_window_edge() {
        let store = MemoryWindowStore::new();
        store.hit("k", 1_000, 500, 10).await.unwrap();
        store.hit("k", 1_200, 500, 10).await.unwrap();

        // 1_000 sits exactly on the edge and is pruned.
        let outcome = store.hit("k", 1_500, 500, 10).await.unwrap();
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.oldest_ms, Some(1_200));
    }

    #[tokio::test]
    async fn rejected_hits_are_not_recorded() {
        let store = MemoryWindowStore::new();
        store.hit("k", 0, 1_000, 1).await.unwrap();
        let rejected = store.hit("k", 10, 1_000, 1).await.unwrap();
        assert!(!rejected.recorded);
        let again = store.hit("k", 20, 1_000, 1).await.unwrap();
        assert_eq!(again.count, 1);
    }

    #[tokio::test]
    async fn purge_drops_idle_windows() {
        let store = MemoryWindowStore::new();
        store.hit("a", 0, 100, 5).await.unwrap();
        store.hit("b", 90, 100, 5).await.unwrap();
        store.purge_expired(150);
        assert_eq!(store.tracked(), 1);
    }
}
