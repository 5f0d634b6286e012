//! In-process counter store.
//!
//! Limits enforced through this store are per-process, not shared across
//! instances. It is the default backend for single-node deployments and the
//! store used throughout the test suite.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{CounterStore, StoreError};

/// A single window counter and the instant it stops counting.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

impl CounterEntry {
    fn fresh(now: Instant, ttl: Duration) -> Self {
        Self {
            count: 0,
            expires_at: now + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counter store backed by a sharded concurrent map.
///
/// An increment holds the shard lock of its key for the whole
/// create-or-reset-then-add step, so concurrent callers on one key observe
/// distinct, gapless values.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, CounterEntry>,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a live counter, or `None` if it is absent or expired.
    pub fn current(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Spawn a background task that purges expired entries every `every`.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped.
    pub fn spawn_janitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::fresh(now, ttl));

        if entry.is_expired(now) {
            trace!(key = %key, "Counter expired, starting a new window");
            *entry = CounterEntry::fresh(now, ttl);
        }

        entry.count += 1;
        Ok(entry.count)
    }
}
