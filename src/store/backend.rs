//! Counter store trait for abstracting local and shared implementations.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failures reported by a counter store.
///
/// These are infrastructure failures. The limiter never maps them to an
/// admit or deny verdict on its own.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store did not answer within {0:?}")]
    Timeout(Duration),
}

/// Trait for counter store implementations.
///
/// This trait abstracts over the in-process `InMemoryCounterStore` and the
/// shared `RedisCounterStore` so the limiter can work with either.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the post-increment value.
    ///
    /// When the increment creates the key, its time-to-live is set to `ttl`
    /// as part of the same atomic step. Increments on an existing key leave
    /// its expiry untouched. For a given key the Nth caller observes N.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;
}
