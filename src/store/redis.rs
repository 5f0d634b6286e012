//! Redis counter store.
//!
//! The increment and the first-time expiry run inside one Lua script, so
//! Redis executes them as a single atomic step. Two callers racing on a
//! fresh key cannot both initialise it.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{info, warn};

use super::backend::{CounterStore, StoreError};

/// KEYS[1] = counter key, ARGV[1] = window length in milliseconds.
/// Returns the post-increment value.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Counter store shared by every instance connected to the same Redis.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("script_hash", &self.script.get_hash())
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to Redis at `url`, giving up after `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!("Connected to Redis counter store");

        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();

        self.script
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Redis increment failed");
                StoreError::Unavailable(e.to_string())
            })
    }
}
