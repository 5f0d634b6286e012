//! Fixed time windows and the per-rule window check.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::descriptor::RequestDescriptor;
use super::key::{CounterKey, KeyScope};
use super::rules::RateLimitRule;
use crate::config::LimiterConfig;
use crate::store::{CounterStore, StoreError};

/// Window length of a rate limit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateLimitTimeInterval {
    /// Per-minute rate limiting
    #[serde(alias = "minute")]
    Minute,
    /// Per-hour rate limiting
    #[serde(alias = "hour")]
    Hour,
}

/// How the bucket index of a window is derived from wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketMode {
    /// Whole windows since the Unix epoch. Every window gets its own id.
    #[default]
    Epoch,
    /// Minute-of-hour or hour-of-day (UTC). Ids repeat every hour / day,
    /// so windows 60 minutes or 24 hours apart share a key.
    Recycling,
}

impl RateLimitTimeInterval {
    /// Window length in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            RateLimitTimeInterval::Minute => 60,
            RateLimitTimeInterval::Hour => 3600,
        }
    }

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Name written into counter keys.
    pub fn name(&self) -> &'static str {
        match self {
            RateLimitTimeInterval::Minute => "MINUTE",
            RateLimitTimeInterval::Hour => "HOUR",
        }
    }

    /// Index of the window containing `now`.
    pub fn bucket(&self, now: DateTime<Utc>, mode: BucketMode) -> i64 {
        match mode {
            BucketMode::Epoch => now.timestamp().div_euclid(self.seconds() as i64),
            BucketMode::Recycling => match self {
                RateLimitTimeInterval::Minute => i64::from(now.minute()),
                RateLimitTimeInterval::Hour => i64::from(now.hour()),
            },
        }
    }

    /// Time left until the window containing `now` ends.
    pub fn duration_until_reset(&self, now: DateTime<Utc>) -> Duration {
        let window_ms = self.seconds() as i64 * 1000;
        let elapsed_ms = now.timestamp_millis().rem_euclid(window_ms);
        Duration::from_millis((window_ms - elapsed_ms) as u64)
    }
}

impl std::fmt::Display for RateLimitTimeInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one window check.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStatus {
    /// Counter the check incremented
    pub key: CounterKey,
    /// Post-increment counter value observed by this request
    pub count: u64,
    /// Allowed requests per window
    pub limit: u64,
    /// Requests left before the limit is reached
    pub remaining: u64,
    /// Time until the current window ends
    pub reset_after: Duration,
    /// Whether this request exceeded the limit
    pub should_limit: bool,
}

/// Checks a matched rule against its window counter.
///
/// Each check is exactly one atomic increment on the counter store. The
/// limiter holds no state of its own and is safe to share across tasks.
pub struct WindowLimiter {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    key_scope: KeyScope,
    bucket_mode: BucketMode,
    store_timeout: Duration,
}

impl WindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: &LimiterConfig) -> Self {
        Self {
            store,
            key_prefix: config.key_prefix.clone(),
            key_scope: config.key_scope,
            bucket_mode: config.bucket_mode,
            store_timeout: config.store_timeout(),
        }
    }

    /// Build the counter key `rule` uses for `descriptor` at `now`.
    pub fn counter_key(
        &self,
        rule: &RateLimitRule,
        descriptor: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> CounterKey {
        let interval = rule.time_interval;
        CounterKey::build(
            &self.key_prefix,
            self.key_scope,
            rule,
            descriptor,
            interval,
            interval.bucket(now, self.bucket_mode),
        )
    }

    /// Count this request against `rule`'s window and decide whether it
    /// exceeds the allowance.
    ///
    /// The request denies when the observed post-increment value is greater
    /// than `allowed_number_of_requests`. Store failures and timeouts are
    /// returned as-is.
    pub async fn check(
        &self,
        rule: &RateLimitRule,
        descriptor: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> Result<WindowStatus, StoreError> {
        let interval = rule.time_interval;
        let key = self.counter_key(rule, descriptor, now);

        trace!(key = %key, rule = %rule, "Checking window counter");

        let increment = self.store.increment(key.as_str(), interval.duration());
        let count = match tokio::time::timeout(self.store_timeout, increment).await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Counter store increment failed");
                return Err(e);
            }
            Err(_) => {
                warn!(key = %key, timeout = ?self.store_timeout, "Counter store increment timed out");
                return Err(StoreError::Timeout(self.store_timeout));
            }
        };

        if count == 1 {
            debug!(key = %key, ttl_secs = interval.seconds(), "Opened new window counter");
        }

        let limit = rule.allowed_number_of_requests;
        Ok(WindowStatus {
            key,
            count,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after: interval.duration_until_reset(now),
            should_limit: count > limit,
        })
    }
}
