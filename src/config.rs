//! Configuration management for ratewarden.
//!
//! Settings come from an optional file (format picked by extension) with
//! `RATEWARDEN_*` environment variables layered on top, e.g.
//! `RATEWARDEN_STORE__BACKEND=redis`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::ratelimit::{BucketMode, KeyScope, RateLimitRule, RuleSet};

const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for ratewarden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Key and window configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Path to a YAML rule file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Rules defined inline, appended after those from `rules_path`
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Per-process counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How often the in-memory store purges expired counters, in seconds
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout(),
            janitor_interval_secs: default_janitor_interval(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_janitor_interval() -> u64 {
    30
}

/// Counter key and window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// First segment of every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub bucket_mode: BucketMode,

    #[serde(default)]
    pub key_scope: KeyScope,

    /// Upper bound on one counter store round trip, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            bucket_mode: BucketMode::default(),
            key_scope: KeyScope::default(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl LimiterConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "request".to_string()
}

fn default_store_timeout() -> u64 {
    250
}

impl WardenConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<Self>())
            .map_err(|e| WardenError::Config(e.to_string()))
            .and_then(Self::validated)
    }

    /// Reject settings that would make every store call fail.
    fn validated(self) -> Result<Self> {
        if self.limiter.store_timeout_ms == 0 {
            return Err(WardenError::Config(
                "limiter.store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.connect_timeout_ms == 0 {
            return Err(WardenError::Config(
                "store.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }

    /// Build the validated rule set: rules from `rules_path` first, then the
    /// inline ones.
    pub fn rule_set(&self) -> Result<RuleSet> {
        let mut rules = match &self.rules_path {
            Some(path) => RuleSet::from_file(path)?.rules().to_vec(),
            None => Vec::new(),
        };
        rules.extend(self.rules.iter().cloned());
        RuleSet::new(rules)
    }
}
