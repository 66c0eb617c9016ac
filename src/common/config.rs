//! Configuration for kvcoord components

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheStrategy;
use crate::common::lockout::LockoutConfig;
use crate::common::ratelimit::RateLimitConfig;
use crate::common::utils::duration_str;
use crate::common::{Error, Result};

/// Environment variable prefix, e.g. `KVCOORD_STORE__URL`
pub const ENV_PREFIX: &str = "KVCOORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared store connection
    pub store: StoreConfig,

    /// Distributed lock defaults
    pub lock: LockConfig,

    /// Cache TTL policy and warmup
    pub cache: CacheStrategy,

    /// Admission control
    pub rate_limit: RateLimitConfig,

    /// Login lockout policy
    pub lockout: LockoutConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock: LockConfig::default(),
            cache: CacheStrategy::default(),
            rate_limit: RateLimitConfig::default(),
            lockout: LockoutConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Store client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://host:port/db`, `rediss://...` or `memory://`
    pub url: String,

    /// Linear backoff step for `*_with_retry` operations
    #[serde(with = "duration_str")]
    pub retry_backoff: Duration,

    /// Attempts made by `*_with_retry` operations
    pub max_attempts: u32,

    /// Default per-operation timeout used by the CLI
    #[serde(with = "duration_str")]
    pub op_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            retry_backoff: Duration::from_millis(100),
            max_attempts: 3,
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Prefix applied to every lock key
    pub key_prefix: String,

    /// TTL used when the caller does not pick one
    #[serde(with = "duration_str")]
    pub default_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lock:".to_string(),
            default_ttl: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `KVCOORD_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.url.trim().is_empty() {
            return Err(Error::InvalidConfig("store.url cannot be empty".into()));
        }
        if self.store.max_attempts == 0 {
            return Err(Error::InvalidConfig("store.max_attempts must be >= 1".into()));
        }
        if self.lock.default_ttl.is_zero() {
            return Err(Error::InvalidConfig("lock.default_ttl must be > 0".into()));
        }
        if self.rate_limit.burst_size == 0 {
            return Err(Error::InvalidConfig("rate_limit.burst_size must be >= 1".into()));
        }
        if !(self.rate_limit.requests_per_second > 0.0) {
            return Err(Error::InvalidConfig(
                "rate_limit.requests_per_second must be > 0".into(),
            ));
        }
        if self.lockout.max_attempts == 0 {
            return Err(Error::InvalidConfig("lockout.max_attempts must be >= 1".into()));
        }
        self.cache.validate()
    }
}
