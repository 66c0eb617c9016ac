//! Cache TTL policy

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::common::utils::{duration_map, duration_str};
use crate::common::{Error, Result};

/// Eviction hint for the store operator. Advisory only; the cache never
/// evicts on its own beyond TTL expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    /// Evict keys closest to expiry first
    Ttl,
    NoEviction,
}

impl EvictionPolicy {
    /// Matching Redis `maxmemory-policy` value
    pub fn as_redis_policy(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "allkeys-lru",
            EvictionPolicy::Lfu => "allkeys-lfu",
            EvictionPolicy::Ttl => "volatile-ttl",
            EvictionPolicy::NoEviction => "noeviction",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStrategy {
    /// TTL when no namespace prefix matches
    #[serde(with = "duration_str")]
    pub default_ttl: Duration,

    /// Upper bound applied to every TTL, explicit ones included
    #[serde(with = "duration_str")]
    pub max_ttl: Duration,

    /// Logical key prefix -> TTL. The longest matching prefix wins.
    #[serde(with = "duration_map")]
    pub namespace_ttls: HashMap<String, Duration>,

    pub warmup_enabled: bool,

    pub warmup_keys: Vec<String>,

    pub eviction_policy: EvictionPolicy,

    /// Prepended to every key the cache stores
    pub key_prefix: String,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(86_400),
            namespace_ttls: HashMap::new(),
            warmup_enabled: false,
            warmup_keys: Vec::new(),
            eviction_policy: EvictionPolicy::default(),
            key_prefix: "cache:".to_string(),
        }
    }
}

impl CacheStrategy {
    pub fn with_namespace(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
        self.namespace_ttls.insert(prefix.into(), ttl);
        self
    }

    /// Policy TTL for a logical key
    pub fn ttl_for_key(&self, key: &str) -> Duration {
        let ttl = self
            .namespace_ttls
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl);
        self.clamp(ttl)
    }

    pub fn clamp(&self, ttl: Duration) -> Duration {
        ttl.min(self.max_ttl)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_ttl.is_zero() {
            return Err(Error::InvalidConfig("cache.max_ttl must be > 0".into()));
        }
        if self.default_ttl.is_zero() {
            return Err(Error::InvalidConfig("cache.default_ttl must be > 0".into()));
        }
        if self.default_ttl > self.max_ttl {
            return Err(Error::InvalidConfig(
                "cache.default_ttl cannot exceed cache.max_ttl".into(),
            ));
        }
        if let Some((prefix, _)) = self.namespace_ttls.iter().find(|(_, ttl)| ttl.is_zero()) {
            return Err(Error::InvalidConfig(format!(
                "cache.namespace_ttls[{}] must be > 0",
                prefix
            )));
        }
        Ok(())
    }
}
