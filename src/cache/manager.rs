//! Prefixed, policy-driven cache over the shared store

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::strategy::CacheStrategy;
use crate::common::metrics::{CacheStats, CacheStatsSnapshot};
use crate::common::utils::escape_glob;
use crate::common::{Error, OpContext, Result};
use crate::store::KvClient;

/// Outcome of a warmup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub warmed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct CacheManager {
    client: KvClient,
    strategy: Arc<CacheStrategy>,
    stats: Arc<CacheStats>,
}

impl CacheManager {
    pub fn new(client: KvClient, strategy: CacheStrategy) -> Self {
        tracing::debug!(
            key_prefix = %strategy.key_prefix,
            default_ttl_ms = strategy.default_ttl.as_millis() as u64,
            eviction = strategy.eviction_policy.as_redis_policy(),
            "Cache manager configured"
        );
        Self {
            client,
            strategy: Arc::new(strategy),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn strategy(&self) -> &CacheStrategy {
        &self.strategy
    }

    pub fn client(&self) -> &KvClient {
        &self.client
    }

    /// Store key for a logical key
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.strategy.key_prefix, key)
    }

    pub fn ttl_for_key(&self, key: &str) -> Duration {
        self.strategy.ttl_for_key(key)
    }

    fn resolve_ttl(&self, key: &str, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(ttl) => self.strategy.clamp(ttl),
            None => self.strategy.ttl_for_key(key),
        }
    }

    pub async fn get(&self, ctx: &OpContext, key: &str) -> Result<Vec<u8>> {
        let result = self.client.get(ctx, &self.storage_key(key)).await;
        match &result {
            Ok(_) => self.stats.hits.inc(),
            Err(e) if e.is_not_found() => self.stats.misses.inc(),
            Err(_) => {}
        }
        result
    }

    pub async fn get_json<T: DeserializeOwned>(&self, ctx: &OpContext, key: &str) -> Result<T> {
        let bytes = self.get(ctx, key).await?;
        decode(key, &bytes)
    }

    /// Read `key`, computing and storing it on a miss
    ///
    /// Any read failure other than cancellation or deadline counts as a miss.
    /// The computed value is returned even if writing it back fails.
    pub async fn get_with_fallback<F, Fut>(
        &self,
        ctx: &OpContext,
        key: &str,
        compute: F,
    ) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        match self.read_for_fallback(ctx, key).await? {
            Some(bytes) => Ok(bytes),
            None => {
                let value = self.compute(compute).await?;
                self.write_back(ctx, key, &value).await;
                Ok(value)
            }
        }
    }

    /// Typed [`get_with_fallback`](Self::get_with_fallback). A cached value
    /// that fails to decode is recomputed.
    pub async fn get_json_with_fallback<T, F, Fut>(
        &self,
        ctx: &OpContext,
        key: &str,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(bytes) = self.read_for_fallback(ctx, key).await? {
            match decode(key, &bytes) {
                Ok(value) => return Ok(value),
                Err(e) => tracing::warn!(key, "Discarding undecodable cache entry: {}", e),
            }
        }

        let value = self.compute(compute).await?;
        let bytes = serde_json::to_vec(&value)?;
        self.write_back(ctx, key, &bytes).await;
        Ok(value)
    }

    /// `Ok(None)` means compute; only context errors are returned
    async fn read_for_fallback(&self, ctx: &OpContext, key: &str) -> Result<Option<Vec<u8>>> {
        match self.get(ctx, key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_context_error() => Err(e),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                self.stats.misses.inc();
                tracing::warn!(key, "Cache read failed, computing value: {}", e);
                Ok(None)
            }
        }
    }

    async fn compute<T, F, Fut>(&self, compute: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.stats.computations.inc();
        compute().await
    }

    async fn write_back(&self, ctx: &OpContext, key: &str, value: &[u8]) {
        if let Err(e) = self.set(ctx, key, value, None).await {
            self.stats.write_failures.inc();
            tracing::warn!(key, "Failed to cache computed value: {}", e);
        }
    }

    /// Store under the prefix. `None` uses the policy TTL; explicit TTLs
    /// are clamped to `max_ttl`.
    pub async fn set(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = self.resolve_ttl(key, ttl);
        self.client
            .set(ctx, &self.storage_key(key), value, Some(ttl))
            .await
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(ctx, key, &bytes, ttl).await
    }

    pub async fn set_with_strategy(&self, ctx: &OpContext, key: &str, value: &[u8]) -> Result<()> {
        self.set(ctx, key, value, None).await
    }

    /// Returns whether an entry was removed
    pub async fn delete(&self, ctx: &OpContext, key: &str) -> Result<bool> {
        let removed = self.client.delete(ctx, &[self.storage_key(key)]).await?;
        self.stats.invalidations.add(removed);
        Ok(removed > 0)
    }

    /// Delete every entry whose logical key matches `pattern`
    ///
    /// Keys that fail to delete are logged and skipped.
    pub async fn delete_pattern(&self, ctx: &OpContext, pattern: &str) -> Result<u64> {
        let full_pattern = format!("{}{}", escape_glob(&self.strategy.key_prefix), pattern);
        let keys = self.client.keys(ctx, &full_pattern).await?;

        let mut removed = 0;
        for key in &keys {
            match self.client.delete(ctx, &[key]).await {
                Ok(n) => removed += n,
                Err(e) if e.is_context_error() => return Err(e),
                Err(e) => tracing::warn!(key = %key, "Failed to delete cache key: {}", e),
            }
        }

        self.stats.invalidations.add(removed);
        tracing::debug!(pattern, matched = keys.len(), removed, "Deleted cache pattern");
        Ok(removed)
    }

    /// Populate the configured warmup keys
    ///
    /// Does nothing unless `warmup_enabled`. Failures of individual keys
    /// are logged and counted.
    pub async fn warmup<F, Fut>(&self, ctx: &OpContext, mut warmup_fn: F) -> Result<WarmupReport>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let mut report = WarmupReport::default();
        if !self.strategy.warmup_enabled {
            return Ok(report);
        }

        for key in &self.strategy.warmup_keys {
            ctx.check("warmup")?;
            let outcome = match warmup_fn(key.clone()).await {
                Ok(value) => self.set_with_strategy(ctx, key, &value).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => report.warmed += 1,
                Err(e) if e.is_context_error() => return Err(e),
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(key = %key, "Cache warmup failed: {}", e);
                }
            }
        }

        tracing::info!(warmed = report.warmed, failed = report.failed, "Cache warmup complete");
        Ok(report)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn record_invalidations(&self, n: u64) {
        self.stats.invalidations.add(n);
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
