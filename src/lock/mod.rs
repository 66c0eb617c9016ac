//! Distributed lock over the shared store
//!
//! A lock is a key holding a random owner token with a TTL. Acquisition is a
//! single set-if-not-exists; release and extend are compare-and-act scripts
//! that only touch the key while it still holds the caller's token, so an
//! expired holder can never delete or prolong someone else's lock.
//!
//! There is no fencing: a holder whose TTL lapses mid-work is not notified.
//! Callers doing long work should `extend` well before the TTL runs out.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::common::metrics::{LockStats, LockStatsSnapshot};
use crate::common::{Error, LockConfig, OpContext, Result};
use crate::store::{KvClient, EXTEND_IF_OWNED, RELEASE_IF_OWNED};

#[derive(Clone)]
pub struct DistributedLock {
    client: KvClient,
    key_prefix: String,
    default_ttl: Duration,
    stats: Arc<LockStats>,
}

/// Proof of ownership returned by [`DistributedLock::acquire`]
///
/// Dropping a guard does not release the lock; it expires with its TTL.
#[derive(Clone)]
pub struct LockGuard {
    lock: DistributedLock,
    key: String,
    token: String,
    ttl: Duration,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Serializable view of a held lock, e.g. for the CLI
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub key: String,
    pub token: String,
    pub ttl_ms: u64,
}

impl DistributedLock {
    pub fn new(client: KvClient, config: &LockConfig) -> Self {
        Self {
            client,
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl,
            stats: Arc::new(LockStats::default()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Try once to take the lock. `None` uses the configured default TTL.
    pub async fn acquire(
        &self,
        ctx: &OpContext,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<LockGuard> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return Err(Error::InvalidConfig("lock ttl must be > 0".into()));
        }

        let token = uuid::Uuid::new_v4().to_string();
        let acquired = self
            .client
            .set_nx(ctx, &self.lock_key(key), token.as_bytes(), ttl)
            .await?;

        if !acquired {
            self.stats.contended.inc();
            tracing::debug!(key, "Lock already held");
            return Err(Error::LockHeld(key.to_string()));
        }

        self.stats.acquired.inc();
        tracing::debug!(key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(LockGuard {
            lock: self.clone(),
            key: key.to_string(),
            token,
            ttl,
        })
    }

    /// Release a lock by its owner token
    pub async fn release_token(&self, ctx: &OpContext, key: &str, token: &str) -> Result<()> {
        let lock_key = self.lock_key(key);
        let reply = self
            .client
            .eval(ctx, &RELEASE_IF_OWNED, &[lock_key.as_str()], &[token])
            .await?;

        if !reply.is_truthy() {
            self.stats.lost.inc();
            return Err(Error::NotOwned(key.to_string()));
        }

        self.stats.released.inc();
        tracing::debug!(key, "Lock released");
        Ok(())
    }

    /// Re-arm the TTL of a lock by its owner token
    pub async fn extend_token(
        &self,
        ctx: &OpContext,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::InvalidConfig("lock ttl must be > 0".into()));
        }
        let lock_key = self.lock_key(key);
        let ttl_ms = (ttl.as_millis() as u64).max(1).to_string();
        let reply = self
            .client
            .eval(
                ctx,
                &EXTEND_IF_OWNED,
                &[lock_key.as_str()],
                &[token, ttl_ms.as_str()],
            )
            .await?;

        if !reply.is_truthy() {
            self.stats.lost.inc();
            return Err(Error::NotOwned(key.to_string()));
        }

        self.stats.extended.inc();
        tracing::debug!(key, ttl_ms = ttl.as_millis() as u64, "Lock extended");
        Ok(())
    }

    /// Current owner token, if the lock is held
    pub async fn holder(&self, ctx: &OpContext, key: &str) -> Result<Option<String>> {
        match self.client.get(ctx, &self.lock_key(key)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn is_locked(&self, ctx: &OpContext, key: &str) -> Result<bool> {
        self.client.exists(ctx, &self.lock_key(key)).await
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        self.stats.snapshot()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// TTL requested at acquisition or by the last extend
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn info(&self) -> LockInfo {
        LockInfo {
            key: self.key.clone(),
            token: self.token.clone(),
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }

    /// Fails with `NotOwned` if the lock expired or changed hands
    pub async fn release(&self, ctx: &OpContext) -> Result<()> {
        self.lock.release_token(ctx, &self.key, &self.token).await
    }

    pub async fn extend(&mut self, ctx: &OpContext, ttl: Duration) -> Result<()> {
        self.lock
            .extend_token(ctx, &self.key, &self.token, ttl)
            .await?;
        self.ttl = ttl;
        Ok(())
    }
}
