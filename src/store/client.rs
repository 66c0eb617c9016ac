//! Store client
//!
//! Every operation takes an [`OpContext`] and fails with `Cancelled` or
//! `DeadlineExceeded` if the context ends first. The `*_with_retry`
//! variants retry transient store errors with linear backoff.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::memory::MemoryBackend;
use super::redis::RedisBackend;
use super::script::{EvalReply, Script};
use super::{KvBackend, Ttl};
use crate::common::utils::{retry_with_backoff, validate_key};
use crate::common::{Error, OpContext, Result, StoreConfig};

#[derive(Clone)]
pub struct KvClient {
    backend: Arc<dyn KvBackend>,
    retry_backoff: Duration,
    max_attempts: u32,
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClient")
            .field("backend", &self.backend.name())
            .field("retry_backoff", &self.retry_backoff)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl KvClient {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        let defaults = StoreConfig::default();
        Self {
            backend,
            retry_backoff: defaults.retry_backoff,
            max_attempts: defaults.max_attempts,
        }
    }

    /// Client over a fresh in-process store
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Connect using the URL scheme to pick a backend
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config.url.trim();
        let backend: Arc<dyn KvBackend> = match url.split_once("://").map(|(scheme, _)| scheme) {
            Some("redis") | Some("rediss") => Arc::new(RedisBackend::connect(url).await?),
            Some("memory") => Arc::new(MemoryBackend::new()),
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported store url: {}",
                    url
                )))
            }
        };

        tracing::debug!(backend = backend.name(), "Store client ready");
        Ok(Self::new(backend).with_retry_policy(config.max_attempts, config.retry_backoff))
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, retry_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fails with `NotFound` when the key is absent
    pub async fn get(&self, ctx: &OpContext, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        ctx.run("get", self.backend.get(key))
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub async fn set(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        validate_key(key)?;
        ctx.run("set", self.backend.set(key, value, ttl)).await
    }

    /// Returns true if this call created the key
    pub async fn set_nx(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        validate_key(key)?;
        ctx.run("set_nx", self.backend.set_nx(key, value, ttl)).await
    }

    /// Returns the number of keys removed
    pub async fn delete<K: AsRef<str>>(&self, ctx: &OpContext, keys: &[K]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        ctx.run("delete", self.backend.delete(&keys)).await
    }

    pub async fn exists(&self, ctx: &OpContext, key: &str) -> Result<bool> {
        ctx.run("exists", self.backend.exists(key)).await
    }

    /// Fails with `NotFound` when the key is absent
    pub async fn ttl(&self, ctx: &OpContext, key: &str) -> Result<Ttl> {
        ctx.run("ttl", self.backend.ttl(key))
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub async fn keys(&self, ctx: &OpContext, pattern: &str) -> Result<Vec<String>> {
        ctx.run("keys", self.backend.keys(pattern)).await
    }

    pub async fn eval(
        &self,
        ctx: &OpContext,
        script: &Script,
        keys: &[&str],
        args: &[&str],
    ) -> Result<EvalReply> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        ctx.run(script.name(), self.backend.eval(script, &keys, &args))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, ctx: &OpContext, key: &str) -> Result<T> {
        let bytes = self.get(ctx, key).await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Deserialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
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

    /// `get` retried on transient errors; `NotFound` is returned immediately
    pub async fn get_with_retry(
        &self,
        ctx: &OpContext,
        key: &str,
        max_attempts: Option<u32>,
    ) -> Result<Vec<u8>> {
        let attempts = max_attempts.unwrap_or(self.max_attempts);
        retry_with_backoff(ctx, "get", attempts, self.retry_backoff, move || {
            self.get(ctx, key)
        })
        .await
    }

    pub async fn set_with_retry(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        max_attempts: Option<u32>,
    ) -> Result<()> {
        let attempts = max_attempts.unwrap_or(self.max_attempts);
        retry_with_backoff(ctx, "set", attempts, self.retry_backoff, move || {
            self.set(ctx, key, value, ttl)
        })
        .await
    }

    /// Release the backend's connections
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Backend whose reads fail transiently a fixed number of times
    struct FlakyBackend {
        inner: MemoryBackend,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryBackend::new(),
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn trip(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::TransientStore("connection reset".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KvBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.trip()?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
            self.trip()?;
            self.inner.set(key, value, ttl).await
        }
        async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
            self.inner.set_nx(key, value, ttl).await
        }
        async fn delete(&self, keys: &[String]) -> Result<u64> {
            self.inner.delete(keys).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
        async fn ttl(&self, key: &str) -> Result<Option<Ttl>> {
            self.inner.ttl(key).await
        }
        async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
            self.inner.keys(pattern).await
        }
        async fn eval(
            &self,
            script: &Script,
            keys: &[String],
            args: &[String],
        ) -> Result<EvalReply> {
            self.inner.eval(script, keys, args).await
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Profile {
        name: String,
        visits: u32,
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let client = KvClient::memory();
        let ctx = OpContext::background();
        assert!(matches!(client.get(&ctx, "nope").await, Err(Error::NotFound(_))));
        assert!(matches!(client.ttl(&ctx, "nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_json_round_trip_and_decode_error() {
        let client = KvClient::memory();
        let ctx = OpContext::background();
        let profile = Profile {
            name: "ada".into(),
            visits: 3,
        };
        client.set_json(&ctx, "profile:1", &profile, None).await.unwrap();
        let loaded: Profile = client.get_json(&ctx, "profile:1").await.unwrap();
        assert_eq!(loaded, profile);

        client.set(&ctx, "profile:2", b"not json", None).await.unwrap();
        let result: Result<Profile> = client.get_json(&ctx, "profile:2").await;
        assert!(matches!(result, Err(Error::Deserialization { .. })));
    }

    #[tokio::test]
    async fn test_delete_counts_existing_keys() {
        let client = KvClient::memory();
        let ctx = OpContext::background();
        client.set(&ctx, "a", b"1", None).await.unwrap();
        client.set(&ctx, "b", b"2", None).await.unwrap();
        assert_eq!(client.delete(&ctx, &["a", "b", "c"]).await.unwrap(), 2);
        let none: [&str; 0] = [];
        assert_eq!(client.delete(&ctx, &none).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let client = KvClient::memory();
        let token = CancellationToken::new();
        let ctx = OpContext::with_cancel(token.clone());
        token.cancel();
        assert!(matches!(
            client.set(&ctx, "k", b"v", None).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_with_retry_recovers_from_transient_errors() {
        let backend = Arc::new(FlakyBackend::new(2));
        backend.inner.set("k", b"v", None).await.unwrap();
        let client = KvClient::new(backend.clone())
            .with_retry_policy(3, Duration::from_millis(10));
        let ctx = OpContext::background();

        let value = client.get_with_retry(&ctx, "k", None).await.unwrap();
        assert_eq!(value, b"v".to_vec());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_with_retry_exhausts() {
        let backend = Arc::new(FlakyBackend::new(10));
        let client = KvClient::new(backend.clone())
            .with_retry_policy(5, Duration::from_millis(10));
        let ctx = OpContext::background();

        let result = client.set_with_retry(&ctx, "k", b"v", None, Some(2)).await;
        match result {
            Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let backend = Arc::new(FlakyBackend::new(0));
        let client = KvClient::new(backend.clone());
        let ctx = OpContext::background();
        let result = client.get_with_retry(&ctx, "missing", Some(5)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_by_scheme() {
        let mut config = StoreConfig {
            url: "memory://".into(),
            ..StoreConfig::default()
        };
        let client = KvClient::connect(&config).await.unwrap();
        assert_eq!(client.backend_name(), "memory");

        config.url = "ftp://example".into();
        assert!(matches!(
            KvClient::connect(&config).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_further_calls() {
        let client = KvClient::memory();
        let ctx = OpContext::background();
        client.close().await.unwrap();
        assert!(matches!(client.get(&ctx, "k").await, Err(Error::Closed)));
    }
}
