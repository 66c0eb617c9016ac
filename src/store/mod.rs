//! Shared key-value store access
//!
//! [`KvBackend`] is the byte-level contract a store must satisfy: TTL'd
//! writes, set-if-not-exists, glob enumeration, TTL introspection and a
//! small set of named server-side scripts. [`KvClient`] wraps a backend with
//! cancellation, JSON helpers and bounded retry, and is what the lock and
//! cache layers hold.
//!
//! Backends:
//! - [`RedisBackend`] for `redis://` / `rediss://` URLs
//! - [`MemoryBackend`] for `memory://`, single process only

pub mod client;
pub mod memory;
pub mod redis;
pub mod script;

use async_trait::async_trait;
use std::time::Duration;

use crate::common::Result;

pub use client::KvClient;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use script::{EvalReply, Script, EXTEND_IF_OWNED, RELEASE_IF_OWNED};

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key exists without an expiry
    Persistent,
    Expires(Duration),
}

impl Ttl {
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Ttl::Persistent => None,
            Ttl::Expires(d) => Some(*d),
        }
    }
}

/// Trait for shared key-value store backends
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditional write; `None` keeps the key without expiry
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Atomic set-if-not-exists. Returns false when the key already exists.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Returns the number of keys that existed and were removed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// `None` when the key does not exist
    async fn ttl(&self, key: &str) -> Result<Option<Ttl>>;

    /// Keys matching a Redis-style glob pattern
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Run a server-side script atomically
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<EvalReply>;

    /// Release connections. Later calls fail with `Error::Closed`.
    async fn close(&self) -> Result<()>;
}

/// Millisecond TTL for the wire, never zero
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
