//! # kvcoord
//!
//! Coordination primitives for services sharing a key-value store:
//! - Distributed locks with owner tokens and TTL
//! - Token-bucket rate limiting with an axum admission middleware
//! - Read-through caching with namespace TTL policies and tag invalidation
//! - Password verification with failed-attempt lockout
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │ Distributed  │ │ CacheManager │ │ TaggedCache  │
//! │ Lock         │ │              │ │              │
//! └──────┬───────┘ └──────┬───────┘ └──────┬───────┘
//!        └────────────────┼────────────────┘
//!                  ┌──────▼──────┐
//!                  │  KvClient   │  OpContext, retry, JSON
//!                  └──────┬──────┘
//!             ┌───────────┴───────────┐
//!       ┌─────▼──────┐          ┌─────▼──────┐
//!       │ Redis      │          │ Memory     │
//!       └────────────┘          └────────────┘
//!
//! RateLimiter / AdmissionControl and LockoutManager keep
//! per-instance state in process.
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use kvcoord::{DistributedLock, KvClient, LockConfig, OpContext, StoreConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> kvcoord::Result<()> {
//! let client = KvClient::connect(&StoreConfig::default()).await?;
//! let locks = DistributedLock::new(client, &LockConfig::default());
//!
//! let ctx = OpContext::with_timeout(Duration::from_secs(2));
//! let guard = locks.acquire(&ctx, "reports:nightly", None).await?;
//! // ... exclusive work ...
//! guard.release(&ctx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### CLI
//! ```bash
//! kvcoord --url redis://127.0.0.1:6379 set greeting hello --ttl 30s
//! kvcoord lock acquire nightly --ttl 1m
//! kvcoord invalidate-tag catalog
//! ```

pub mod cache;
pub mod common;
pub mod lock;
pub mod store;

// Re-export commonly used types
pub use cache::{CacheManager, CacheStrategy, EvictionPolicy, TaggedCache, WarmupReport};
pub use common::{
    admission_middleware, Admission, AdmissionControl, Config, Error, LockConfig, LockoutConfig,
    LockoutManager, LockoutStatus, OpContext, RateLimitConfig, RateLimitResult, RateLimiter,
    Result, StoreConfig,
};
pub use lock::{DistributedLock, LockGuard, LockInfo};
pub use store::{EvalReply, KvBackend, KvClient, MemoryBackend, RedisBackend, Script, Ttl};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
