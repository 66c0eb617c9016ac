//! Cache layer over the shared store
//!
//! [`CacheManager`] prefixes keys, picks TTLs from a [`CacheStrategy`] and
//! implements read-through with a caller-supplied fallback. [`TaggedCache`]
//! adds group invalidation through per-tag marker keys.

pub mod manager;
pub mod strategy;
pub mod tags;

pub use manager::{CacheManager, WarmupReport};
pub use strategy::{CacheStrategy, EvictionPolicy};
pub use tags::TaggedCache;
