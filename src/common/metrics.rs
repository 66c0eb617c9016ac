//! In-process counters for the coordination primitives
//!
//! Counters are plain atomics owned by the component that bumps them.
//! Snapshots are serializable; exporting them is left to the embedding
//! service.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for tracking event counts
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Cache activity
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: Counter,
    pub misses: Counter,
    /// Fallback computations triggered by a miss or read error
    pub computations: Counter,
    /// Cache writes that failed after a successful computation
    pub write_failures: Counter,
    pub invalidations: Counter,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.get();
        let misses = self.misses.get();
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            computations: self.computations.get(),
            write_failures: self.write_failures.get(),
            invalidations: self.invalidations.get(),
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub computations: u64,
    pub write_failures: u64,
    pub invalidations: u64,
    pub hit_ratio: f64,
}

/// Distributed lock activity
#[derive(Debug, Default)]
pub struct LockStats {
    pub acquired: Counter,
    /// Acquire attempts that found the lock held
    pub contended: Counter,
    pub released: Counter,
    pub extended: Counter,
    /// Release or extend attempts whose token no longer matched
    pub lost: Counter,
}

impl LockStats {
    pub fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            acquired: self.acquired.get(),
            contended: self.contended.get(),
            released: self.released.get(),
            extended: self.extended.get(),
            lost: self.lost.get(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockStatsSnapshot {
    pub acquired: u64,
    pub contended: u64,
    pub released: u64,
    pub extended: u64,
    pub lost: u64,
}
