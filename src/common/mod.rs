//! Common utilities and types shared across kvcoord

pub mod config;
pub mod context;
pub mod error;
pub mod lockout;
pub mod metrics;
pub mod ratelimit;
pub mod utils;

pub use config::{Config, LockConfig, StoreConfig};
pub use context::OpContext;
pub use error::{Error, Result};
pub use lockout::{LockoutConfig, LockoutManager, LockoutStatus};
pub use metrics::{CacheStats, CacheStatsSnapshot, Counter, LockStats, LockStatsSnapshot};
pub use ratelimit::{
    admission_middleware, Admission, AdmissionControl, RateLimitConfig, RateLimitResult,
    RateLimiter,
};
pub use utils::{escape_glob, glob_match, parse_duration, retry_with_backoff, validate_key};
