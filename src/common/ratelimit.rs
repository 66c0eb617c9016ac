//! Token bucket rate limiting and HTTP admission control
//!
//! Buckets are kept per key (client IP by default) in a map owned by the
//! [`RateLimiter`] instance. The state is in-process only: with several
//! instances behind a load balancer each one enforces its own budget.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::common::utils::duration_str;
use crate::common::{Error, Result};

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum number of requests in a burst
    pub burst_size: u32,
    /// Number of requests allowed per second
    pub requests_per_second: f64,
    /// Buckets idle for longer than this are dropped by `cleanup`
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    /// Whether to enable rate limiting
    pub enabled: bool,
    /// Path prefixes that bypass the limiter
    pub skip_paths: Vec<String>,
    /// Client keys that bypass the limiter
    pub skip_keys: Vec<String>,
    /// Message returned with 429 responses
    pub rejection_message: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 100,
            requests_per_second: 50.0,
            idle_timeout: Duration::from_secs(600),
            enabled: true,
            skip_paths: vec!["/health".to_string()],
            skip_keys: Vec::new(),
            rejection_message: "Too many requests, please slow down".to_string(),
        }
    }
}

/// Token bucket for a single client
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    burst_size: u32,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(burst_size: u32, refill_rate: f64) -> Self {
        Self {
            tokens: burst_size as f64,
            last_refill: Instant::now(),
            burst_size,
            refill_rate,
        }
    }

    /// Try to consume a token. Returns true if allowed, false if rate limited.
    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self) {
        let now = Instant::now();
        self.tokens = self.estimate(now);
        self.last_refill = now;
    }

    /// Token count at `now` without mutating the bucket
    fn estimate(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.burst_size as f64)
    }

    /// Get remaining tokens (for headers)
    fn remaining(&self) -> u32 {
        self.tokens as u32
    }

    /// Get time until next token is available
    fn retry_after(&self) -> Duration {
        self.time_to(1.0)
    }

    /// Get time until the bucket is full again
    fn reset_after(&self) -> Duration {
        self.time_to(self.burst_size as f64)
    }

    fn time_to(&self, level: f64) -> Duration {
        if self.tokens >= level || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((level - self.tokens) / self.refill_rate)
        }
    }
}

/// Shared rate limiter state
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, TokenBucket>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check if a request for the given key is allowed, consuming a token if so
    pub async fn check(&self, key: &str) -> RateLimitResult {
        let limit = self.config.burst_size;
        if !self.config.enabled {
            return RateLimitResult::Allowed {
                remaining: limit,
                limit,
            };
        }

        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            TokenBucket::new(self.config.burst_size, self.config.requests_per_second)
        });

        if bucket.try_consume() {
            RateLimitResult::Allowed {
                remaining: bucket.remaining(),
                limit,
            }
        } else {
            RateLimitResult::Limited {
                retry_after: bucket.retry_after(),
                reset_after: bucket.reset_after(),
                limit,
            }
        }
    }

    pub async fn allow(&self, key: &str) -> bool {
        self.check(key).await.is_allowed()
    }

    /// Like [`RateLimiter::allow`] but reports a rejection as an error
    pub async fn acquire(&self, key: &str) -> Result<()> {
        match self.check(key).await {
            RateLimitResult::Allowed { .. } => Ok(()),
            RateLimitResult::Limited { retry_after, .. } => Err(Error::RateLimitExceeded {
                key: key.to_string(),
                retry_after,
            }),
        }
    }

    /// Current token estimate for `key` without consuming anything
    pub async fn remaining(&self, key: &str) -> f64 {
        let buckets = self.buckets.read().await;
        match buckets.get(key) {
            Some(bucket) => bucket.estimate(Instant::now()),
            None => self.config.burst_size as f64,
        }
    }

    /// Drop the bucket for `key`; the next request starts a fresh one
    pub async fn reset(&self, key: &str) {
        let mut buckets = self.buckets.write().await;
        if buckets.remove(key).is_some() {
            tracing::info!(key, "Rate limit bucket reset");
        }
    }

    /// Clean up idle entries to keep the map bounded
    pub async fn cleanup(&self) -> usize {
        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_refill) < self.config.idle_timeout
        });
        before - buckets.len()
    }

    /// Get statistics about the rate limiter
    pub async fn stats(&self) -> RateLimitStats {
        let buckets = self.buckets.read().await;
        RateLimitStats {
            tracked_keys: buckets.len(),
            config: self.config.clone(),
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed { remaining: u32, limit: u32 },
    /// Request is rate limited
    Limited {
        retry_after: Duration,
        reset_after: Duration,
        limit: u32,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Statistics about the rate limiter
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub tracked_keys: usize,
    pub config: RateLimitConfig,
}

/// Derives the limiter key from an incoming request
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Client IP from `ConnectInfo`, then the first `X-Forwarded-For` hop
pub fn client_ip_key(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Outcome of an admission decision
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Path or key is on the skip list
    Exempt,
    Allow {
        limit: u32,
        remaining: u32,
    },
    Reject {
        limit: u32,
        retry_after: Duration,
        reset_after: Duration,
        message: String,
    },
}

/// Request admission in front of business logic
#[derive(Clone)]
pub struct AdmissionControl {
    limiter: RateLimiter,
    key_fn: KeyFn,
}

impl AdmissionControl {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_limiter(RateLimiter::new(config))
    }

    pub fn with_limiter(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            key_fn: Arc::new(client_ip_key),
        }
    }

    /// Replace the default client-IP key extraction
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(f);
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn admit(&self, request: &Request) -> Admission {
        let config = self.limiter.config();
        let path = request.uri().path();
        if config.skip_paths.iter().any(|p| path.starts_with(p.as_str())) {
            return Admission::Exempt;
        }

        let key = (self.key_fn)(request);
        if config.skip_keys.iter().any(|k| *k == key) {
            return Admission::Exempt;
        }

        match self.limiter.check(&key).await {
            RateLimitResult::Allowed { remaining, limit } => Admission::Allow { limit, remaining },
            RateLimitResult::Limited {
                retry_after,
                reset_after,
                limit,
            } => {
                tracing::debug!(key = %key, path, "Request rejected by rate limiter");
                Admission::Reject {
                    limit,
                    retry_after,
                    reset_after,
                    message: config.rejection_message.clone(),
                }
            }
        }
    }
}

/// Axum middleware layer for admission control
pub async fn admission_middleware(
    State(admission): State<Arc<AdmissionControl>>,
    request: Request,
    next: Next,
) -> Response {
    match admission.admit(&request).await {
        Admission::Exempt => next.run(request).await,
        Admission::Allow { limit, remaining } => {
            let mut response = next.run(request).await;

            // Add rate limit headers
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));

            response
        }
        Admission::Reject {
            limit,
            retry_after,
            reset_after,
            message,
        } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "Too Many Requests",
                    "message": message,
                    "category": "rate_limited",
                })),
            )
                .into_response();

            insert_rejection_headers(response.headers_mut(), limit, retry_after, reset_after);
            response
        }
    }
}

fn insert_rejection_headers(
    headers: &mut HeaderMap,
    limit: u32,
    retry_after: Duration,
    reset_after: Duration,
) {
    // Round up so clients never retry before a token exists
    let retry_secs = retry_after.as_secs_f64().ceil() as u64;
    let reset_secs = reset_after.as_secs_f64().ceil() as u64;

    headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(reset_secs));
    headers.insert("Retry-After", HeaderValue::from(retry_secs.max(1)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(burst_size: u32, requests_per_second: f64) -> RateLimitConfig {
        RateLimitConfig {
            burst_size,
            requests_per_second,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket() {
        let mut bucket = TokenBucket::new(10, 1.0);

        // Should allow burst
        for _ in 0..10 {
            assert!(bucket.try_consume());
        }

        // Should be rate limited
        assert!(!bucket.try_consume());
        assert_eq!(bucket.retry_after(), Duration::from_secs(1));
        assert_eq!(bucket.reset_after(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = RateLimiter::new(config(20, 10.0));

        for i in 0..20 {
            assert!(limiter.allow("client").await, "request {} should pass", i);
        }
        assert!(!limiter.allow("client").await);

        tokio::time::advance(Duration::from_secs(1)).await;

        for i in 0..10 {
            assert!(limiter.allow("client").await, "refilled request {} should pass", i);
        }
        assert!(!limiter.allow("client").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_burst() {
        let limiter = RateLimiter::new(config(5, 100.0));
        assert!(limiter.allow("client").await);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.remaining("client").await, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_does_not_consume() {
        let limiter = RateLimiter::new(config(3, 1.0));
        assert_eq!(limiter.remaining("fresh").await, 3.0);

        assert!(limiter.allow("fresh").await);
        assert_eq!(limiter.remaining("fresh").await, 2.0);
        assert_eq!(limiter.remaining("fresh").await, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_keys() {
        let limiter = RateLimiter::new(config(1, 0.1));

        assert!(limiter.allow("10.0.0.1").await);
        assert!(!limiter.allow("10.0.0.1").await);

        // Different key should be allowed
        assert!(limiter.allow("10.0.0.2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_starts_fresh_bucket() {
        let limiter = RateLimiter::new(config(2, 0.1));
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        limiter.reset("k").await;
        assert!(limiter.allow("k").await);
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            requests_per_second: 0.1,
            enabled: false,
            ..Default::default()
        });

        // Should always allow when disabled
        for _ in 0..100 {
            assert!(limiter.allow("127.0.0.1").await);
        }
        assert_eq!(limiter.stats().await.tracked_keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reports_retry_after() {
        let limiter = RateLimiter::new(config(1, 2.0));
        limiter.acquire("k").await.unwrap();

        match limiter.acquire("k").await {
            Err(Error::RateLimitExceeded { key, retry_after }) => {
                assert_eq!(key, "k");
                assert_eq!(retry_after, Duration::from_millis(500));
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_idle_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            idle_timeout: Duration::from_secs(60),
            ..config(5, 1.0)
        });
        limiter.allow("old").await;
        tokio::time::advance(Duration::from_secs(120)).await;
        limiter.allow("new").await;

        assert_eq!(limiter.cleanup().await, 1);
        let stats = limiter.stats().await;
        assert_eq!(stats.tracked_keys, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_skip_lists() {
        let admission = AdmissionControl::new(RateLimitConfig {
            skip_paths: vec!["/health".into()],
            skip_keys: vec!["10.0.0.9".into()],
            ..config(1, 0.1)
        });

        let request = |path: &str, ip: &str| {
            axum::http::Request::builder()
                .uri(path)
                .header("X-Forwarded-For", ip)
                .body(axum::body::Body::empty())
                .unwrap()
        };

        assert_eq!(
            admission.admit(&request("/health/live", "10.0.0.1")).await,
            Admission::Exempt
        );
        for _ in 0..5 {
            assert_eq!(
                admission.admit(&request("/api", "10.0.0.9")).await,
                Admission::Exempt
            );
        }

        assert!(matches!(
            admission.admit(&request("/api", "10.0.0.1")).await,
            Admission::Allow { remaining: 0, .. }
        ));
        assert!(matches!(
            admission.admit(&request("/api", "10.0.0.1")).await,
            Admission::Reject { .. }
        ));
    }

    #[test]
    fn test_client_ip_key_fallbacks() {
        let forwarded = axum::http::Request::builder()
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(client_ip_key(&forwarded), "203.0.113.7");

        let bare = axum::http::Request::builder().body(axum::body::Body::empty()).unwrap();
        assert_eq!(client_ip_key(&bare), "unknown");

        let mut connected = axum::http::Request::builder().body(axum::body::Body::empty()).unwrap();
        connected
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 4], 4242))));
        assert_eq!(client_ip_key(&connected), "192.168.1.4");
    }
}
