//! Error types for kvcoord

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Store Errors ===
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store client is closed")]
    Closed,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    // === Encoding Errors ===
    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Failed to decode value for {key}: {reason}")]
    Deserialization { key: String, reason: String },

    // === Lock Errors ===
    #[error("Lock already held: {0}")]
    LockHeld(String),

    #[error("Lock not owned by caller: {0}")]
    NotOwned(String),

    // === Admission Errors ===
    #[error("Rate limit exceeded for {key}, retry in {}ms", retry_after.as_millis())]
    RateLimitExceeded { key: String, retry_after: Duration },

    #[error("Account locked: {identifier}, retry in {}s", retry_after.as_secs())]
    AccountLocked {
        identifier: String,
        retry_after: Duration,
    },

    #[error("Password hash error: {0}")]
    Hash(String),

    // === Context Errors ===
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientStore(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Cancellation and deadline errors come from the caller's context, not the store
    pub fn is_context_error(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded(_))
    }

    /// Stable label for response bodies and logs
    pub fn category(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::TransientStore(_) | Error::Closed => "store_unavailable",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::Serialization(_) | Error::Deserialization { .. } => "encoding",
            Error::LockHeld(_) | Error::NotOwned(_) => "lock_conflict",
            Error::RateLimitExceeded { .. } => "rate_limited",
            Error::AccountLocked { .. } => "account_locked",
            Error::Cancelled => "cancelled",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::InvalidConfig(_) | Error::Config(_) => "config",
            _ => "internal",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::AccountLocked { .. } => StatusCode::LOCKED,
            Error::LockHeld(_) | Error::NotOwned(_) => StatusCode::CONFLICT,
            Error::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Error::TransientStore(_) | Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
            Error::RetriesExhausted { source, .. } => source.to_http_status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout()
            || e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
        {
            Error::TransientStore(e.to_string())
        } else {
            Error::Store(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}
