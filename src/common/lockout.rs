//! Failed-login tracking and temporary account lockout
//!
//! Each identifier moves through `Clear -> Counting(n) -> Locked -> Clear`.
//! While locked, verification is refused before any hash comparison runs.
//!
//! Records live in a map owned by the [`LockoutManager`]. They are not shared
//! between processes; a multi-instance deployment that needs a global view
//! would keep them in the shared store instead.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::common::utils::duration_str;
use crate::common::{Error, Result};

/// Lockout policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Failed attempts before the identifier is locked
    pub max_attempts: u32,
    /// How long a locked identifier stays locked
    #[serde(with = "duration_str")]
    pub lockout_duration: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_duration: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LockoutRecord {
    attempt_count: u32,
    locked_since: Option<Instant>,
    /// Attempts reserved whose comparison has not finished
    in_flight: u32,
}

/// Snapshot of an identifier's lockout state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockoutStatus {
    pub attempts: u32,
    pub locked: bool,
    /// Time left until the lock lifts, zero when not locked
    pub retry_after: Duration,
    /// Wall-clock time the lock lifts
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct LockoutManager {
    records: Arc<RwLock<HashMap<String, LockoutRecord>>>,
    config: LockoutConfig,
    argon2: Argon2<'static>,
}

impl LockoutManager {
    pub fn new(config: LockoutConfig) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            config,
            argon2: Argon2::default(),
        }
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    /// Hash a password into a PHC string suitable for `verify_with_lockout`
    pub fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::Hash(e.to_string()))
    }

    /// Verify `password` against `hash` unless `identifier` is locked out
    ///
    /// Returns `Ok(true)` on a match and `Ok(false)` on a mismatch. A locked
    /// identifier fails with [`Error::AccountLocked`] without touching the hash.
    ///
    /// Each call reserves an attempt before comparing, so concurrent calls
    /// never run more than `max_attempts` comparisons between resets. Calls
    /// that find every slot reserved are refused as locked.
    pub async fn verify_with_lockout(
        &self,
        identifier: &str,
        password: &str,
        hash: &str,
    ) -> Result<bool> {
        let id = normalize(identifier);
        let parsed = PasswordHash::new(hash).map_err(|e| Error::Hash(e.to_string()))?;

        {
            let mut records = self.records.write().await;
            let record = records.entry(id.clone()).or_default();
            if let Some(retry_after) = self.remaining_lock(record) {
                return Err(Error::AccountLocked {
                    identifier: id,
                    retry_after,
                });
            }
            if record.locked_since.take().is_some() {
                record.attempt_count = 0;
                tracing::info!(identifier = %id, "Lockout window elapsed, record cleared");
            }
            if record.attempt_count + record.in_flight >= self.config.max_attempts {
                return Err(Error::AccountLocked {
                    identifier: id,
                    retry_after: self.config.lockout_duration,
                });
            }
            record.in_flight += 1;
        }

        let matched = self
            .argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();

        let mut records = self.records.write().await;
        // The record may have been cleared by `unlock` meanwhile
        let record = records.entry(id.clone()).or_default();
        record.in_flight = record.in_flight.saturating_sub(1);

        if let Some(retry_after) = self.remaining_lock(record) {
            if matched {
                return Err(Error::AccountLocked {
                    identifier: id,
                    retry_after,
                });
            }
            record.attempt_count += 1;
            return Ok(false);
        }

        if matched {
            record.attempt_count = 0;
            record.locked_since = None;
            if record.in_flight == 0 {
                records.remove(&id);
            }
            return Ok(true);
        }

        record.attempt_count += 1;
        if record.attempt_count >= self.config.max_attempts {
            record.locked_since = Some(Instant::now());
            tracing::warn!(
                identifier = %id,
                attempts = record.attempt_count,
                lockout_secs = self.config.lockout_duration.as_secs(),
                "Identifier locked after repeated failures"
            );
        }

        Ok(false)
    }

    /// Time left on an active lock, `None` when the record is not locked
    fn remaining_lock(&self, record: &LockoutRecord) -> Option<Duration> {
        let since = record.locked_since?;
        let left = self.config.lockout_duration.saturating_sub(since.elapsed());
        (!left.is_zero()).then_some(left)
    }

    pub async fn status(&self, identifier: &str) -> LockoutStatus {
        let records = self.records.read().await;
        let Some(record) = records.get(&normalize(identifier)) else {
            return LockoutStatus {
                attempts: 0,
                locked: false,
                retry_after: Duration::ZERO,
                locked_until: None,
            };
        };

        let retry_after = self.remaining_lock(record).unwrap_or(Duration::ZERO);

        let locked = !retry_after.is_zero();
        LockoutStatus {
            attempts: record.attempt_count,
            locked,
            retry_after,
            locked_until: locked
                .then(|| chrono::Duration::from_std(retry_after).ok())
                .flatten()
                .map(|left| Utc::now() + left),
        }
    }

    /// Administrative reset of an identifier's counters
    pub async fn unlock(&self, identifier: &str) -> bool {
        let id = normalize(identifier);
        let removed = self.records.write().await.remove(&id).is_some();
        if removed {
            tracing::info!(identifier = %id, "Lockout record cleared by administrator");
        }
        removed
    }
}

impl Default for LockoutManager {
    fn default() -> Self {
        Self::new(LockoutConfig::default())
    }
}

fn normalize(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{Algorithm, Params, Version};

    /// Cheap argon2 parameters so tests don't spend seconds hashing
    fn test_hash(password: &str) -> String {
        let params = Params::new(1024, 1, 1, None).unwrap();
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::generate(&mut OsRng);
        argon2
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn manager(max_attempts: u32, secs: u64) -> LockoutManager {
        LockoutManager::new(LockoutConfig {
            max_attempts,
            lockout_duration: Duration::from_secs(secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_after_max_failures() {
        let lockout = manager(5, 300);
        let hash = test_hash("correct horse");

        for _ in 0..5 {
            assert!(!lockout
                .verify_with_lockout("alice", "wrong", &hash)
                .await
                .unwrap());
        }

        // Correct password is refused while locked
        match lockout.verify_with_lockout("alice", "correct horse", &hash).await {
            Err(Error::AccountLocked {
                identifier,
                retry_after,
            }) => {
                assert_eq!(identifier, "alice");
                assert_eq!(retry_after, Duration::from_secs(300));
            }
            other => panic!("expected lockout, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(lockout
            .verify_with_lockout("alice", "correct horse", &hash)
            .await
            .unwrap());
        assert_eq!(lockout.status("alice").await.attempts, 0);
    }

    #[tokio::test]
    async fn test_success_clears_counter() {
        let lockout = manager(3, 60);
        let hash = test_hash("pw");

        assert!(!lockout.verify_with_lockout("bob", "nope", &hash).await.unwrap());
        assert!(!lockout.verify_with_lockout("bob", "nope", &hash).await.unwrap());
        assert_eq!(lockout.status("bob").await.attempts, 2);

        assert!(lockout.verify_with_lockout("bob", "pw", &hash).await.unwrap());
        assert_eq!(lockout.status("bob").await.attempts, 0);

        // Counter restarted, so two more failures do not lock
        assert!(!lockout.verify_with_lockout("bob", "nope", &hash).await.unwrap());
        assert!(!lockout.verify_with_lockout("bob", "nope", &hash).await.unwrap());
        assert!(!lockout.status("bob").await.locked);
    }

    #[tokio::test]
    async fn test_identifiers_are_case_insensitive() {
        let lockout = manager(2, 60);
        let hash = test_hash("pw");

        assert!(!lockout.verify_with_lockout("Carol@Example.com", "x", &hash).await.unwrap());
        assert!(!lockout.verify_with_lockout("carol@example.com ", "x", &hash).await.unwrap());

        let status = lockout.status("CAROL@EXAMPLE.COM").await;
        assert!(status.locked);
        assert!(status.locked_until.is_some());
        assert!(lockout.status("dave@example.com").await.attempts == 0);
    }

    #[tokio::test]
    async fn test_unlock_lifts_lock() {
        let lockout = manager(1, 3600);
        let hash = test_hash("pw");

        assert!(!lockout.verify_with_lockout("erin", "x", &hash).await.unwrap());
        assert!(lockout.status("erin").await.locked);

        assert!(lockout.unlock("erin").await);
        assert!(lockout.verify_with_lockout("erin", "pw", &hash).await.unwrap());
        assert!(!lockout.unlock("erin").await);
    }

    #[tokio::test]
    async fn test_malformed_hash_does_not_count() {
        let lockout = manager(1, 60);
        let result = lockout.verify_with_lockout("frank", "pw", "not-a-phc-string").await;
        assert!(matches!(result, Err(Error::Hash(_))));
        assert_eq!(lockout.status("frank").await.attempts, 0);
    }

    /// Run `guesses` concurrently; returns the comparison outcomes and the refusal count
    async fn concurrent_attempts(
        lockout: &LockoutManager,
        identifier: &str,
        hash: &str,
        guesses: Vec<&'static str>,
    ) -> (Vec<bool>, usize) {
        let tasks: Vec<_> = guesses
            .into_iter()
            .map(|guess| {
                let lockout = lockout.clone();
                let identifier = identifier.to_string();
                let hash = hash.to_string();
                tokio::spawn(async move {
                    lockout.verify_with_lockout(&identifier, guess, &hash).await
                })
            })
            .collect();

        let mut compared = Vec::new();
        let mut refused = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(matched) => compared.push(matched),
                Err(Error::AccountLocked { .. }) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        (compared, refused)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_failures_capped_at_max_attempts() {
        let lockout = manager(5, 300);
        let hash = test_hash("pw");

        let (compared, refused) =
            concurrent_attempts(&lockout, "victim", &hash, vec!["wrong"; 40]).await;

        assert_eq!(compared.len(), 5);
        assert_eq!(refused, 35);
        let status = lockout.status("victim").await;
        assert_eq!(status.attempts, 5);
        assert!(status.locked);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_success_cannot_clear_lock() {
        let hash = test_hash("pw");

        for _ in 0..20 {
            let lockout = manager(3, 300);
            let mut guesses = vec!["wrong"; 11];
            guesses.insert(5, "pw");

            let (compared, _) = concurrent_attempts(&lockout, "victim", &hash, guesses).await;
            let succeeded = compared.iter().any(|&matched| matched);
            let failed = compared.iter().filter(|&&matched| !matched).count();

            // Fewer than max failures before the success, at most max after it
            assert!(failed <= if succeeded { 5 } else { 3 });
            let status = lockout.status("victim").await;
            assert!(status.attempts <= 3);
            assert_eq!(status.locked, status.attempts >= 3);
        }
    }

    #[test]
    fn test_hash_password_produces_phc() {
        let lockout = LockoutManager::default();
        let hash = lockout.hash_password("secret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(PasswordHash::new(&hash).is_ok());
    }
}
