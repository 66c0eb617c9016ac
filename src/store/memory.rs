//! In-memory backend
//!
//! Single-process stand-in for the shared store. Expiry is evaluated lazily
//! on access against the tokio clock, so paused-time tests can advance it.
//! The built-in scripts run natively under the write lock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::script::{EvalReply, Script, EXTEND_IF_OWNED, RELEASE_IF_OWNED};
use super::{KvBackend, Ttl};
use crate::common::utils::glob_match;
use crate::common::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &[u8], ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Compare the stored value with `token` and apply `act` on a match
    async fn compare_and_act<F>(&self, key: &str, token: &str, act: F) -> i64
    where
        F: FnOnce(&mut HashMap<String, Entry>) -> i64,
    {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let owned = entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value == token.as_bytes())
            .unwrap_or(false);
        if owned {
            act(&mut entries)
        } else {
            0
        }
    }
}

fn script_arg<'a>(values: &'a [String], index: usize, script: &Script) -> Result<&'a str> {
    values.get(index).map(String::as_str).ok_or_else(|| {
        Error::Store(format!(
            "script {} expects at least {} values, got {}",
            script.name(),
            index + 1,
            values.len()
        ))
    })
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).map(|e| e.is_live(now)).unwrap_or(false) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, Some(ttl)));
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Ttl>> {
        self.ensure_open()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| match entry.expires_at {
                Some(at) => Ttl::Expires(at.saturating_duration_since(now)),
                None => Ttl::Persistent,
            }))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<EvalReply> {
        self.ensure_open()?;

        if *script == RELEASE_IF_OWNED {
            let key = script_arg(keys, 0, script)?;
            let token = script_arg(args, 0, script)?;
            let removed = self
                .compare_and_act(key, token, |entries| {
                    entries.remove(key);
                    1
                })
                .await;
            return Ok(EvalReply::Int(removed));
        }

        if *script == EXTEND_IF_OWNED {
            let key = script_arg(keys, 0, script)?;
            let token = script_arg(args, 0, script)?;
            let ttl_ms: u64 = script_arg(args, 1, script)?
                .parse()
                .map_err(|_| Error::Store(format!("script {}: ttl is not an integer", script.name())))?;
            let extended = self
                .compare_and_act(key, token, |entries| match entries.get_mut(key) {
                    Some(entry) => {
                        entry.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
                        1
                    }
                    None => 0,
                })
                .await;
            return Ok(EvalReply::Int(extended));
        }

        Err(Error::Unsupported(format!(
            "memory backend cannot run script {}",
            script.name()
        )))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.entries.write().await.clear();
        Ok(())
    }
}
