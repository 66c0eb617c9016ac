//! Redis backend
//!
//! Uses a multiplexed [`ConnectionManager`], which reconnects on its own
//! after connection loss. Pattern enumeration iterates with SCAN rather
//! than KEYS so large keyspaces do not block the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::RwLock;

use super::script::{EvalReply, Script};
use super::{ttl_millis, KvBackend, Ttl};
use crate::common::{Error, Result};

/// Keys requested per SCAN round trip
const SCAN_COUNT: usize = 500;

pub struct RedisBackend {
    conn: RwLock<Option<ConnectionManager>>,
    endpoint: String,
}

impl RedisBackend {
    /// Connect to `redis://` or `rediss://` URL
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::InvalidConfig(format!("invalid redis url: {}", e)))?;
        let endpoint = client.get_connection_info().addr.to_string();
        let conn = ConnectionManager::new(client).await?;

        tracing::info!(endpoint = %endpoint, "Connected to redis");
        Ok(Self {
            conn: RwLock::new(Some(conn)),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        self.conn.read().await.clone().ok_or(Error::Closed)
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Ttl>> {
        let mut conn = self.conn().await?;
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(match pttl {
            -2 => None,
            -1 => Some(Ttl::Persistent),
            ms if ms >= 0 => Some(Ttl::Expires(Duration::from_millis(ms as u64))),
            other => return Err(Error::Store(format!("unexpected PTTL reply {}", other))),
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<EvalReply> {
        let mut conn = self.conn().await?;
        let lua = redis::Script::new(script.source());
        let mut invocation = lua.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let value: redis::Value = invocation.invoke_async(&mut conn).await?;
        Ok(EvalReply::from(value))
    }

    async fn close(&self) -> Result<()> {
        if self.conn.write().await.take().is_some() {
            tracing::info!(endpoint = %self.endpoint, "Closed redis connection");
        }
        Ok(())
    }
}
