//! Redis-backed counter store.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, FromRedisValue, RedisResult};
use tokio::time::timeout;
use tracing::{debug, info};

use super::{CounterStore, StoreError, StoreResult};

/// A [`CounterStore`] backed by a shared Redis instance.
///
/// The multiplexed connection is cheap to clone and is shared by all
/// concurrent callers. Every operation is bounded by `timeout` so a slow
/// store degrades into an error instead of stalling the request path.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(timeout_ms = timeout.as_millis() as u64, "Connected to Redis counter store");
        Ok(Self { conn, timeout })
    }

    async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.kind() == ErrorKind::NoScriptError => {
                Err(StoreError::ScriptUnknown(e.to_string()))
            }
            Ok(Err(e)) => Err(StoreError::Redis(e)),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn query<T: FromRedisValue + Send>(&self, cmd: redis::Cmd) -> StoreResult<T> {
        let mut conn = self.conn.clone();
        self.run(async move { cmd.query_async(&mut conn).await }).await
    }
}

fn px_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            // PX 0 is rejected, so sub-millisecond TTLs round up.
            cmd.arg("PX").arg(px_millis(ttl));
        }
        let reply: Option<String> = self.query(cmd).await?;
        Ok(reply.is_some())
    }

    async fn get_set_members(&self, key: &str) -> StoreResult<HashSet<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let _: i64 = self.query(cmd).await?;
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        let _: i64 = self.query(cmd).await?;
        Ok(())
    }

    async fn script_load(&self, source: &str) -> StoreResult<String> {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(source);
        self.query(cmd).await
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        debug!(sha = %sha, keys = ?keys, "Evaluating script");
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        self.query(cmd).await
    }
}
