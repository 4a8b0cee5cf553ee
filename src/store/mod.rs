//! Shared counter store abstraction.
//!
//! The store is the only shared mutable resource. Every gateway instance
//! talks to the same backend, so any read-compute-write cycle has to run as
//! a single server-side script rather than as separate client calls.

mod memory;
mod redis_store;
mod script;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisCounterStore;
pub use self::script::{AtomicScript, ScriptKind};

/// Errors reported by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store does not know the referenced script hash (e.g. after a restart).
    #[error("script not loaded: {0}")]
    ScriptUnknown(String),
    /// The store did not answer within the configured timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// Connection or command failure reported by Redis.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// A reply that does not have the expected shape.
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
    /// The store refused to serve requests.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Primitive operations the enforcement core needs from a shared key-value store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Read all members of a set. A missing key is an empty set.
    async fn get_set_members(&self, key: &str) -> StoreResult<HashSet<String>>;

    /// Add `member` to a set, creating the set if needed.
    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Remove `member` from a set. Removing a missing member is not an error.
    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Register a script and return its content hash.
    async fn script_load(&self, source: &str) -> StoreResult<String>;

    /// Run a previously registered script atomically.
    ///
    /// Returns [`StoreError::ScriptUnknown`] when the hash is not registered.
    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>>;
}
