//! Registered server-side scripts and their cached hashes.

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{CounterStore, StoreError, StoreResult};
use crate::ratelimit::{FIXED_WINDOW_SCRIPT, TOKEN_BUCKET_SCRIPT};
use crate::usage::counter::INCREMENT_SCRIPT;

/// The atomic scripts the enforcement core runs against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    TokenBucket,
    FixedWindow,
    BudgetIncrement,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 3] = [
        ScriptKind::TokenBucket,
        ScriptKind::FixedWindow,
        ScriptKind::BudgetIncrement,
    ];

    /// Lua source evaluated by the store.
    pub fn source(&self) -> &'static str {
        match self {
            ScriptKind::TokenBucket => TOKEN_BUCKET_SCRIPT,
            ScriptKind::FixedWindow => FIXED_WINDOW_SCRIPT,
            ScriptKind::BudgetIncrement => INCREMENT_SCRIPT,
        }
    }

    /// Identify a built-in script by its source text.
    pub fn from_source(source: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.source() == source)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScriptKind::TokenBucket => "token_bucket",
            ScriptKind::FixedWindow => "fixed_window",
            ScriptKind::BudgetIncrement => "budget_increment",
        }
    }
}

/// A script handle that remembers the hash the store assigned to it.
///
/// Each owner (rate limiter, budget counter) holds its own handle, so
/// independent instances never share a cached hash.
#[derive(Debug)]
pub struct AtomicScript {
    kind: ScriptKind,
    sha: RwLock<Option<String>>,
}

impl AtomicScript {
    pub fn new(kind: ScriptKind) -> Self {
        Self {
            kind,
            sha: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    /// The cached hash, if the script has been registered by this handle.
    pub fn cached_sha(&self) -> Option<String> {
        self.sha.read().clone()
    }

    /// Run the script, registering it first if needed.
    ///
    /// If the store has forgotten the script (restart, failover, flush) it is
    /// registered again and the call is retried exactly once.
    pub async fn invoke(
        &self,
        store: &dyn CounterStore,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        let sha = match self.cached_sha() {
            Some(sha) => sha,
            None => self.load(store).await?,
        };

        match store.eval_sha(&sha, keys, args).await {
            Err(StoreError::ScriptUnknown(_)) => {
                debug!(script = self.kind.name(), "Script unknown to store, reloading");
                let sha = self.load(store).await?;
                store.eval_sha(&sha, keys, args).await
            }
            other => other,
        }
    }

    async fn load(&self, store: &dyn CounterStore) -> StoreResult<String> {
        let sha = store.script_load(self.kind.source()).await?;
        info!(script = self.kind.name(), sha = %sha, "Registered atomic script");
        *self.sha.write() = Some(sha.clone());
        Ok(sha)
    }
}
