//! Tracking of buckets that have crossed their credit limit.

use std::collections::HashSet;
use std::sync::Arc;

use moka::future::Cache;
use tracing::{debug, info};

use crate::config::UsageLimitsConfig;
use crate::store::{CounterStore, StoreResult};

/// Store key of the exhausted set for one policy.
pub fn exhausted_set_key(organisation_id: &str, workspace_id: &str, policy_id: &str) -> String {
    format!(
        "usage-limits-exhausted-{}-{}-{}",
        organisation_id, workspace_id, policy_id
    )
}

/// Per-policy sets of exhausted value keys.
///
/// Reads are memoized locally for a few seconds, so a bucket exhausted by
/// another instance may keep admitting requests until the memo expires.
/// Writes always go straight to the store.
pub struct ExhaustionTracker {
    store: Arc<dyn CounterStore>,
    cache: Option<Cache<String, Arc<HashSet<String>>>>,
}

impl ExhaustionTracker {
    pub fn new(store: Arc<dyn CounterStore>, config: &UsageLimitsConfig) -> Self {
        let ttl = config.exhaustion_cache_ttl();
        let cache = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(config.exhaustion_cache_capacity)
                .time_to_live(ttl)
                .build()
        });

        Self { store, cache }
    }

    pub async fn is_exhausted(
        &self,
        organisation_id: &str,
        workspace_id: &str,
        policy_id: &str,
        value_key: &str,
    ) -> StoreResult<bool> {
        let key = exhausted_set_key(organisation_id, workspace_id, policy_id);
        let members = self.members(&key).await?;
        Ok(members.contains(value_key))
    }

    pub async fn mark_exhausted(
        &self,
        organisation_id: &str,
        workspace_id: &str,
        policy_id: &str,
        value_key: &str,
    ) -> StoreResult<()> {
        let key = exhausted_set_key(organisation_id, workspace_id, policy_id);
        self.store.add_to_set(&key, value_key).await?;
        self.invalidate(&key).await;

        info!(
            organisation_id = %organisation_id,
            policy_id = %policy_id,
            value_key = %value_key,
            "Marked usage limit bucket exhausted"
        );
        Ok(())
    }

    /// Remove a bucket from the exhausted set, as a periodic reset does.
    pub async fn clear_exhausted(
        &self,
        organisation_id: &str,
        workspace_id: &str,
        policy_id: &str,
        value_key: &str,
    ) -> StoreResult<()> {
        let key = exhausted_set_key(organisation_id, workspace_id, policy_id);
        self.store.remove_from_set(&key, value_key).await?;
        self.invalidate(&key).await;

        info!(
            organisation_id = %organisation_id,
            policy_id = %policy_id,
            value_key = %value_key,
            "Cleared exhausted usage limit bucket"
        );
        Ok(())
    }

    async fn members(&self, key: &str) -> StoreResult<Arc<HashSet<String>>> {
        let Some(cache) = &self.cache else {
            return Ok(Arc::new(self.store.get_set_members(key).await?));
        };

        if let Some(members) = cache.get(key).await {
            return Ok(members);
        }

        debug!(key = %key, "Exhausted set not memoized, reading from store");
        let members = Arc::new(self.store.get_set_members(key).await?);
        cache.insert(key.to_string(), members.clone()).await;
        Ok(members)
    }

    // Only this instance's memo; other instances converge when theirs expire.
    async fn invalidate(&self, key: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(key).await;
        }
    }
}
