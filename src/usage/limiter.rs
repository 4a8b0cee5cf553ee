//! Pre-request validation and post-request recording of usage limits.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::counter::{effective_limit, BudgetCounter};
use super::exhaustion::ExhaustionTracker;
use super::matcher;
use super::policy::{CounterType, PolicyContext, UsageLimitsPolicy};
use super::resync::{PolicyBucket, ResyncNotifier, ResyncRequest};
use crate::config::UsageLimitsConfig;
use crate::store::{CounterStore, StoreResult};

/// A matching policy, its bucket, and whether that bucket is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult<'a> {
    pub policy: &'a UsageLimitsPolicy,
    pub value_key: String,
    pub is_exhausted: bool,
    /// The exhaustion lookup failed and `is_exhausted` is an optimistic default.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome<'a> {
    pub is_exhausted: bool,
    /// First exhausted match in policy order.
    pub blocking_policy: Option<MatchResult<'a>>,
    /// At least one lookup failed, so the answer may be too permissive.
    pub degraded: bool,
}

/// What [`UsageLimiter::post_request_record`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSummary {
    /// Counters actually incremented.
    pub incremented: usize,
    /// Buckets that crossed their limit during this call.
    pub newly_exhausted: Vec<PolicyBucket>,
    pub resync_failures: usize,
    /// Some store operation failed and was skipped.
    pub degraded: bool,
}

/// Current usage of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketUsage {
    pub policy_id: String,
    pub value_key: String,
    pub counter_type: CounterType,
    /// In cents for cost counters.
    pub value: f64,
    /// In the same unit as `value`.
    pub limit: f64,
    pub is_exhausted: bool,
}

#[derive(Debug, Default)]
struct MatchRecord {
    incremented: bool,
    crossed: Option<(String, ResyncRequest)>,
    degraded: bool,
}

/// Enforces usage limit policies against the shared store.
///
/// Store failures never surface as errors from the request path: lookups
/// default to "not exhausted" and failed increments are skipped, with the
/// outcome flagged as degraded.
pub struct UsageLimiter {
    counter: BudgetCounter,
    exhaustion: ExhaustionTracker,
    resync: Option<Arc<dyn ResyncNotifier>>,
}

impl UsageLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: &UsageLimitsConfig) -> Self {
        Self {
            counter: BudgetCounter::new(store.clone()),
            exhaustion: ExhaustionTracker::new(store, config),
            resync: None,
        }
    }

    /// Notify the control plane whenever a bucket becomes exhausted.
    pub fn with_resync(mut self, notifier: Arc<dyn ResyncNotifier>) -> Self {
        self.resync = Some(notifier);
        self
    }

    /// Match `policies` against `context` and attach exhaustion state.
    pub async fn match_policies<'a>(
        &self,
        policies: &'a [UsageLimitsPolicy],
        context: &PolicyContext,
    ) -> Vec<MatchResult<'a>> {
        let lookups = matcher::match_policies(policies, context)
            .into_iter()
            .map(|m| async move {
                let lookup = self
                    .exhaustion
                    .is_exhausted(
                        &m.policy.organisation_id,
                        &m.policy.workspace_id,
                        &m.policy.id,
                        &m.value_key,
                    )
                    .await;

                match lookup {
                    Ok(is_exhausted) => MatchResult {
                        policy: m.policy,
                        value_key: m.value_key,
                        is_exhausted,
                        degraded: false,
                    },
                    Err(e) => {
                        warn!(
                            policy_id = %m.policy.id,
                            value_key = %m.value_key,
                            error = %e,
                            "Exhaustion lookup failed, treating bucket as not exhausted"
                        );
                        MatchResult {
                            policy: m.policy,
                            value_key: m.value_key,
                            is_exhausted: false,
                            degraded: true,
                        }
                    }
                }
            });

        join_all(lookups).await
    }

    /// Decide whether a request may proceed.
    pub async fn pre_request_validate<'a>(
        &self,
        policies: &'a [UsageLimitsPolicy],
        context: &PolicyContext,
    ) -> ValidationOutcome<'a> {
        if policies.is_empty() {
            return ValidationOutcome {
                is_exhausted: false,
                blocking_policy: None,
                degraded: false,
            };
        }

        let matches = self.match_policies(policies, context).await;
        let degraded = matches.iter().any(|m| m.degraded);
        let blocking_policy = matches.into_iter().find(|m| m.is_exhausted);

        if let Some(blocking) = &blocking_policy {
            debug!(
                policy_id = %blocking.policy.id,
                value_key = %blocking.value_key,
                "Request blocked by exhausted usage limit"
            );
        }

        ValidationOutcome {
            is_exhausted: blocking_policy.is_some(),
            blocking_policy,
            degraded,
        }
    }

    /// Record consumption after a request completes.
    ///
    /// `cost_amount` is in cents. Every resync triggered by this call has
    /// finished (successfully or not) by the time it returns.
    pub async fn post_request_record(
        &self,
        policies: &[UsageLimitsPolicy],
        context: &PolicyContext,
        cost_amount: f64,
        token_amount: f64,
    ) -> RecordSummary {
        let matches = self.match_policies(policies, context).await;
        let mut summary = RecordSummary {
            degraded: matches.iter().any(|m| m.degraded),
            ..Default::default()
        };

        let records = join_all(
            matches
                .iter()
                .filter(|m| !m.is_exhausted)
                .map(|m| self.record_match(m, cost_amount, token_amount)),
        )
        .await;

        let mut pending = Vec::new();
        for record in records {
            summary.incremented += usize::from(record.incremented);
            summary.degraded |= record.degraded;
            if let Some((organisation_id, request)) = record.crossed {
                summary
                    .newly_exhausted
                    .extend(request.usage_limits_policies_to_exhaust.iter().cloned());
                pending.push((organisation_id, request));
            }
        }

        if let Some(notifier) = &self.resync {
            let results = join_all(pending.iter().map(|(organisation_id, request)| async move {
                let result = notifier.notify(organisation_id, request).await;
                if let Err(e) = &result {
                    error!(
                        organisation_id = %organisation_id,
                        error = %e,
                        "Usage limit resync failed"
                    );
                }
                result
            }))
            .await;
            summary.resync_failures = results.iter().filter(|r| r.is_err()).count();
        }

        summary
    }

    async fn record_match(
        &self,
        m: &MatchResult<'_>,
        cost_amount: f64,
        token_amount: f64,
    ) -> MatchRecord {
        let policy = m.policy;
        let counter_type = policy.counter_type();
        let amount = match counter_type {
            CounterType::Cost => cost_amount,
            CounterType::Tokens => token_amount,
        };

        let outcome = match self
            .counter
            .increment(
                &policy.organisation_id,
                &policy.id,
                &m.value_key,
                counter_type,
                amount,
                policy.credit_limit,
            )
            .await
        {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return MatchRecord::default(),
            Err(e) => {
                warn!(
                    policy_id = %policy.id,
                    value_key = %m.value_key,
                    error = %e,
                    "Usage counter increment failed, skipping"
                );
                return MatchRecord {
                    degraded: true,
                    ..Default::default()
                };
            }
        };

        let mut record = MatchRecord {
            incremented: true,
            ..Default::default()
        };
        if !(outcome.threshold_crossed && outcome.exhausted) {
            return record;
        }

        info!(
            policy_id = %policy.id,
            value_key = %m.value_key,
            usage = outcome.value,
            "Usage limit reached"
        );
        if let Err(e) = self
            .exhaustion
            .mark_exhausted(
                &policy.organisation_id,
                &policy.workspace_id,
                &policy.id,
                &m.value_key,
            )
            .await
        {
            warn!(
                policy_id = %policy.id,
                value_key = %m.value_key,
                error = %e,
                "Failed to mark bucket exhausted"
            );
            record.degraded = true;
        }

        record.crossed = Some((
            policy.organisation_id.clone(),
            ResyncRequest::exhausted(&policy.id, &m.value_key, outcome.value),
        ));
        record
    }

    /// Usage of every bucket `context` falls into.
    pub async fn usage_for(
        &self,
        policies: &[UsageLimitsPolicy],
        context: &PolicyContext,
    ) -> StoreResult<Vec<BucketUsage>> {
        let mut usage = Vec::new();
        for m in matcher::match_policies(policies, context) {
            let policy = m.policy;
            let counter_type = policy.counter_type();
            let value = self
                .counter
                .current_value(&policy.organisation_id, &policy.id, &m.value_key, counter_type)
                .await?;
            let is_exhausted = self
                .exhaustion
                .is_exhausted(
                    &policy.organisation_id,
                    &policy.workspace_id,
                    &policy.id,
                    &m.value_key,
                )
                .await?;

            trace!(policy_id = %policy.id, value_key = %m.value_key, value, "Read bucket usage");
            usage.push(BucketUsage {
                policy_id: policy.id.clone(),
                value_key: m.value_key,
                counter_type,
                value,
                limit: effective_limit(counter_type, policy.credit_limit),
                is_exhausted,
            });
        }
        Ok(usage)
    }

    /// Zero a bucket's counter and lift its exhaustion, as a periodic reset does.
    pub async fn reset_bucket(&self, policy: &UsageLimitsPolicy, value_key: &str) -> StoreResult<()> {
        self.counter
            .reset(&policy.organisation_id, &policy.id, value_key, policy.counter_type())
            .await?;
        self.exhaustion
            .clear_exhausted(
                &policy.organisation_id,
                &policy.workspace_id,
                &policy.id,
                value_key,
            )
            .await?;

        info!(policy_id = %policy.id, value_key = %value_key, "Reset usage limit bucket");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::usage::policy::{Condition, GroupByField, PolicyKey, PolicyStatus};
    use crate::usage::resync::ResyncError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(String, ResyncRequest)>>,
        fail: bool,
    }

    #[async_trait]
    impl ResyncNotifier for RecordingNotifier {
        async fn notify(&self, organisation_id: &str, request: &ResyncRequest) -> Result<(), ResyncError> {
            self.calls
                .lock()
                .push((organisation_id.to_string(), request.clone()));
            if self.fail {
                return Err(ResyncError::Status(500));
            }
            Ok(())
        }
    }

    fn policy(id: &str, group_by: &[&str], credit_limit: f64, policy_type: Option<CounterType>) -> UsageLimitsPolicy {
        UsageLimitsPolicy {
            id: id.to_string(),
            organisation_id: "org-1".to_string(),
            workspace_id: "ws-1".to_string(),
            conditions: vec![],
            group_by: group_by
                .iter()
                .map(|k| GroupByField {
                    key: PolicyKey::from(*k),
                })
                .collect(),
            credit_limit,
            policy_type,
            periodic_reset: None,
            status: PolicyStatus::Active,
        }
    }

    fn context(api_key: &str) -> PolicyContext {
        PolicyContext {
            api_key_id: Some(api_key.to_string()),
            ..Default::default()
        }
    }

    fn limiter(store: Arc<MemoryStore>, notifier: Arc<RecordingNotifier>) -> UsageLimiter {
        UsageLimiter::new(store, &UsageLimitsConfig::default()).with_resync(notifier)
    }

    #[tokio::test]
    async fn test_end_to_end_exhaustion() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let limiter = limiter(store, notifier.clone());
        let policies = vec![policy("p1", &["api_key"], 100.0, Some(CounterType::Cost))];
        let ctx = context("k1");

        let outcome = limiter.pre_request_validate(&policies, &ctx).await;
        assert!(!outcome.is_exhausted);
        assert!(outcome.blocking_policy.is_none());

        // $100.00 as forty requests of $2.50.
        for _ in 0..40 {
            limiter.post_request_record(&policies, &ctx, 250.0, 0.0).await;
        }

        let outcome = limiter.pre_request_validate(&policies, &ctx).await;
        assert!(outcome.is_exhausted);
        let blocking = outcome.blocking_policy.unwrap();
        assert_eq!(blocking.policy.id, "p1");
        assert_eq!(blocking.value_key, "api_key:k1");

        // Other keys are unaffected.
        assert!(!limiter.pre_request_validate(&policies, &context("k2")).await.is_exhausted);

        let calls = notifier.calls.lock();
        assert_eq!(calls.len(), 1);
        let (organisation_id, request) = &calls[0];
        assert_eq!(organisation_id, "org-1");
        assert_eq!(request.usage_limits_policies_to_update_usage[0].usage, 10_000.0);
        assert_eq!(
            serde_json::to_value(request).unwrap()["usageLimitsPoliciesToUpdateUsage"][0]["usage"],
            serde_json::json!(10000)
        );
    }

    #[tokio::test]
    async fn test_exhausted_buckets_are_not_incremented() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let limiter = limiter(store, notifier.clone());
        let policies = vec![policy("p1", &[], 1.0, None)];
        let ctx = PolicyContext::default();

        let summary = limiter.post_request_record(&policies, &ctx, 100.0, 0.0).await;
        assert_eq!(summary.incremented, 1);
        assert_eq!(summary.newly_exhausted.len(), 1);

        let summary = limiter.post_request_record(&policies, &ctx, 100.0, 0.0).await;
        assert_eq!(summary.incremented, 0);
        assert!(summary.newly_exhausted.is_empty());
        assert_eq!(notifier.calls.lock().len(), 1);

        let usage = limiter.usage_for(&policies, &ctx).await.unwrap();
        assert_eq!(usage[0].value, 100.0);
        assert!(usage[0].is_exhausted);
    }

    #[tokio::test]
    async fn test_first_exhausted_policy_blocks() {
        let store = Arc::new(MemoryStore::new());
        let limiter = UsageLimiter::new(store, &UsageLimitsConfig::default());
        let policies = vec![
            policy("p1", &[], 1000.0, None),
            policy("p2", &[], 1.0, None),
            policy("p3", &[], 1.0, None),
        ];
        let ctx = context("k1");

        limiter.post_request_record(&policies, &ctx, 500.0, 0.0).await;

        let outcome = limiter.pre_request_validate(&policies, &ctx).await;
        assert!(outcome.is_exhausted);
        assert_eq!(outcome.blocking_policy.unwrap().policy.id, "p2");
    }

    #[tokio::test]
    async fn test_no_policies_is_not_exhausted() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let limiter = UsageLimiter::new(store, &UsageLimitsConfig::default());

        let outcome = limiter.pre_request_validate(&[], &context("k1")).await;
        assert!(!outcome.is_exhausted);
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn test_fail_open_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let notifier = Arc::new(RecordingNotifier::default());
        let limiter = limiter(store, notifier.clone());
        let policies = vec![policy("p1", &["api_key"], 100.0, None)];
        let ctx = context("k1");

        let outcome = limiter.pre_request_validate(&policies, &ctx).await;
        assert!(!outcome.is_exhausted);
        assert!(outcome.degraded);

        let summary = limiter.post_request_record(&policies, &ctx, 1_000_000.0, 0.0).await;
        assert_eq!(summary.incremented, 0);
        assert!(summary.degraded);
        assert!(notifier.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_token_policies_use_token_amount() {
        let store = Arc::new(MemoryStore::new());
        let limiter = UsageLimiter::new(store, &UsageLimitsConfig::default());
        let policies = vec![
            policy("cost", &[], 100.0, Some(CounterType::Cost)),
            policy("tokens", &[], 1000.0, Some(CounterType::Tokens)),
        ];
        let ctx = PolicyContext::default();

        let summary = limiter.post_request_record(&policies, &ctx, 0.0, 1000.0).await;
        assert_eq!(summary.incremented, 1);
        assert_eq!(summary.newly_exhausted[0].id, "tokens");

        let usage = limiter.usage_for(&policies, &ctx).await.unwrap();
        assert_eq!(usage[0].value, 0.0);
        assert_eq!(usage[0].limit, 10_000.0);
        assert_eq!(usage[1].value, 1000.0);
        assert!(usage[1].is_exhausted);
    }

    #[tokio::test]
    async fn test_resync_failure_keeps_local_exhaustion() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let limiter = limiter(store, notifier);
        let policies = vec![policy("p1", &[], 1.0, None)];
        let ctx = PolicyContext::default();

        let summary = limiter.post_request_record(&policies, &ctx, 100.0, 0.0).await;
        assert_eq!(summary.resync_failures, 1);
        assert!(limiter.pre_request_validate(&policies, &ctx).await.is_exhausted);
    }

    #[tokio::test]
    async fn test_concurrent_records_cross_once() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let limiter = Arc::new(limiter(store, notifier.clone()));
        let policies = Arc::new(vec![policy("p1", &[], 10.0, None)]);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            let policies = policies.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .post_request_record(&policies, &PolicyContext::default(), 100.0, 0.0)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(notifier.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_bucket_lifts_exhaustion() {
        let store = Arc::new(MemoryStore::new());
        let limiter = UsageLimiter::new(store, &UsageLimitsConfig::default());
        let policies = vec![policy("p1", &["api_key"], 1.0, None)];
        let ctx = context("k1");

        limiter.post_request_record(&policies, &ctx, 100.0, 0.0).await;
        assert!(limiter.pre_request_validate(&policies, &ctx).await.is_exhausted);

        limiter.reset_bucket(&policies[0], "api_key:k1").await.unwrap();
        assert!(!limiter.pre_request_validate(&policies, &ctx).await.is_exhausted);
        assert_eq!(limiter.usage_for(&policies, &ctx).await.unwrap()[0].value, 0.0);
    }

    #[tokio::test]
    async fn test_conditions_gate_recording() {
        let store = Arc::new(MemoryStore::new());
        let limiter = UsageLimiter::new(store, &UsageLimitsConfig::default());
        let mut scoped = policy("p1", &[], 1.0, None);
        scoped.conditions.push(Condition {
            key: PolicyKey::Model,
            value: "gpt-4o".to_string(),
        });
        let policies = vec![scoped];

        let summary = limiter.post_request_record(&policies, &context("k1"), 100.0, 0.0).await;
        assert_eq!(summary.incremented, 0);

        let ctx = PolicyContext {
            model: Some("gpt-4o".to_string()),
            ..Default::default()
        };
        let summary = limiter.post_request_record(&policies, &ctx, 100.0, 0.0).await;
        assert_eq!(summary.incremented, 1);
    }
}
