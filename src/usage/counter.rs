//! Per-bucket usage counters with threshold-crossing detection.

use std::sync::Arc;

use tracing::{debug, trace};

use super::policy::CounterType;
use crate::store::{AtomicScript, CounterStore, ScriptKind, StoreError, StoreResult};

/// Increment a counter and report whether this call crossed the limit.
///
/// KEYS[1] = counter key
/// ARGV[1] = amount
/// ARGV[2] = limit, in the counter's unit
pub const INCREMENT_SCRIPT: &str = r#"
local limit = tonumber(ARGV[2])

local before = tonumber(redis.call('GET', KEYS[1]) or '0') or 0
local raw = redis.call('INCRBYFLOAT', KEYS[1], ARGV[1])
local after = tonumber(raw)

local crossed = 0
if before < limit and after >= limit then
    crossed = 1
end
local exhausted = 0
if after >= limit then
    exhausted = 1
end

return {tostring(raw), tostring(crossed), tostring(exhausted)}
"#;

/// Minor units per major unit for cost limits (dollars to cents).
const CENTS_PER_DOLLAR: f64 = 100.0;

/// Result of one counter increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IncrementOutcome {
    /// Cumulative value after the increment.
    pub value: f64,
    /// True only on the increment that moved the value from below the limit to at or above it.
    pub threshold_crossed: bool,
    pub exhausted: bool,
}

/// The transition the increment script performs, for stores that run it natively.
pub fn apply_increment(before: f64, amount: f64, limit: f64) -> IncrementOutcome {
    let value = before + amount;
    IncrementOutcome {
        value,
        threshold_crossed: before < limit && value >= limit,
        exhausted: value >= limit,
    }
}

pub fn counter_key(
    organisation_id: &str,
    counter_type: CounterType,
    policy_id: &str,
    value_key: &str,
) -> String {
    format!(
        "atomic-counter-{}-{}-USAGE_LIMITS_POLICY-{}-{}",
        organisation_id, counter_type, policy_id, value_key
    )
}

/// Convert a policy's credit limit into the unit its counter accumulates in.
pub fn effective_limit(counter_type: CounterType, credit_limit: f64) -> f64 {
    match counter_type {
        CounterType::Cost => credit_limit * CENTS_PER_DOLLAR,
        CounterType::Tokens => credit_limit,
    }
}

/// Atomic usage counters in the shared store.
pub struct BudgetCounter {
    store: Arc<dyn CounterStore>,
    script: AtomicScript,
}

impl BudgetCounter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            script: AtomicScript::new(ScriptKind::BudgetIncrement),
        }
    }

    /// Add `amount` to a bucket's counter.
    ///
    /// `amount` is in cents for cost counters and in tokens otherwise, while
    /// `credit_limit` is in dollars for cost counters. Returns `None` without
    /// touching the store when there is nothing to add.
    pub async fn increment(
        &self,
        organisation_id: &str,
        policy_id: &str,
        value_key: &str,
        counter_type: CounterType,
        amount: f64,
        credit_limit: f64,
    ) -> StoreResult<Option<IncrementOutcome>> {
        if !amount.is_finite() || amount <= 0.0 {
            trace!(policy_id = %policy_id, amount, "Nothing to record");
            return Ok(None);
        }

        let key = counter_key(organisation_id, counter_type, policy_id, value_key);
        let limit = effective_limit(counter_type, credit_limit);
        let reply = self
            .script
            .invoke(
                self.store.as_ref(),
                &[key.clone()],
                &[amount.to_string(), limit.to_string()],
            )
            .await?;
        let outcome = parse_reply(&reply)?;

        debug!(
            key = %key,
            amount,
            limit,
            value = outcome.value,
            crossed = outcome.threshold_crossed,
            "Incremented usage counter"
        );
        Ok(Some(outcome))
    }

    /// Current value of a bucket's counter, 0 if it was never written.
    pub async fn current_value(
        &self,
        organisation_id: &str,
        policy_id: &str,
        value_key: &str,
        counter_type: CounterType,
    ) -> StoreResult<f64> {
        let key = counter_key(organisation_id, counter_type, policy_id, value_key);
        match self.store.get(&key).await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::UnexpectedReply(format!("counter {} holds {:?}", key, raw))),
            None => Ok(0.0),
        }
    }

    pub async fn reset(
        &self,
        organisation_id: &str,
        policy_id: &str,
        value_key: &str,
        counter_type: CounterType,
    ) -> StoreResult<()> {
        let key = counter_key(organisation_id, counter_type, policy_id, value_key);
        self.store.set(&key, "0", None).await?;
        debug!(key = %key, "Reset usage counter");
        Ok(())
    }
}

fn parse_reply(reply: &[String]) -> StoreResult<IncrementOutcome> {
    match reply {
        [value, crossed, exhausted] => Ok(IncrementOutcome {
            value: value
                .parse()
                .map_err(|_| StoreError::UnexpectedReply(format!("counter value {:?}", value)))?,
            threshold_crossed: crossed == "1",
            exhausted: exhausted == "1",
        }),
        _ => Err(StoreError::UnexpectedReply(format!(
            "increment returned {:?}",
            reply
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn counter() -> (Arc<MemoryStore>, BudgetCounter) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), BudgetCounter::new(store))
    }

    #[test]
    fn test_apply_increment_transitions() {
        let below = apply_increment(0.0, 50.0, 100.0);
        assert!(!below.threshold_crossed && !below.exhausted);

        let crossing = apply_increment(99.0, 1.0, 100.0);
        assert!(crossing.threshold_crossed && crossing.exhausted);

        let after = apply_increment(100.0, 1.0, 100.0);
        assert!(!after.threshold_crossed && after.exhausted);
    }

    #[test]
    fn test_effective_limit_converts_cost_only() {
        assert_eq!(effective_limit(CounterType::Cost, 100.0), 10_000.0);
        assert_eq!(effective_limit(CounterType::Tokens, 100.0), 100.0);
    }

    #[test]
    fn test_counter_key_format() {
        assert_eq!(
            counter_key("org-1", CounterType::Cost, "p1", "api_key:k1"),
            "atomic-counter-org-1-cost-USAGE_LIMITS_POLICY-p1-api_key:k1"
        );
    }

    #[tokio::test]
    async fn test_cost_crosses_exactly_once_at_10000_cents() {
        let (_, counter) = counter();
        let mut crossings = Vec::new();

        for call in 1..=10_010u32 {
            let outcome = counter
                .increment("org", "p1", "default", CounterType::Cost, 1.0, 100.0)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome.exhausted, call >= 10_000);
            if outcome.threshold_crossed {
                crossings.push(outcome.value);
            }
        }

        assert_eq!(crossings, vec![10_000.0]);
    }

    #[tokio::test]
    async fn test_tokens_use_limit_as_is() {
        let (_, counter) = counter();
        let outcome = counter
            .increment("org", "p1", "default", CounterType::Tokens, 150.0, 100.0)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.threshold_crossed);
        assert_eq!(outcome.value, 150.0);
    }

    #[tokio::test]
    async fn test_zero_amount_skips_store() {
        let (store, counter) = counter();
        store.set_unavailable(true);

        let outcome = counter
            .increment("org", "p1", "default", CounterType::Cost, 0.0, 100.0)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(store.script_loads(), 0);
    }

    #[tokio::test]
    async fn test_current_value_and_reset() {
        let (_, counter) = counter();
        assert_eq!(
            counter.current_value("org", "p1", "default", CounterType::Cost).await.unwrap(),
            0.0
        );

        counter
            .increment("org", "p1", "default", CounterType::Cost, 250.0, 100.0)
            .await
            .unwrap();
        assert_eq!(
            counter.current_value("org", "p1", "default", CounterType::Cost).await.unwrap(),
            250.0
        );
        // Different counter type, different key.
        assert_eq!(
            counter.current_value("org", "p1", "default", CounterType::Tokens).await.unwrap(),
            0.0
        );

        counter.reset("org", "p1", "default", CounterType::Cost).await.unwrap();
        assert_eq!(
            counter.current_value("org", "p1", "default", CounterType::Cost).await.unwrap(),
            0.0
        );
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let (store, counter) = counter();
        store.set_unavailable(true);
        let result = counter
            .increment("org", "p1", "default", CounterType::Cost, 1.0, 100.0)
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_parse_reply_rejects_short_reply() {
        assert!(parse_reply(&["1".to_string()]).is_err());
    }
}
