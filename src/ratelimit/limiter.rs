//! Store-backed rate limiter.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::algorithm::{LimitParams, RateLimitAlgorithm};
use crate::config::RateLimitingConfig;
use crate::store::{AtomicScript, CounterStore, ScriptKind, StoreError, StoreResult};

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// The store evaluated the check.
    Store,
    /// Parameters were rejected before touching the store.
    Invalid,
    /// The store failed; the request was admitted without a real check.
    Degraded,
}

/// The result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Milliseconds until the request could succeed; `-1` for invalid input.
    pub wait_time_ms: i64,
    /// Tokens (or window budget) left after this check; `-1` when unknown.
    pub remaining: i64,
    pub source: DecisionSource,
}

impl RateLimitDecision {
    fn invalid() -> Self {
        Self {
            allowed: false,
            wait_time_ms: -1,
            remaining: -1,
            source: DecisionSource::Invalid,
        }
    }

    fn degraded() -> Self {
        Self {
            allowed: true,
            wait_time_ms: 0,
            remaining: -1,
            source: DecisionSource::Degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.source == DecisionSource::Degraded
    }
}

/// Per-key admission control evaluated atomically by the shared store.
///
/// The limiter keeps no authoritative state of its own; it only caches the
/// hashes of its two scripts. Any number of limiters, in any number of
/// processes, can safely share one store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    algorithm: RateLimitAlgorithm,
    ttl_factor: u64,
    token_bucket: AtomicScript,
    fixed_window: AtomicScript,
}

impl RateLimiter {
    /// Create a rate limiter using the default algorithm and TTL factor.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_config(store, &RateLimitingConfig::default())
    }

    /// Create a rate limiter from configuration.
    pub fn with_config(store: Arc<dyn CounterStore>, config: &RateLimitingConfig) -> Self {
        Self {
            store,
            algorithm: config.algorithm,
            ttl_factor: config.ttl_factor.max(1),
            token_bucket: AtomicScript::new(ScriptKind::TokenBucket),
            fixed_window: AtomicScript::new(ScriptKind::FixedWindow),
        }
    }

    /// The algorithm used by [`RateLimiter::check_rate_limit`].
    pub fn algorithm(&self) -> RateLimitAlgorithm {
        self.algorithm
    }

    /// Check (and optionally consume) `units` against `key` using the
    /// configured algorithm and the current wall clock.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        key_type: &str,
        capacity: u64,
        window_ms: u64,
        units: u64,
        consume: bool,
    ) -> RateLimitDecision {
        let params = LimitParams {
            capacity,
            window_ms,
            units,
            consume,
        };
        self.check_with(self.algorithm, key, key_type, params, now_millis())
            .await
    }

    /// Check with an explicit algorithm and timestamp.
    pub async fn check_with(
        &self,
        algorithm: RateLimitAlgorithm,
        key: &str,
        key_type: &str,
        params: LimitParams,
        now_ms: u64,
    ) -> RateLimitDecision {
        if !params.is_valid() {
            debug!(
                key = %key,
                key_type = %key_type,
                capacity = params.capacity,
                window_ms = params.window_ms,
                units = params.units,
                "Rejecting rate limit check with invalid parameters"
            );
            return RateLimitDecision::invalid();
        }

        trace!(
            key = %key,
            key_type = %key_type,
            algorithm = %algorithm,
            units = params.units,
            "Checking rate limit"
        );

        match self.evaluate(algorithm, key, key_type, params, now_ms).await {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        key_type = %key_type,
                        wait_time_ms = decision.wait_time_ms,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                warn!(
                    key = %key,
                    key_type = %key_type,
                    error = %e,
                    "Rate limit store unavailable, admitting request"
                );
                RateLimitDecision::degraded()
            }
        }
    }

    async fn evaluate(
        &self,
        algorithm: RateLimitAlgorithm,
        key: &str,
        key_type: &str,
        params: LimitParams,
        now_ms: u64,
    ) -> StoreResult<RateLimitDecision> {
        let script = match algorithm {
            RateLimitAlgorithm::TokenBucket => &self.token_bucket,
            RateLimitAlgorithm::FixedWindow => &self.fixed_window,
        };

        let keys = vec![state_key(algorithm, key, key_type, params.window_ms)];
        let ttl_ms = params.window_ms.saturating_mul(self.ttl_factor);
        let args = vec![
            params.capacity.to_string(),
            params.window_ms.to_string(),
            params.units.to_string(),
            now_ms.to_string(),
            u8::from(params.consume).to_string(),
            ttl_ms.to_string(),
        ];

        let reply = script.invoke(self.store.as_ref(), &keys, &args).await?;
        parse_reply(&reply)
    }
}

/// State key for one logical limiter.
///
/// The braces form a hash tag so everything for this limiter lands on the
/// same store partition.
pub fn state_key(algorithm: RateLimitAlgorithm, key: &str, key_type: &str, window_ms: u64) -> String {
    format!(
        "{{ratelimit:{}:{}:{}}}:{}",
        key_type,
        key,
        window_ms,
        algorithm.key_suffix()
    )
}

fn parse_reply(reply: &[String]) -> StoreResult<RateLimitDecision> {
    let field = |i: usize| -> StoreResult<i64> {
        reply
            .get(i)
            .and_then(|raw| raw.parse::<f64>().ok())
            .map(|v| v as i64)
            .ok_or_else(|| StoreError::UnexpectedReply(format!("rate limit reply {:?}", reply)))
    };

    Ok(RateLimitDecision {
        allowed: field(0)? == 1,
        wait_time_ms: field(1)?,
        remaining: field(2)?,
        source: DecisionSource::Store,
    })
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
