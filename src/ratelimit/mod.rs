//! Rate limiting logic.
//!
//! Limiter state lives only in the shared store; each check is a single
//! atomic script so concurrent gateway instances never overrun capacity.

mod algorithm;
mod limiter;

pub use algorithm::{
    CheckOutcome, FixedWindowState, LimitParams, RateLimitAlgorithm, TokenBucketState,
    FIXED_WINDOW_SCRIPT, TOKEN_BUCKET_SCRIPT,
};
pub use limiter::{state_key, DecisionSource, RateLimitDecision, RateLimiter};
