//! Usage limit (budget policy) enforcement.
//!
//! Policies are matched against a request context, usage is bucketed by a
//! derived value key, and buckets that cross their credit limit are marked
//! exhausted and reported to the control plane.

pub mod counter;
pub mod exhaustion;
pub mod limiter;
pub mod matcher;
pub mod policy;
pub mod resync;

pub use counter::{BudgetCounter, IncrementOutcome};
pub use exhaustion::ExhaustionTracker;
pub use limiter::{BucketUsage, MatchResult, RecordSummary, UsageLimiter, ValidationOutcome};
pub use matcher::{match_policies, PolicyMatch, DEFAULT_VALUE_KEY};
pub use policy::{
    resolve_field, Condition, CounterType, GroupByField, PeriodicReset, PolicyContext, PolicyKey,
    PolicySet, PolicyStatus, UsageLimitsPolicy,
};
pub use resync::{HttpResyncClient, ResyncError, ResyncNotifier, ResyncRequest};
