//! Tollgate - AI gateway enforcement core
//!
//! This crate decides, for every request passing through an AI gateway,
//! whether the caller is within its rate limit and its usage budget, and
//! records consumption once the request completes. All shared state lives in
//! a counter store (Redis in production) so any number of gateway instances
//! can enforce the same limits.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod usage;
