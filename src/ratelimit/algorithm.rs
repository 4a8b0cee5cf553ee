//! Rate limiting algorithms.
//!
//! Each algorithm exists twice: as a Lua script the shared store evaluates
//! atomically, and as a plain state transition used by the in-process store.
//! Both must produce identical results for identical inputs.

use serde::{Deserialize, Serialize};

/// Selectable admission algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Continuous refill up to capacity; smooths bursts.
    #[default]
    TokenBucket,
    /// Hard window boundaries aligned to `window_ms`.
    FixedWindow,
}

impl RateLimitAlgorithm {
    /// Suffix appended to the state key so the algorithms never share state.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::TokenBucket => "tb",
            RateLimitAlgorithm::FixedWindow => "fw",
        }
    }
}

impl std::fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitAlgorithm::TokenBucket => write!(f, "token_bucket"),
            RateLimitAlgorithm::FixedWindow => write!(f, "fixed_window"),
        }
    }
}

/// KEYS[1] = state hash
/// ARGV = capacity, window_ms, units, now_ms, consume (0|1), ttl_ms
///
/// Returns { allowed, wait_time_ms, tokens_remaining }.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local units = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local consume = tonumber(ARGV[5])
local ttl_ms = tonumber(ARGV[6])

local state = redis.call("HMGET", key, "tokens", "last_refill")
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = now - last_refill
if elapsed < 0 then
  elapsed = 0
end
local tokens_to_add = math.floor(elapsed * capacity / window_ms)
if tokens_to_add > 0 then
  tokens = math.min(tokens + tokens_to_add, capacity)
  last_refill = now
end

local allowed = 0
local wait = 0
if tokens >= units then
  allowed = 1
  if consume == 1 then
    tokens = tokens - units
  end
else
  wait = math.ceil((units - tokens) * window_ms / capacity)
end

redis.call("HSET", key, "tokens", tokens, "last_refill", last_refill)
redis.call("PEXPIRE", key, ttl_ms)
return { tostring(allowed), tostring(wait), tostring(tokens) }
"#;

/// KEYS[1] = state hash
/// ARGV = capacity, window_ms, units, now_ms, consume (0|1), ttl_ms
///
/// Returns { allowed, wait_time_ms, remaining }.
pub const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local units = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local consume = tonumber(ARGV[5])
local ttl_ms = tonumber(ARGV[6])

local state = redis.call("HMGET", key, "consumed", "window_start")
local consumed = tonumber(state[1]) or 0
local window_start = tonumber(state[2]) or -1

local current_start = math.floor(now / window_ms) * window_ms
if window_start ~= current_start then
  consumed = 0
  window_start = current_start
end

local allowed = 0
local wait = 0
if consumed + units <= capacity then
  allowed = 1
  if consume == 1 then
    consumed = consumed + units
  end
else
  wait = current_start + window_ms - now
end

redis.call("HSET", key, "consumed", consumed, "window_start", window_start)
redis.call("PEXPIRE", key, ttl_ms)
return { tostring(allowed), tostring(wait), tostring(math.max(capacity - consumed, 0)) }
"#;

/// Inputs shared by both algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitParams {
    pub capacity: u64,
    pub window_ms: u64,
    pub units: u64,
    /// When false the check only peeks; no units are taken.
    pub consume: bool,
}

impl LimitParams {
    pub fn is_valid(&self) -> bool {
        self.capacity > 0 && self.window_ms > 0 && self.units > 0
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub wait_time_ms: u64,
    pub remaining: u64,
}

/// Token bucket state `{tokens, last_refill}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketState {
    pub tokens: u64,
    pub last_refill_ms: u64,
}

impl TokenBucketState {
    /// A full bucket, as seen by the first check against a key.
    pub fn full(capacity: u64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Refill, then admit or reject.
    ///
    /// `last_refill` only advances when at least one whole token was added,
    /// so fractional refill progress is dropped whenever it does advance.
    pub fn check(&mut self, params: LimitParams, now_ms: u64) -> CheckOutcome {
        let capacity = params.capacity as u128;
        let window = params.window_ms as u128;

        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as u128;
        let tokens_to_add = elapsed * capacity / window;
        if tokens_to_add > 0 {
            let refilled = (self.tokens as u128 + tokens_to_add).min(capacity);
            self.tokens = refilled as u64;
            self.last_refill_ms = now_ms;
        }

        if self.tokens >= params.units {
            if params.consume {
                self.tokens -= params.units;
            }
            CheckOutcome {
                allowed: true,
                wait_time_ms: 0,
                remaining: self.tokens,
            }
        } else {
            let missing = (params.units - self.tokens) as u128;
            let wait = (missing * window).div_ceil(capacity);
            CheckOutcome {
                allowed: false,
                wait_time_ms: wait as u64,
                remaining: self.tokens,
            }
        }
    }
}

/// Fixed window state `{consumed, window_start}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedWindowState {
    pub consumed: u64,
    pub window_start_ms: Option<u64>,
}

impl FixedWindowState {
    pub fn check(&mut self, params: LimitParams, now_ms: u64) -> CheckOutcome {
        let current_start = (now_ms / params.window_ms) * params.window_ms;
        if self.window_start_ms != Some(current_start) {
            self.consumed = 0;
            self.window_start_ms = Some(current_start);
        }

        if self.consumed.saturating_add(params.units) <= params.capacity {
            if params.consume {
                self.consumed += params.units;
            }
            CheckOutcome {
                allowed: true,
                wait_time_ms: 0,
                remaining: params.capacity - self.consumed,
            }
        } else {
            CheckOutcome {
                allowed: false,
                wait_time_ms: current_start + params.window_ms - now_ms,
                remaining: params.capacity.saturating_sub(self.consumed),
            }
        }
    }
}
