//! In-process counter store.
//!
//! Suitable for a single gateway instance and for tests. Scripts are not
//! interpreted: the built-in scripts are recognised by their source and run
//! as the equivalent Rust state transitions while the store lock is held,
//! which gives the same atomicity a real store provides.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::trace;

use super::{CounterStore, ScriptKind, StoreError, StoreResult};
use crate::ratelimit::{FixedWindowState, LimitParams, TokenBucketState};
use crate::usage::counter::apply_increment;

/// Script runs between full sweeps of expired keys.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Default)]
struct Hash {
    fields: HashMap<String, String>,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct Data {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, Hash>,
    sets: HashMap<String, HashSet<String>>,
    script_runs: u64,
}

fn is_expired(deadline: Option<Instant>, now: Instant) -> bool {
    matches!(deadline, Some(deadline) if deadline <= now)
}

impl Data {
    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.strings.get(key),
            Some((_, deadline)) if is_expired(*deadline, Instant::now())
        );
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    /// Drop `key`'s hash if its TTL has elapsed.
    fn purge_hash_if_expired(&mut self, key: &str) {
        let expired = matches!(
            self.hashes.get(key),
            Some(hash) if is_expired(hash.deadline, Instant::now())
        );
        if expired {
            self.hashes.remove(key);
        }
    }

    fn hash_field<T: FromStr>(&self, key: &str, field: &str) -> Option<T> {
        self.hashes
            .get(key)
            .and_then(|h| h.fields.get(field))
            .and_then(|raw| raw.parse().ok())
    }

    /// Write fields and reset the hash's TTL, like `HSET` followed by `PEXPIRE`.
    fn set_hash_fields(&mut self, key: &str, fields: &[(&str, String)], ttl: Duration) {
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.fields.insert((*field).to_string(), value.clone());
        }
        hash.deadline = Some(Instant::now() + ttl);
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, (_, deadline)| !is_expired(*deadline, now));
        self.hashes.retain(|_, hash| !is_expired(hash.deadline, now));
    }
}

/// A [`CounterStore`] held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<Data>,
    scripts: DashMap<String, ScriptKind>,
    script_loads: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every registered script, as a store restart would.
    pub fn flush_scripts(&self) {
        self.scripts.clear();
    }

    /// Number of `script_load` calls served so far.
    pub fn script_loads(&self) -> usize {
        self.script_loads.load(Ordering::SeqCst)
    }

    /// Make every subsequent operation fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remove every key whose TTL has elapsed.
    ///
    /// Expired keys are also dropped lazily on access and swept periodically
    /// while scripts run.
    pub fn purge_expired(&self) {
        self.data.lock().purge_expired();
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn run_script(&self, kind: ScriptKind, keys: &[String], args: &[String]) -> StoreResult<Vec<String>> {
        let key = keys
            .first()
            .ok_or_else(|| StoreError::UnexpectedReply(format!("{} needs one key", kind.name())))?;
        let mut data = self.data.lock();
        data.script_runs += 1;
        if data.script_runs % SWEEP_INTERVAL == 0 {
            data.purge_expired();
        }

        match kind {
            ScriptKind::TokenBucket => {
                let (params, now_ms, ttl) = limit_args(args)?;
                data.purge_hash_if_expired(key);
                let mut state = match (
                    data.hash_field::<u64>(key, "tokens"),
                    data.hash_field::<u64>(key, "last_refill"),
                ) {
                    (Some(tokens), Some(last_refill_ms)) => TokenBucketState {
                        tokens,
                        last_refill_ms,
                    },
                    _ => TokenBucketState::full(params.capacity, now_ms),
                };
                let outcome = state.check(params, now_ms);
                data.set_hash_fields(
                    key,
                    &[
                        ("tokens", state.tokens.to_string()),
                        ("last_refill", state.last_refill_ms.to_string()),
                    ],
                    ttl,
                );
                Ok(vec![
                    u8::from(outcome.allowed).to_string(),
                    outcome.wait_time_ms.to_string(),
                    outcome.remaining.to_string(),
                ])
            }
            ScriptKind::FixedWindow => {
                let (params, now_ms, ttl) = limit_args(args)?;
                data.purge_hash_if_expired(key);
                let mut state = FixedWindowState {
                    consumed: data.hash_field(key, "consumed").unwrap_or(0),
                    window_start_ms: data.hash_field(key, "window_start"),
                };
                let outcome = state.check(params, now_ms);
                data.set_hash_fields(
                    key,
                    &[
                        ("consumed", state.consumed.to_string()),
                        (
                            "window_start",
                            state.window_start_ms.unwrap_or_default().to_string(),
                        ),
                    ],
                    ttl,
                );
                Ok(vec![
                    u8::from(outcome.allowed).to_string(),
                    outcome.wait_time_ms.to_string(),
                    outcome.remaining.to_string(),
                ])
            }
            ScriptKind::BudgetIncrement => {
                let amount: f64 = arg(args, 0)?;
                let limit: f64 = arg(args, 1)?;
                let before = data
                    .live_string(key)
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let outcome = apply_increment(before, amount, limit);
                data.strings
                    .insert(key.clone(), (outcome.value.to_string(), None));
                Ok(vec![
                    outcome.value.to_string(),
                    u8::from(outcome.threshold_crossed).to_string(),
                    u8::from(outcome.exhausted).to_string(),
                ])
            }
        }
    }
}

fn arg<T: FromStr>(args: &[String], i: usize) -> StoreResult<T> {
    args.get(i)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| StoreError::UnexpectedReply(format!("bad script argument {} in {:?}", i, args)))
}

/// ARGV = capacity, window_ms, units, now_ms, consume (0|1), ttl_ms
fn limit_args(args: &[String]) -> StoreResult<(LimitParams, u64, Duration)> {
    let params = LimitParams {
        capacity: arg(args, 0)?,
        window_ms: arg(args, 1)?,
        units: arg(args, 2)?,
        consume: arg::<u8>(args, 4)? == 1,
    };
    let ttl = Duration::from_millis(arg(args, 5)?);
    Ok((params, arg(args, 3)?, ttl))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        Ok(self.data.lock().live_string(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.ensure_available()?;
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.data
            .lock()
            .strings
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(true)
    }

    async fn get_set_members(&self, key: &str) -> StoreResult<HashSet<String>> {
        self.ensure_available()?;
        Ok(self.data.lock().sets.get(key).cloned().unwrap_or_default())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.data
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let mut data = self.data.lock();
        if let Some(set) = data.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                data.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn script_load(&self, source: &str) -> StoreResult<String> {
        self.ensure_available()?;
        let kind = ScriptKind::from_source(source)
            .ok_or_else(|| StoreError::UnexpectedReply("memory store only runs built-in scripts".to_string()))?;
        let sha = format!("{:x}", Sha256::digest(source.as_bytes()));
        self.scripts.insert(sha.clone(), kind);
        self.script_loads.fetch_add(1, Ordering::SeqCst);
        Ok(sha)
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        self.ensure_available()?;
        let kind = match self.scripts.get(sha) {
            Some(entry) => *entry.value(),
            None => return Err(StoreError::ScriptUnknown(sha.to_string())),
        };
        trace!(script = kind.name(), keys = ?keys, "Running script in memory");
        self.run_script(kind, keys, args)
    }
}
