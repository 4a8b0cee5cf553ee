use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{RateLimitAlgorithm, RateLimiter};
use tollgate::store::{CounterStore, RedisCounterStore};
use tollgate::usage::{HttpResyncClient, PolicyContext, PolicySet, UsageLimiter};

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "AI gateway rate and usage limit enforcement")]
struct Cli {
    /// Configuration file (YAML). `TOLLGATE__*` environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one rate limit check against the shared store
    RateLimit {
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "api_key")]
        key_type: String,
        #[arg(long)]
        capacity: u64,
        #[arg(long)]
        window_ms: u64,
        #[arg(long, default_value_t = 1)]
        units: u64,
        /// Only report, do not consume
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_enum)]
        algorithm: Option<Algorithm>,
    },
    /// Check whether a request context is blocked by an exhausted policy
    Validate {
        #[command(flatten)]
        target: Target,
    },
    /// Record consumption for a completed request
    Record {
        #[command(flatten)]
        target: Target,
        /// Cost in cents
        #[arg(long, default_value_t = 0.0)]
        cost: f64,
        #[arg(long, default_value_t = 0.0)]
        tokens: f64,
    },
    /// Show current usage of every bucket a context falls into
    Usage {
        #[command(flatten)]
        target: Target,
    },
    /// Reset one bucket's counter and exhaustion state
    Reset {
        /// Policies file (YAML)
        #[arg(long)]
        policies: String,
        #[arg(long)]
        policy_id: String,
        #[arg(long, default_value = "default")]
        value_key: String,
    },
}

#[derive(Debug, clap::Args)]
struct Target {
    /// Policies file (YAML)
    #[arg(long)]
    policies: String,
    /// Request context as JSON
    #[arg(long, default_value = "{}")]
    context: String,
}

impl Target {
    fn load(&self) -> anyhow::Result<(PolicySet, PolicyContext)> {
        let policies = PolicySet::from_file(&self.policies)?;
        let context = serde_json::from_str(&self.context).context("Invalid request context JSON")?;
        Ok((policies, context))
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Algorithm {
    TokenBucket,
    FixedWindow,
}

impl From<Algorithm> for RateLimitAlgorithm {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::TokenBucket => RateLimitAlgorithm::TokenBucket,
            Algorithm::FixedWindow => RateLimitAlgorithm::FixedWindow,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");

    let store: Arc<dyn CounterStore> = Arc::new(
        RedisCounterStore::connect(&config.store.url, config.store.timeout())
            .await
            .with_context(|| format!("Failed to connect to store at {}", config.store.url))?,
    );

    match cli.command {
        Command::RateLimit {
            key,
            key_type,
            capacity,
            window_ms,
            units,
            dry_run,
            algorithm,
        } => {
            let mut rate_limiting = config.rate_limiting.clone();
            if let Some(algorithm) = algorithm {
                rate_limiting.algorithm = algorithm.into();
            }
            let limiter = RateLimiter::with_config(store, &rate_limiting);
            let decision = limiter
                .check_rate_limit(&key, &key_type, capacity, window_ms, units, !dry_run)
                .await;

            print_json(&json!({
                "allowed": decision.allowed,
                "wait_time_ms": decision.wait_time_ms,
                "remaining": decision.remaining,
                "degraded": decision.is_degraded(),
            }))?;
        }
        Command::Validate { target } => {
            let (set, context) = target.load()?;
            let limiter = UsageLimiter::new(store, &config.usage_limits);
            let outcome = limiter.pre_request_validate(&set.policies, &context).await;

            print_json(&json!({
                "is_exhausted": outcome.is_exhausted,
                "blocking_policy": outcome.blocking_policy.map(|m| json!({
                    "id": m.policy.id,
                    "value_key": m.value_key,
                })),
                "degraded": outcome.degraded,
            }))?;
        }
        Command::Record {
            target,
            cost,
            tokens,
        } => {
            let (set, context) = target.load()?;
            let mut limiter = UsageLimiter::new(store, &config.usage_limits);
            if let Some(client) = HttpResyncClient::from_config(&config.resync)? {
                limiter = limiter.with_resync(Arc::new(client));
            }
            let summary = limiter
                .post_request_record(&set.policies, &context, cost, tokens)
                .await;

            print_json(&json!({
                "incremented": summary.incremented,
                "newly_exhausted": summary.newly_exhausted,
                "resync_failures": summary.resync_failures,
                "degraded": summary.degraded,
            }))?;
        }
        Command::Usage { target } => {
            let (set, context) = target.load()?;
            let limiter = UsageLimiter::new(store, &config.usage_limits);
            let usage = limiter.usage_for(&set.policies, &context).await?;
            print_json(&usage)?;
        }
        Command::Reset {
            policies,
            policy_id,
            value_key,
        } => {
            let set = PolicySet::from_file(&policies)?;
            let policy = set
                .policies
                .iter()
                .find(|p| p.id == policy_id)
                .with_context(|| format!("No policy with id {}", policy_id))?;
            let limiter = UsageLimiter::new(store, &config.usage_limits);
            limiter.reset_bucket(policy, &value_key).await?;
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
