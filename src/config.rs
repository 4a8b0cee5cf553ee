//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimitAlgorithm;

/// Environment variable prefix for configuration overrides.
///
/// `TOLLGATE__STORE__URL=redis://...` overrides `store.url`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Usage limit (budget policy) configuration
    #[serde(default)]
    pub usage_limits: UsageLimitsConfig,

    /// Control plane resync configuration
    #[serde(default)]
    pub resync: ResyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            timeout_ms: default_store_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout() -> u64 {
    250
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Algorithm used when a caller does not pick one explicitly
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,

    /// Limiter state expires after `window_ms * ttl_factor`
    #[serde(default = "default_ttl_factor")]
    pub ttl_factor: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::default(),
            ttl_factor: default_ttl_factor(),
        }
    }
}

fn default_ttl_factor() -> u64 {
    3
}

/// Usage limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLimitsConfig {
    /// How long exhausted-set reads are memoized locally, in seconds
    #[serde(default = "default_exhaustion_cache_ttl")]
    pub exhaustion_cache_ttl_secs: u64,

    /// Maximum number of exhausted sets memoized locally
    #[serde(default = "default_exhaustion_cache_capacity")]
    pub exhaustion_cache_capacity: u64,
}

impl Default for UsageLimitsConfig {
    fn default() -> Self {
        Self {
            exhaustion_cache_ttl_secs: default_exhaustion_cache_ttl(),
            exhaustion_cache_capacity: default_exhaustion_cache_capacity(),
        }
    }
}

impl UsageLimitsConfig {
    pub fn exhaustion_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.exhaustion_cache_ttl_secs)
    }
}

fn default_exhaustion_cache_ttl() -> u64 {
    5
}

fn default_exhaustion_cache_capacity() -> u64 {
    10_000
}

/// Control plane resync configuration.
///
/// Resync is disabled when `control_plane_base` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Base URL of the control plane, e.g. `https://control.example.com`
    #[serde(default)]
    pub control_plane_base: Option<String>,

    /// Value sent in the `Authorization` header
    #[serde(default, skip_serializing)]
    pub service_credential: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_resync_timeout")]
    pub timeout_ms: u64,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            control_plane_base: None,
            service_credential: String::new(),
            timeout_ms: default_resync_timeout(),
        }
    }
}

fn default_resync_timeout() -> u64 {
    5_000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load layered configuration: defaults, then the optional file, then
    /// `TOLLGATE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }
}
