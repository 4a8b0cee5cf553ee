//! Control plane resync notifications.
//!
//! Local exhaustion marking is authoritative. Resync only tells the control
//! plane about it so other systems converge, and its failures never undo
//! anything.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ResyncConfig;

#[derive(Debug, Error)]
pub enum ResyncError {
    #[error("resync request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("control plane responded with status {0}")]
    Status(u16),
    #[error("invalid resync configuration: {0}")]
    Config(String),
}

/// A bucket reference inside a resync body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBucket {
    pub id: String,
    pub value_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUsage {
    pub id: String,
    pub value_key: String,
    #[serde(serialize_with = "serialize_usage")]
    pub usage: f64,
}

/// Body of `POST /v1/organisation/{org}/resync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequest {
    pub usage_limits_policies_to_exhaust: Vec<PolicyBucket>,
    pub usage_limits_policies_to_update_usage: Vec<PolicyUsage>,
}

impl ResyncRequest {
    /// Report a bucket that just crossed its limit, with its usage at that moment.
    pub fn exhausted(policy_id: &str, value_key: &str, usage: f64) -> Self {
        Self {
            usage_limits_policies_to_exhaust: vec![PolicyBucket {
                id: policy_id.to_string(),
                value_key: value_key.to_string(),
            }],
            usage_limits_policies_to_update_usage: vec![PolicyUsage {
                id: policy_id.to_string(),
                value_key: value_key.to_string(),
                usage,
            }],
        }
    }
}

// Whole-number usage goes out as an integer (10000, not 10000.0).
fn serialize_usage<S: Serializer>(usage: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if usage.fract() == 0.0 && usage.abs() <= MAX_EXACT {
        serializer.serialize_i64(*usage as i64)
    } else {
        serializer.serialize_f64(*usage)
    }
}

/// Something that can propagate exhaustion to the control plane.
#[async_trait]
pub trait ResyncNotifier: Send + Sync {
    async fn notify(&self, organisation_id: &str, request: &ResyncRequest) -> Result<(), ResyncError>;
}

/// Resync over HTTP.
#[derive(Debug, Clone)]
pub struct HttpResyncClient {
    client: reqwest::Client,
    base: String,
    credential: String,
}

impl HttpResyncClient {
    pub fn new(
        base: impl Into<String>,
        credential: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ResyncError> {
        let base = base.into();
        if base.trim().is_empty() {
            return Err(ResyncError::Config("control plane base URL is empty".to_string()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            credential: credential.into(),
        })
    }

    /// Build a client from configuration, or `None` when resync is disabled.
    pub fn from_config(config: &ResyncConfig) -> Result<Option<Self>, ResyncError> {
        match &config.control_plane_base {
            Some(base) => Self::new(
                base.clone(),
                config.service_credential.clone(),
                Duration::from_millis(config.timeout_ms),
            )
            .map(Some),
            None => {
                info!("No control plane configured, resync disabled");
                Ok(None)
            }
        }
    }

    fn endpoint(&self, organisation_id: &str) -> String {
        format!("{}/v1/organisation/{}/resync", self.base, organisation_id)
    }
}

#[async_trait]
impl ResyncNotifier for HttpResyncClient {
    async fn notify(&self, organisation_id: &str, request: &ResyncRequest) -> Result<(), ResyncError> {
        let url = self.endpoint(organisation_id);
        debug!(url = %url, "Sending resync to control plane");

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, &self.credential)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResyncError::Status(status.as_u16()));
        }
        Ok(())
    }
}
