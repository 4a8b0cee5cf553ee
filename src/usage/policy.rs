//! Usage limit policies and the request context they are matched against.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};

/// What a policy's counter accumulates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterType {
    /// Spend, limited in dollars and counted in cents.
    #[default]
    Cost,
    Tokens,
}

impl CounterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterType::Cost => "cost",
            CounterType::Tokens => "tokens",
        }
    }
}

impl std::fmt::Display for CounterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Active,
    Exhausted,
    Expired,
    Archived,
}

/// How often the control plane resets a policy's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodicReset {
    Weekly,
    Monthly,
}

/// A request attribute a condition or group-by field can refer to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PolicyKey {
    ApiKey,
    OrganisationId,
    WorkspaceId,
    VirtualKey,
    VirtualKeyId,
    Provider,
    Config,
    ConfigId,
    Prompt,
    PromptId,
    Model,
    /// `metadata.<field>`
    Metadata(String),
    /// Anything else. Never resolves, so conditions on it never hold.
    Unknown(String),
}

const METADATA_PREFIX: &str = "metadata.";

impl From<String> for PolicyKey {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "api_key" => PolicyKey::ApiKey,
            "organisation_id" => PolicyKey::OrganisationId,
            "workspace_id" => PolicyKey::WorkspaceId,
            "virtual_key" => PolicyKey::VirtualKey,
            "virtual_key_id" => PolicyKey::VirtualKeyId,
            "provider" => PolicyKey::Provider,
            "config" => PolicyKey::Config,
            "config_id" => PolicyKey::ConfigId,
            "prompt" => PolicyKey::Prompt,
            "prompt_id" => PolicyKey::PromptId,
            "model" => PolicyKey::Model,
            _ => match raw.strip_prefix(METADATA_PREFIX) {
                Some(field) if !field.is_empty() => PolicyKey::Metadata(field.to_string()),
                _ => PolicyKey::Unknown(raw),
            },
        }
    }
}

impl From<&str> for PolicyKey {
    fn from(raw: &str) -> Self {
        PolicyKey::from(raw.to_string())
    }
}

impl From<PolicyKey> for String {
    fn from(key: PolicyKey) -> Self {
        key.to_string()
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKey::ApiKey => f.write_str("api_key"),
            PolicyKey::OrganisationId => f.write_str("organisation_id"),
            PolicyKey::WorkspaceId => f.write_str("workspace_id"),
            PolicyKey::VirtualKey => f.write_str("virtual_key"),
            PolicyKey::VirtualKeyId => f.write_str("virtual_key_id"),
            PolicyKey::Provider => f.write_str("provider"),
            PolicyKey::Config => f.write_str("config"),
            PolicyKey::ConfigId => f.write_str("config_id"),
            PolicyKey::Prompt => f.write_str("prompt"),
            PolicyKey::PromptId => f.write_str("prompt_id"),
            PolicyKey::Model => f.write_str("model"),
            PolicyKey::Metadata(field) => write!(f, "{}{}", METADATA_PREFIX, field),
            PolicyKey::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// A filter: the request attribute `key` must equal `value` (or `value` is `"*"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub key: PolicyKey,
    pub value: String,
}

/// A bucketing dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupByField {
    pub key: PolicyKey,
}

/// A usage limit as configured in the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLimitsPolicy {
    pub id: String,
    pub organisation_id: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub group_by: Vec<GroupByField>,
    /// Dollars for cost policies, tokens for token policies.
    pub credit_limit: f64,
    #[serde(rename = "type", default)]
    pub policy_type: Option<CounterType>,
    #[serde(default)]
    pub periodic_reset: Option<PeriodicReset>,
    pub status: PolicyStatus,
}

impl UsageLimitsPolicy {
    /// Counter type, defaulting to cost when unset.
    pub fn counter_type(&self) -> CounterType {
        self.policy_type.unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }
}

/// Facts about one request. Built once per request and only read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyContext {
    pub api_key_id: Option<String>,
    pub organisation_id: Option<String>,
    pub workspace_id: Option<String>,
    pub virtual_key_id: Option<String>,
    pub virtual_key_slug: Option<String>,
    pub provider_slug: Option<String>,
    pub config_id: Option<String>,
    pub config_slug: Option<String>,
    pub prompt_id: Option<String>,
    pub prompt_slug: Option<String>,
    pub model: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Resolve a policy key against the request context.
///
/// Returns `None` when the context does not carry the attribute.
pub fn resolve_field<'a>(context: &'a PolicyContext, key: &PolicyKey) -> Option<&'a str> {
    let value = match key {
        PolicyKey::ApiKey => &context.api_key_id,
        PolicyKey::OrganisationId => &context.organisation_id,
        PolicyKey::WorkspaceId => &context.workspace_id,
        PolicyKey::VirtualKey => &context.virtual_key_slug,
        PolicyKey::VirtualKeyId => &context.virtual_key_id,
        PolicyKey::Provider => &context.provider_slug,
        PolicyKey::Config => &context.config_slug,
        PolicyKey::ConfigId => &context.config_id,
        PolicyKey::Prompt => &context.prompt_slug,
        PolicyKey::PromptId => &context.prompt_id,
        PolicyKey::Model => &context.model,
        PolicyKey::Metadata(field) => return context.metadata.get(field).map(String::as_str),
        PolicyKey::Unknown(_) => return None,
    };
    value.as_deref()
}

/// A list of policies loaded from a file, as the CLI consumes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub policies: Vec<UsageLimitsPolicy>,
}

impl PolicySet {
    /// Load policies from a YAML (or JSON) file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading usage limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse either `{policies: [...]}` or a bare list of policies.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(policies) = serde_yaml::from_str::<Vec<UsageLimitsPolicy>>(yaml) {
            return Ok(Self { policies });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Payload(format!("Failed to parse policies: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_key_parsing() {
        assert_eq!(PolicyKey::from("api_key"), PolicyKey::ApiKey);
        assert_eq!(
            PolicyKey::from("metadata._user"),
            PolicyKey::Metadata("_user".to_string())
        );
        assert_eq!(
            PolicyKey::from("metadata."),
            PolicyKey::Unknown("metadata.".to_string())
        );
        assert_eq!(
            PolicyKey::from("team"),
            PolicyKey::Unknown("team".to_string())
        );
    }

    #[test]
    fn test_policy_key_display_round_trips() {
        for raw in ["api_key", "workspace_id", "virtual_key", "metadata.env", "whatever"] {
            assert_eq!(PolicyKey::from(raw).to_string(), raw);
        }
    }

    #[test]
    fn test_resolve_fixed_and_metadata_fields() {
        let mut context = PolicyContext {
            api_key_id: Some("k1".to_string()),
            virtual_key_slug: Some("openai-prod".to_string()),
            ..Default::default()
        };
        context.metadata.insert("_user".to_string(), "john".to_string());

        assert_eq!(resolve_field(&context, &PolicyKey::ApiKey), Some("k1"));
        assert_eq!(resolve_field(&context, &PolicyKey::VirtualKey), Some("openai-prod"));
        assert_eq!(
            resolve_field(&context, &PolicyKey::Metadata("_user".to_string())),
            Some("john")
        );
        assert_eq!(resolve_field(&context, &PolicyKey::Model), None);
        assert_eq!(
            resolve_field(&context, &PolicyKey::Metadata("team".to_string())),
            None
        );
        assert_eq!(
            resolve_field(&context, &PolicyKey::Unknown("api_key_id".to_string())),
            None
        );
    }

    #[test]
    fn test_parse_policy_set() {
        let yaml = r#"
policies:
  - id: p1
    organisation_id: org-1
    workspace_id: ws-1
    conditions:
      - key: api_key
        value: "*"
    group_by:
      - key: metadata._user
    credit_limit: 100
    status: active
  - id: p2
    organisation_id: org-1
    credit_limit: 5000
    type: tokens
    periodic_reset: monthly
    status: archived
"#;
        let set = PolicySet::from_yaml(yaml).unwrap();
        assert_eq!(set.policies.len(), 2);

        let p1 = &set.policies[0];
        assert_eq!(p1.counter_type(), CounterType::Cost);
        assert_eq!(p1.group_by[0].key, PolicyKey::Metadata("_user".to_string()));
        assert!(p1.is_active());

        let p2 = &set.policies[1];
        assert_eq!(p2.counter_type(), CounterType::Tokens);
        assert_eq!(p2.periodic_reset, Some(PeriodicReset::Monthly));
        assert!(!p2.is_active());
        assert!(p2.conditions.is_empty());
    }

    #[test]
    fn test_parse_bare_policy_list() {
        let yaml = r#"
- id: p1
  organisation_id: org-1
  credit_limit: 1
  status: exhausted
"#;
        let set = PolicySet::from_yaml(yaml).unwrap();
        assert_eq!(set.policies[0].status, PolicyStatus::Exhausted);
    }

    #[test]
    fn test_context_from_json() {
        let context: PolicyContext = serde_json::from_str(
            r#"{"api_key_id": "k1", "metadata": {"_user": "john"}}"#,
        )
        .unwrap();
        assert_eq!(context.api_key_id.as_deref(), Some("k1"));
        assert_eq!(context.metadata["_user"], "john");
    }
}
