//! Policy matching and bucket key derivation.
//!
//! Matching is pure: it only looks at the policies and the request context.
//! Exhaustion state is attached afterwards by the usage limiter.

use tracing::trace;

use super::policy::{resolve_field, Condition, GroupByField, PolicyContext, UsageLimitsPolicy};

/// Bucket key used when a policy has no group-by fields.
pub const DEFAULT_VALUE_KEY: &str = "default";

const WILDCARD: &str = "*";

/// A policy that applies to a request, resolved to its bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyMatch<'a> {
    pub policy: &'a UsageLimitsPolicy,
    pub value_key: String,
}

/// Return the policies that apply to `context`, in input order.
pub fn match_policies<'a>(
    policies: &'a [UsageLimitsPolicy],
    context: &PolicyContext,
) -> Vec<PolicyMatch<'a>> {
    policies
        .iter()
        .filter(|policy| policy.is_active())
        .filter(|policy| conditions_hold(&policy.conditions, context))
        .filter_map(|policy| {
            let value_key = value_key(&policy.group_by, context);
            if value_key.is_none() {
                trace!(policy_id = %policy.id, "Group-by field missing from context, skipping policy");
            }
            value_key.map(|value_key| PolicyMatch { policy, value_key })
        })
        .collect()
}

/// All conditions must hold. An empty list always holds.
pub fn conditions_hold(conditions: &[Condition], context: &PolicyContext) -> bool {
    conditions.iter().all(|condition| {
        resolve_field(context, &condition.key)
            .map(|actual| condition.value == WILDCARD || actual == condition.value)
            .unwrap_or(false)
    })
}

/// Derive the bucket key, e.g. `api_key:k1-metadata._user:john`.
///
/// Returns `None` if any field cannot be resolved; partial keys are never built.
pub fn value_key(group_by: &[GroupByField], context: &PolicyContext) -> Option<String> {
    if group_by.is_empty() {
        return Some(DEFAULT_VALUE_KEY.to_string());
    }

    let parts = group_by
        .iter()
        .map(|field| resolve_field(context, &field.key).map(|value| format!("{}:{}", field.key, value)))
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::policy::{PolicyKey, PolicyStatus};

    fn policy(id: &str, conditions: &[(&str, &str)], group_by: &[&str]) -> UsageLimitsPolicy {
        UsageLimitsPolicy {
            id: id.to_string(),
            organisation_id: "org-1".to_string(),
            workspace_id: "ws-1".to_string(),
            conditions: conditions
                .iter()
                .map(|(k, v)| Condition {
                    key: PolicyKey::from(*k),
                    value: v.to_string(),
                })
                .collect(),
            group_by: group_by
                .iter()
                .map(|k| GroupByField {
                    key: PolicyKey::from(*k),
                })
                .collect(),
            credit_limit: 100.0,
            policy_type: None,
            periodic_reset: None,
            status: PolicyStatus::Active,
        }
    }

    fn context(api_key: &str, user: Option<&str>) -> PolicyContext {
        let mut context = PolicyContext {
            api_key_id: Some(api_key.to_string()),
            ..Default::default()
        };
        if let Some(user) = user {
            context.metadata.insert("_user".to_string(), user.to_string());
        }
        context
    }

    #[test]
    fn test_and_semantics() {
        let policies = vec![policy("p1", &[("api_key", "k1"), ("metadata._user", "john")], &[])];

        assert_eq!(match_policies(&policies, &context("k1", Some("john"))).len(), 1);
        assert!(match_policies(&policies, &context("k2", Some("john"))).is_empty());
        assert!(match_policies(&policies, &context("k1", Some("jane"))).is_empty());
        assert!(match_policies(&policies, &context("k1", None)).is_empty());
    }

    #[test]
    fn test_wildcard_matches_any_value() {
        let policies = vec![policy("p1", &[("api_key", "*")], &[])];

        assert_eq!(match_policies(&policies, &context("k1", None)).len(), 1);
        assert_eq!(match_policies(&policies, &context("anything", None)).len(), 1);
    }

    #[test]
    fn test_wildcard_requires_field_present() {
        let policies = vec![policy("p1", &[("model", "*")], &[])];
        assert!(match_policies(&policies, &context("k1", None)).is_empty());
    }

    #[test]
    fn test_no_conditions_match_everything() {
        let policies = vec![policy("p1", &[], &[])];
        let matches = match_policies(&policies, &PolicyContext::default());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].value_key, DEFAULT_VALUE_KEY);
    }

    #[test]
    fn test_value_key_is_deterministic() {
        let policies = vec![policy("p1", &[], &["api_key", "metadata._user"])];
        let ctx = context("k1", Some("john"));

        for _ in 0..10 {
            let matches = match_policies(&policies, &ctx);
            assert_eq!(matches[0].value_key, "api_key:k1-metadata._user:john");
        }
    }

    #[test]
    fn test_value_key_follows_declared_order() {
        let policies = vec![policy("p1", &[], &["metadata._user", "api_key"])];
        let matches = match_policies(&policies, &context("k1", Some("john")));
        assert_eq!(matches[0].value_key, "metadata._user:john-api_key:k1");
    }

    #[test]
    fn test_missing_group_by_field_skips_policy() {
        let policies = vec![
            policy("p1", &[], &["api_key", "metadata._user"]),
            policy("p2", &[], &["api_key"]),
        ];
        let matches = match_policies(&policies, &context("k1", None));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].policy.id, "p2");
    }

    #[test]
    fn test_inactive_policies_skipped_and_order_preserved() {
        let mut archived = policy("p2", &[], &[]);
        archived.status = PolicyStatus::Archived;
        let policies = vec![policy("p3", &[], &[]), archived, policy("p1", &[], &[])];

        let ids: Vec<_> = match_policies(&policies, &PolicyContext::default())
            .iter()
            .map(|m| m.policy.id.as_str())
            .collect();
        assert_eq!(ids, vec!["p3", "p1"]);
    }
}
