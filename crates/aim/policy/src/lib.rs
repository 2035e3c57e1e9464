//! AIM Policy - security-policy evaluation (C3).
//!
//! Policies load per organization ordered by priority; each carries one
//! typed rule. Evaluation is pure and synchronous: the decider assembles a
//! [`PolicyInput`] with everything the rules may inspect, and the first
//! matching policy short-circuits into a `(block, alert)` outcome.

#![deny(unsafe_code)]

pub mod rules;

pub use rules::{PolicyInput, PolicyRule};

use aim_types::{AlertSeverity, SecurityPolicy};
use thiserror::Error;

/// Outcome of evaluating the policy set against one request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolicyDecision {
    pub block: bool,
    pub alert: bool,
    pub matched_policy: Option<String>,
    pub reason: Option<String>,
    pub severity: Option<AlertSeverity>,
}

impl PolicyDecision {
    fn from_match(policy: &SecurityPolicy, reason: String) -> Self {
        Self {
            block: policy.enforcement_action.blocks(),
            alert: policy.enforcement_action.alerts(),
            matched_policy: Some(policy.name.clone()),
            reason: Some(reason),
            severity: Some(policy.severity_threshold),
        }
    }
}

/// Policy-evaluation errors.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid rule parameters for policy `{policy}`: {message}")]
    InvalidRule { policy: String, message: String },
}

/// Evaluate policies in priority order; the first match wins.
///
/// `policies` must already be filtered to the organization, enabled, and
/// sorted by priority ascending (the storage query guarantees this). Rules
/// that fail to parse are skipped with a warning rather than failing the
/// decision: a misconfigured policy must not take the pipeline down.
pub fn evaluate(policies: &[SecurityPolicy], input: &PolicyInput<'_>) -> PolicyDecision {
    for policy in policies {
        if !policy
            .applies_to
            .matches(&input.agent.id, &input.agent.name)
        {
            continue;
        }
        let rule = match PolicyRule::from_policy(policy) {
            Ok(rule) => rule,
            Err(error) => {
                tracing::warn!(policy = %policy.name, %error, "skipping unparseable policy rule");
                continue;
            }
        };
        if let Some(reason) = rule.evaluate(input) {
            tracing::debug!(
                policy = %policy.name,
                action = %policy.enforcement_action.as_str(),
                %reason,
                "policy matched"
            );
            return PolicyDecision::from_match(policy, reason);
        }
    }
    PolicyDecision::default()
}

/// Same as [`evaluate`] but restricted to a subset of policy types.
pub fn evaluate_where(
    policies: &[SecurityPolicy],
    input: &PolicyInput<'_>,
    include: impl Fn(aim_types::PolicyType) -> bool,
) -> PolicyDecision {
    let filtered: Vec<SecurityPolicy> = policies
        .iter()
        .filter(|policy| include(policy.policy_type))
        .cloned()
        .collect();
    evaluate(&filtered, input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_types::{
        ActionRiskClass, Agent, AgentId, AgentSelector, AgentStatus, EnforcementAction,
        OrganizationId, PolicyId, PolicyType,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn agent(trust: f64) -> Agent {
        Agent {
            id: AgentId::generate(),
            organization_id: OrganizationId::generate(),
            name: "reporting-agent".to_string(),
            display_name: "Reporting".to_string(),
            status: AgentStatus::Verified,
            public_key: "pk".to_string(),
            api_key_hash: None,
            previous_public_key: None,
            key_created_at: Utc::now(),
            key_expires_at: None,
            key_rotation_grace_until: None,
            rotation_count: 0,
            trust_score: trust,
            capability_violation_count: 0,
            is_compromised: false,
            talks_to: vec!["files-mcp".to_string()],
            last_active: None,
            created_by: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    fn policy(policy_type: PolicyType, rules: serde_json::Value, priority: i32) -> SecurityPolicy {
        SecurityPolicy {
            id: PolicyId::generate(),
            organization_id: OrganizationId::generate(),
            name: format!("{}-policy", policy_type.as_str()),
            policy_type,
            enforcement_action: EnforcementAction::BlockAndAlert,
            severity_threshold: AlertSeverity::High,
            rules,
            applies_to: AgentSelector::All,
            is_enabled: true,
            priority,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn input_for<'a>(agent: &'a Agent, context: &'a BTreeMap<String, serde_json::Value>) -> PolicyInput<'a> {
        PolicyInput {
            agent,
            action_type: "read_database",
            action_class: ActionRiskClass::Read,
            resource: Some("db://customers"),
            context,
            has_capability: true,
            granted_capability_types: &[],
            recent_event_count: 0,
            payload_bytes: 0,
            now: Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap(),
        }
    }

    #[test]
    fn no_policies_means_no_block() {
        let agent = agent(0.9);
        let context = BTreeMap::new();
        let decision = evaluate(&[], &input_for(&agent, &context));
        assert!(!decision.block);
        assert!(!decision.alert);
    }

    #[test]
    fn trust_score_low_fires_below_threshold() {
        let low_trust = agent(0.2);
        let context = BTreeMap::new();
        let policies = vec![policy(
            PolicyType::TrustScoreLow,
            json!({"threshold": 0.5}),
            10,
        )];
        let decision = evaluate(&policies, &input_for(&low_trust, &context));
        assert!(decision.block);
        assert!(decision.alert);
        assert!(decision.reason.unwrap().contains("trust"));
    }

    #[test]
    fn first_match_by_priority_wins() {
        let low_trust = agent(0.2);
        let context = BTreeMap::new();
        let mut alert_only = policy(PolicyType::TrustScoreLow, json!({"threshold": 0.5}), 1);
        alert_only.enforcement_action = EnforcementAction::AlertOnly;
        alert_only.name = "soft-trust".to_string();
        let blocking = policy(PolicyType::TrustScoreLow, json!({"threshold": 0.5}), 2);

        let decision = evaluate(&[alert_only, blocking], &input_for(&low_trust, &context));
        assert!(!decision.block);
        assert!(decision.alert);
        assert_eq!(decision.matched_policy.as_deref(), Some("soft-trust"));
    }

    #[test]
    fn selector_excludes_other_agents() {
        let agent = agent(0.1);
        let context = BTreeMap::new();
        let mut scoped = policy(PolicyType::TrustScoreLow, json!({"threshold": 0.5}), 1);
        scoped.applies_to = AgentSelector::NamePrefix {
            prefix: "billing-".to_string(),
        };
        let decision = evaluate(&[scoped], &input_for(&agent, &context));
        assert!(!decision.block);
    }

    #[test]
    fn unauthorized_access_matches_forbidden_pattern() {
        let agent = agent(0.9);
        let context = BTreeMap::new();
        let policies = vec![policy(
            PolicyType::UnauthorizedAccess,
            json!({"forbidden_patterns": ["db://secrets/*"]}),
            5,
        )];
        let mut input = input_for(&agent, &context);
        input.resource = Some("db://secrets/master-key");
        let decision = evaluate(&policies, &input);
        assert!(decision.block);
    }

    #[test]
    fn config_drift_detects_unregistered_mcp() {
        let agent = agent(0.9);
        let mut context = BTreeMap::new();
        context.insert(
            "current_mcp_servers".to_string(),
            json!(["files-mcp", "shadow-mcp"]),
        );
        let policies = vec![policy(PolicyType::ConfigDrift, json!({}), 5)];
        let decision = evaluate(&policies, &input_for(&agent, &context));
        assert!(decision.block);
        assert!(decision.reason.unwrap().contains("shadow-mcp"));
    }
}
