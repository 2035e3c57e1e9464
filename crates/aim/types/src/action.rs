//! Action risk classification.
//!
//! Every incoming action type is mapped to a risk class once, at the edge of
//! the decision pipeline; trust thresholds, severity derivation and alerting
//! all branch on the class rather than re-inspecting the action string.

use serde::{Deserialize, Serialize};

/// Actions that always require human approval, regardless of trust.
///
/// Compiled in deliberately: policy data can tighten the pipeline but must
/// not be able to remove an entry from this list.
pub const CRITICAL_ACTIONS: &[&str] = &[
    "delete_production_data",
    "drop_database",
    "execute_shell_command",
    "access_sensitive_data",
    "modify_security_policy",
    "grant_admin_access",
    "revoke_all_permissions",
    "export_all_data",
    "system_shutdown",
    "modify_authentication",
];

/// Risk class of an action type, derived from its leading verb.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRiskClass {
    /// Read-only access (`read_*`, `get_*`, `list_*`, `query_*`).
    Read,
    /// Data-producing actions (`write_*`, `send_*`, `create_*`).
    Write,
    /// Mutations of existing state or configuration (`modify_*`, `update_*`, `config_*`).
    Modify,
    /// Destructive actions (`delete_*`, `drop_*`, `remove_*`).
    Delete,
    /// Code execution and administrative actions (`execute_*`, `run_*`, `admin_*`, `grant_*`).
    Execute,
    /// Anything that does not match a known verb.
    Unknown,
}

impl ActionRiskClass {
    /// Classify an action type by its leading verb.
    pub fn classify(action: &str) -> Self {
        let verb = action
            .split(['_', '.', ':'])
            .next()
            .unwrap_or(action)
            .to_ascii_lowercase();
        match verb.as_str() {
            "read" | "get" | "list" | "query" | "fetch" | "view" => Self::Read,
            "write" | "send" | "create" | "insert" | "post" | "publish" => Self::Write,
            "modify" | "update" | "config" | "configure" | "set" | "patch" => Self::Modify,
            "delete" | "drop" | "remove" | "purge" | "truncate" => Self::Delete,
            "execute" | "run" | "admin" | "grant" | "revoke" | "sudo" | "shutdown" => Self::Execute,
            _ => Self::Unknown,
        }
    }

    /// Trust multiplier applied to the agent's base score before threshold
    /// comparison. Riskier classes shrink the effective trust.
    pub fn trust_multiplier(&self) -> f64 {
        match self {
            Self::Read => 1.0,
            Self::Write => 0.8,
            Self::Modify => 0.7,
            Self::Delete => 0.5,
            Self::Execute => 0.3,
            Self::Unknown => 0.8,
        }
    }

    /// Minimum trust floor for an action of this class. Compared against
    /// the action-adjusted score, not the raw one: each floor must stay at
    /// or below `trust_multiplier()` so a full-trust agent clears it.
    pub fn required_trust(&self) -> f64 {
        match self {
            Self::Read => 0.2,
            Self::Write => 0.25,
            Self::Modify => 0.3,
            Self::Delete => 0.35,
            Self::Execute => 0.25,
            Self::Unknown => 0.25,
        }
    }

    /// Classes whose denial is worth an alert even without a policy match.
    pub fn is_low_risk(&self) -> bool {
        matches!(self, Self::Read)
    }

    /// High-risk classes require `trust >= 0.9` for immediate approval;
    /// below that the decision goes to human review.
    pub fn is_high_risk(&self) -> bool {
        matches!(self, Self::Delete | Self::Execute)
    }
}

/// Whether an action is on the compiled-in critical allowlist.
pub fn is_critical_action(action: &str) -> bool {
    CRITICAL_ACTIONS.contains(&action)
}

/// Explicit risk level a caller may attach to a request; overrides the
/// verb-derived heuristic for alert severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_verbs() {
        assert_eq!(ActionRiskClass::classify("read_database"), ActionRiskClass::Read);
        assert_eq!(ActionRiskClass::classify("send_email"), ActionRiskClass::Write);
        assert_eq!(ActionRiskClass::classify("update_config"), ActionRiskClass::Modify);
        assert_eq!(ActionRiskClass::classify("drop_database"), ActionRiskClass::Delete);
        assert_eq!(
            ActionRiskClass::classify("execute_shell_command"),
            ActionRiskClass::Execute
        );
    }

    #[test]
    fn classify_unknown_verb_defaults() {
        let class = ActionRiskClass::classify("frobnicate_widget");
        assert_eq!(class, ActionRiskClass::Unknown);
        assert_eq!(class.trust_multiplier(), 0.8);
    }

    #[test]
    fn critical_actions_are_detected() {
        assert!(is_critical_action("drop_database"));
        assert!(is_critical_action("system_shutdown"));
        assert!(!is_critical_action("read_database"));
    }

    #[test]
    fn trust_floors_are_clearable_at_full_trust() {
        for class in [
            ActionRiskClass::Read,
            ActionRiskClass::Write,
            ActionRiskClass::Modify,
            ActionRiskClass::Delete,
            ActionRiskClass::Execute,
            ActionRiskClass::Unknown,
        ] {
            assert!(
                class.required_trust() <= class.trust_multiplier(),
                "{class:?} floor would deny a full-trust agent"
            );
            assert!(class.required_trust() > 0.0);
        }
    }

    #[test]
    fn risk_level_ordering_supports_thresholds() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert_eq!(RiskLevel::parse("HIGH"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::parse("bogus"), None);
    }
}
