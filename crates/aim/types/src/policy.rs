//! Security policies evaluated on every verification.

use crate::alert::AlertSeverity;
use crate::ids::{AgentId, OrganizationId, PolicyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The six rule families a policy can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    CapabilityViolation,
    TrustScoreLow,
    UnusualActivity,
    UnauthorizedAccess,
    DataExfiltration,
    ConfigDrift,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapabilityViolation => "capability_violation",
            Self::TrustScoreLow => "trust_score_low",
            Self::UnusualActivity => "unusual_activity",
            Self::UnauthorizedAccess => "unauthorized_access",
            Self::DataExfiltration => "data_exfiltration",
            Self::ConfigDrift => "config_drift",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "capability_violation" => Some(Self::CapabilityViolation),
            "trust_score_low" => Some(Self::TrustScoreLow),
            "unusual_activity" => Some(Self::UnusualActivity),
            "unauthorized_access" => Some(Self::UnauthorizedAccess),
            "data_exfiltration" => Some(Self::DataExfiltration),
            "config_drift" => Some(Self::ConfigDrift),
            _ => None,
        }
    }
}

/// What happens when a policy matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    AlertOnly,
    Block,
    BlockAndAlert,
}

impl EnforcementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlertOnly => "alert_only",
            Self::Block => "block",
            Self::BlockAndAlert => "block_and_alert",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "alert_only" => Some(Self::AlertOnly),
            "block" => Some(Self::Block),
            "block_and_alert" => Some(Self::BlockAndAlert),
            _ => None,
        }
    }

    pub fn blocks(&self) -> bool {
        matches!(self, Self::Block | Self::BlockAndAlert)
    }

    pub fn alerts(&self) -> bool {
        matches!(self, Self::AlertOnly | Self::BlockAndAlert)
    }
}

/// Which agents a policy applies to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AgentSelector {
    /// Every agent in the organization.
    #[default]
    All,
    /// An explicit list of agent ids.
    Agents { ids: Vec<AgentId> },
    /// Agents whose name starts with the prefix.
    NamePrefix { prefix: String },
}

impl AgentSelector {
    pub fn matches(&self, agent_id: &AgentId, agent_name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Agents { ids } => ids.contains(agent_id),
            Self::NamePrefix { prefix } => agent_name.starts_with(prefix.as_str()),
        }
    }
}

/// A rule evaluated on every verification for its organization.
///
/// `rules` holds the type-specific parameters as JSON; the policy engine
/// parses it into a typed rule variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub id: PolicyId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub policy_type: PolicyType,
    pub enforcement_action: EnforcementAction,
    pub severity_threshold: AlertSeverity,
    pub rules: serde_json::Value,
    pub applies_to: AgentSelector,
    pub is_enabled: bool,
    /// Lower value = higher precedence.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_by_prefix() {
        let selector = AgentSelector::NamePrefix {
            prefix: "prod-".to_string(),
        };
        let id = AgentId::generate();
        assert!(selector.matches(&id, "prod-billing"));
        assert!(!selector.matches(&id, "staging-billing"));
    }

    #[test]
    fn enforcement_action_block_and_alert_does_both() {
        let action = EnforcementAction::BlockAndAlert;
        assert!(action.blocks());
        assert!(action.alerts());
        assert!(!EnforcementAction::AlertOnly.blocks());
    }
}
