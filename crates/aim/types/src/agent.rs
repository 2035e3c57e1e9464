//! Agent - the cryptographic principal.

use crate::ids::{AgentId, OrganizationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Verified,
    Suspended,
    Compromised,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Suspended => "suspended",
            Self::Compromised => "compromised",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            "suspended" => Some(Self::Suspended),
            "compromised" => Some(Self::Compromised),
            _ => None,
        }
    }

    /// Signed requests from suspended or compromised agents are rejected
    /// before any capability check runs.
    pub fn can_act(&self) -> bool {
        matches!(self, Self::Pending | Self::Verified)
    }
}

/// A registered agent.
///
/// Invariant: exactly one active public key. `previous_public_key` is only
/// accepted while `now < key_rotation_grace_until`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub organization_id: OrganizationId,
    /// Unique within the organization.
    pub name: String,
    pub display_name: String,
    pub status: AgentStatus,
    /// Ed25519 public key, 32 bytes, base64.
    pub public_key: String,
    /// SHA-256 of the agent's API key, hex. Never serialized.
    #[serde(skip_serializing, default)]
    pub api_key_hash: Option<String>,
    /// Previous key, valid only during the rotation grace window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_public_key: Option<String>,
    pub key_created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_rotation_grace_until: Option<DateTime<Utc>>,
    pub rotation_count: i64,
    pub trust_score: f64,
    pub capability_violation_count: i64,
    pub is_compromised: bool,
    /// MCP servers this agent declares it talks to, by id or name.
    pub talks_to: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped by key rotation.
    pub version: i64,
}

impl Agent {
    /// Whether `key` is currently acceptable for signature verification:
    /// the active key, or the previous key inside the grace window.
    pub fn accepts_key(&self, key: &str, now: DateTime<Utc>) -> bool {
        if self.public_key == key {
            return true;
        }
        match (&self.previous_public_key, self.key_rotation_grace_until) {
            (Some(previous), Some(grace_until)) => previous == key && now < grace_until,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_agent() -> Agent {
        Agent {
            id: AgentId::generate(),
            organization_id: OrganizationId::generate(),
            name: "billing-agent".to_string(),
            display_name: "Billing Agent".to_string(),
            status: AgentStatus::Verified,
            public_key: "current-key".to_string(),
            api_key_hash: None,
            previous_public_key: Some("old-key".to_string()),
            key_created_at: Utc::now(),
            key_expires_at: None,
            key_rotation_grace_until: Some(Utc::now() + Duration::hours(24)),
            rotation_count: 1,
            trust_score: 0.8,
            capability_violation_count: 0,
            is_compromised: false,
            talks_to: vec![],
            last_active: None,
            created_by: None,
            created_at: Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn active_key_is_always_accepted() {
        let agent = sample_agent();
        assert!(agent.accepts_key("current-key", Utc::now()));
    }

    #[test]
    fn previous_key_accepted_only_inside_grace_window() {
        let agent = sample_agent();
        assert!(agent.accepts_key("old-key", Utc::now()));
        let after_grace = Utc::now() + Duration::hours(25);
        assert!(!agent.accepts_key("old-key", after_grace));
    }

    #[test]
    fn suspended_agents_cannot_act() {
        assert!(!AgentStatus::Suspended.can_act());
        assert!(!AgentStatus::Compromised.can_act());
        assert!(AgentStatus::Verified.can_act());
    }
}
