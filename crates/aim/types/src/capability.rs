//! Capability grants and pending capability requests.

use crate::ids::{AgentId, CapabilityId, CapabilityRequestId, OrganizationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A typed permission granted to an agent.
///
/// A grant is active iff `revoked_at` is null.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentCapability {
    pub id: CapabilityId,
    pub organization_id: OrganizationId,
    pub agent_id: AgentId,
    /// Action class this grant covers, e.g. `read_database`.
    pub capability_type: String,
    /// JSON predicate restricting resources; empty object matches all.
    pub scope: serde_json::Value,
    pub granted_by: Option<UserId>,
    pub granted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<UserId>,
}

impl AgentCapability {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl CapabilityRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A pending request to obtain a capability; approval creates an
/// [`AgentCapability`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub id: CapabilityRequestId,
    pub organization_id: OrganizationId,
    pub agent_id: AgentId,
    pub capability_type: String,
    pub scope: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    pub status: CapabilityRequestStatus,
    pub requested_by: Option<UserId>,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}
