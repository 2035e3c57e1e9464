//! Verification events - the immutable decision records.

use crate::ids::{AgentId, McpServerId, OrganizationId, VerificationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Mcp,
    A2a,
    Acp,
    Did,
    Oauth,
    Saml,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mcp => "mcp",
            Self::A2a => "a2a",
            Self::Acp => "acp",
            Self::Did => "did",
            Self::Oauth => "oauth",
            Self::Saml => "saml",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "mcp" => Some(Self::Mcp),
            "a2a" => Some(Self::A2a),
            "acp" => Some(Self::Acp),
            "did" => Some(Self::Did),
            "oauth" => Some(Self::Oauth),
            "saml" => Some(Self::Saml),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    Identity,
    Capability,
    Permission,
}

impl VerificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Capability => "capability",
            Self::Permission => "permission",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "identity" => Some(Self::Identity),
            "capability" => Some(Self::Capability),
            "permission" => Some(Self::Permission),
            _ => None,
        }
    }
}

/// Lifecycle state. `Pending` is the only non-terminal state; the single
/// legal in-place mutation is `pending -> success | failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Success,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Final outcome of the decision, null while pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified,
    Denied,
    Expired,
}

impl VerificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "verified" => Some(Self::Verified),
            "denied" => Some(Self::Denied),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// The immutable record of one access decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub id: VerificationId,
    pub organization_id: OrganizationId,
    pub agent_id: AgentId,
    pub protocol: Protocol,
    pub verification_type: VerificationType,
    pub status: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<VerificationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Decision confidence in [0,1].
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub initiator_type: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Typed view over the event metadata blob for the fields the control
/// plane consumes. The blob column stays for forward compatibility, but
/// the hot path never reaches into it untyped.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerificationEventMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_server_id: Option<McpServerId>,
}

impl VerificationEventMeta {
    /// Unknown or missing fields read as `None`; extra blob keys survive
    /// untouched in the stored column.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

impl VerificationEvent {
    pub fn meta(&self) -> VerificationEventMeta {
        VerificationEventMeta::from_value(&self.metadata)
    }
}

/// The signed verification request body as received on the wire.
///
/// The canonical byte form of this request (see `aim-crypto`) is what the
/// agent signed; `timestamp` therefore stays a raw RFC3339 string so the
/// server re-serializes exactly the bytes the agent produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedActionRequest {
    pub agent_id: AgentId,
    pub action_type: String,
    /// Empty string is treated as absent (canonicalized to null).
    #[serde(default)]
    pub resource: Option<String>,
    /// Sorted during canonicalization; may be empty.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// RFC3339, must be within five minutes of server time.
    pub timestamp: String,
    /// Ed25519 signature, 64 bytes, base64.
    pub signature: String,
    /// Ed25519 public key, 32 bytes, base64.
    pub public_key: String,
    /// Optional explicit risk level; overrides the verb heuristic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
}

impl SignedActionRequest {
    /// Resource normalized per the canonicalization rule: empty => None.
    pub fn normalized_resource(&self) -> Option<&str> {
        match self.resource.as_deref() {
            None | Some("") => None,
            Some(other) => Some(other),
        }
    }

    /// Split `resource` into `(resource_type, resource_id)` for the event
    /// record. A `scheme://rest` or `type:id` form splits on the first
    /// separator; anything else is recorded as the resource type alone.
    pub fn resource_parts(&self) -> (Option<String>, Option<String>) {
        match self.normalized_resource() {
            None => (None, None),
            Some(resource) => match resource.split_once("://").or_else(|| resource.split_once(':')) {
                Some((kind, id)) => (Some(kind.to_string()), Some(id.to_string())),
                None => (Some(resource.to_string()), None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_resource_normalizes_to_none() {
        let request = SignedActionRequest {
            agent_id: AgentId::generate(),
            action_type: "read_database".to_string(),
            resource: Some(String::new()),
            context: BTreeMap::new(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            signature: String::new(),
            public_key: String::new(),
            risk_level: None,
        };
        assert_eq!(request.normalized_resource(), None);
        assert_eq!(request.resource_parts(), (None, None));
    }

    #[test]
    fn resource_parts_split_on_scheme() {
        let request = SignedActionRequest {
            agent_id: AgentId::generate(),
            action_type: "read_database".to_string(),
            resource: Some("db://customers/42".to_string()),
            context: BTreeMap::new(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            signature: String::new(),
            public_key: String::new(),
            risk_level: None,
        };
        let (kind, id) = request.resource_parts();
        assert_eq!(kind.as_deref(), Some("db"));
        assert_eq!(id.as_deref(), Some("customers/42"));
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(VerificationStatus::Success.is_terminal());
        assert!(VerificationStatus::Failed.is_terminal());
        assert!(!VerificationStatus::Pending.is_terminal());
    }
}
