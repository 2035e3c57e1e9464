//! MCP servers, attestations and agent connections.

use crate::ids::{AgentId, AttestationId, McpServerId, OrganizationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpVerificationStatus {
    Unverified,
    Attested,
    Drifted,
}

impl McpVerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Attested => "attested",
            Self::Drifted => "drifted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unverified" => Some(Self::Unverified),
            "attested" => Some(Self::Attested),
            "drifted" => Some(Self::Drifted),
            _ => None,
        }
    }
}

/// A registered MCP tool endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpServer {
    pub id: McpServerId,
    pub organization_id: OrganizationId,
    /// Unique within the organization.
    pub name: String,
    /// Unique within the organization.
    pub url: String,
    /// Rolling confidence in [0,1], updated by each verified attestation.
    pub confidence_score: f64,
    pub attestation_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attested_at: Option<DateTime<Utc>>,
    pub verification_status: McpVerificationStatus,
    /// Capabilities the server declares; attestations are diffed against this.
    pub capabilities: Vec<String>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

/// A signed assertion by an agent about an MCP server it connected to.
///
/// Attestations older than five minutes at verification time are rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpAttestation {
    pub id: AttestationId,
    pub mcp_server_id: McpServerId,
    pub agent_id: AgentId,
    pub capabilities_found: Vec<String>,
    pub connection_latency_ms: i64,
    pub signed_at: DateTime<Utc>,
    /// Ed25519 over the canonical attestation payload, base64.
    pub signature: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

/// Established relationship between an agent and an MCP server.
/// Created on first attestation; counters updated on each.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentMcpConnection {
    pub agent_id: AgentId,
    pub mcp_server_id: McpServerId,
    pub attestation_count: i64,
    pub last_attested_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
