//! Query inputs and aggregate outputs shared by both backends.

use aim_types::{
    AgentId, AlertSeverity, McpServerId, OrganizationId, Protocol, UserId, VerificationStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl Default for QueryWindow {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Fields needed to register a new agent.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub organization_id: OrganizationId,
    pub name: String,
    pub display_name: String,
    pub public_key: String,
    pub api_key_hash: Option<String>,
    pub talks_to: Vec<String>,
    pub created_by: Option<UserId>,
}

/// Fields needed to register a new MCP server.
#[derive(Debug, Clone)]
pub struct NewMcpServer {
    pub organization_id: OrganizationId,
    pub name: String,
    pub url: String,
    pub capabilities: Vec<String>,
    pub created_by: Option<UserId>,
}

/// Filters for the verification-event listing.
#[derive(Debug, Clone, Default)]
pub struct VerificationFilter {
    pub organization_id: Option<OrganizationId>,
    pub agent_id: Option<AgentId>,
    pub mcp_server_id: Option<McpServerId>,
    pub status: Option<VerificationStatus>,
    pub protocol: Option<Protocol>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Substring match against the action and the recorded agent name.
    pub search: Option<String>,
    /// Only events awaiting human adjudication: pending with no decision
    /// result recorded (approved-but-unreported events stay pending too,
    /// but already carry their result).
    pub pending_approval_only: bool,
}

/// Aggregate statistics for a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationStats {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub pending: i64,
    pub avg_duration_ms: f64,
    pub by_protocol: BTreeMap<String, i64>,
    pub by_type: BTreeMap<String, i64>,
}

/// Status counts returned alongside the pending-adjudication listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingStatusCounts {
    pub pending: i64,
    pub success: i64,
    pub failed: i64,
}

/// Per-agent event aggregates backing the trust factors.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentEventStats {
    pub attempts: i64,
    pub successes: i64,
    /// Distinct UTC hours with at least one successful event.
    pub active_hours: i64,
}

/// Filters for the alert listing.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<AlertSeverity>,
    pub is_acknowledged: Option<bool>,
    pub unresolved_only: bool,
}

/// Hash for one audit entry, chaining in the previous hash so retroactive
/// edits are detectable. Shared by both backends so chains interoperate.
pub(crate) fn compute_audit_hash(
    event: &aim_types::AuditAppend,
    previous_hash: Option<&str>,
    sequence: i64,
) -> crate::StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "timestamp": event.timestamp,
        "organization_id": event.organization_id,
        "user_id": event.user_id,
        "action": event.action,
        "entity_type": event.entity_type,
        "entity_id": event.entity_id,
        "metadata": event.metadata,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| crate::StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}
