//! Append-only, actor-attributed audit records.

use crate::ids::{OrganizationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audit event. `user_id` is `None` for system-initiated actions.
///
/// Rows are hash-chained: `hash` covers the entry plus `previous_hash`, so
/// any retroactive edit breaks the chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub organization_id: OrganizationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub sequence: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub hash: String,
}

/// The fields callers supply; sequence and hashes are assigned on append.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditAppend {
    pub organization_id: OrganizationId,
    pub user_id: Option<UserId>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
