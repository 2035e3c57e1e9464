//! Request handlers, grouped per resource.

mod admin;
mod agents;
mod alerts;
mod audit;
mod capabilities;
mod mcp;
mod system;
mod tokens;
mod trust;
mod verifications;
mod webhooks;

pub use admin::*;
pub use agents::*;
pub use alerts::*;
pub use audit::*;
pub use capabilities::*;
pub use mcp::*;
pub use system::*;
pub use tokens::*;
pub use trust::*;
pub use verifications::*;
pub use webhooks::*;

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use aim_storage::{AuditStore, QueryWindow};
use aim_types::{AuditAppend, RequestContext};
use chrono::Utc;
use serde::Deserialize;

/// Common pagination query parameters.
#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl Pagination {
    pub fn window(&self) -> QueryWindow {
        QueryWindow {
            limit: self.limit.unwrap_or(50).min(500),
            offset: self.offset.unwrap_or(0),
        }
    }
}

pub(crate) fn parse_uuid(raw: &str) -> ApiResult<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).map_err(|_| ApiError::Validation(format!("malformed id `{raw}`")))
}

/// Append an audit row for a mutating handler. Audit durability is part of
/// the operation: failures propagate as 500s.
pub(crate) async fn audit(
    state: &AppState,
    ctx: &RequestContext,
    action: &str,
    entity_type: &str,
    entity_id: String,
    metadata: serde_json::Value,
) -> ApiResult<()> {
    state
        .store
        .append_audit(AuditAppend {
            organization_id: ctx.organization_id,
            user_id: ctx.user_id,
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            metadata,
            timestamp: Utc::now(),
        })
        .await?;
    Ok(())
}
