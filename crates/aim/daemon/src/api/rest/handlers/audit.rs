//! Audit-log queries.

use super::Pagination;
use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use aim_storage::AuditStore;
use aim_types::{AuditLogEntry, RequestContext};
use axum::extract::{Query, State};
use axum::{Extension, Json};

/// GET /audit-log - newest first, org-scoped.
pub async fn list_audit_log(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<AuditLogEntry>>> {
    Ok(Json(
        state
            .store
            .list_audit(&ctx.organization_id, page.window())
            .await?,
    ))
}
