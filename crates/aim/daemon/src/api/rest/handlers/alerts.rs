//! Alert listing and lifecycle.

use super::{audit, parse_uuid, Pagination};
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use aim_storage::AlertFilter;
use aim_types::{Alert, AlertId, AlertSeverity, RequestContext};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct AlertQuery {
    pub severity: Option<String>,
    pub acknowledged: Option<bool>,
    #[serde(default)]
    pub unresolved_only: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /alerts.
pub async fn list_alerts(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<AlertQuery>,
) -> ApiResult<Json<Vec<Alert>>> {
    let severity = query
        .severity
        .as_deref()
        .map(|raw| {
            AlertSeverity::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown severity `{raw}`")))
        })
        .transpose()?;
    let filter = AlertFilter {
        severity,
        is_acknowledged: query.acknowledged,
        unresolved_only: query.unresolved_only,
    };
    let window = Pagination {
        limit: query.limit,
        offset: query.offset,
    }
    .window();
    Ok(Json(
        state
            .alerts
            .list(&ctx.organization_id, &filter, window)
            .await?,
    ))
}

/// POST /alerts/{id}/acknowledge.
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Alert>> {
    let user_id = ctx
        .user_id
        .ok_or_else(|| ApiError::Forbidden("user credentials required".to_string()))?;
    let alert_id = AlertId::from_uuid(parse_uuid(&id)?);
    let alert = state
        .alerts
        .acknowledge(&ctx.organization_id, &alert_id, user_id)
        .await?;
    audit(
        &state,
        &ctx,
        "alert.acknowledged",
        "alert",
        alert.id.to_string(),
        serde_json::json!({}),
    )
    .await?;
    Ok(Json(alert))
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub resolution: String,
}

/// POST /alerts/{id}/resolve.
pub async fn resolve_alert(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Json<Alert>> {
    if request.resolution.trim().is_empty() {
        return Err(ApiError::Validation("resolution is required".to_string()));
    }
    let alert_id = AlertId::from_uuid(parse_uuid(&id)?);
    let alert = state
        .alerts
        .resolve(&ctx.organization_id, &alert_id, &request.resolution)
        .await?;
    audit(
        &state,
        &ctx,
        "alert.resolved",
        "alert",
        alert.id.to_string(),
        serde_json::json!({"resolution": request.resolution}),
    )
    .await?;
    Ok(Json(alert))
}
