//! Admin adjudication surfaces.

use super::capabilities::recalculate_trust;
use super::{audit, parse_uuid, Pagination};
use crate::api::rest::auth::require_admin;
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use aim_decider::CallerInfo;
use aim_storage::{
    CapabilityStore, PendingStatusCounts, VerificationEventStore, VerificationFilter,
};
use aim_types::{
    CapabilityRequest, CapabilityRequestId, CapabilityRequestStatus, RequestContext,
    VerificationEvent, VerificationId, VerificationStatus,
};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub struct PendingResponse {
    pub events: Vec<VerificationEvent>,
    pub counts: PendingStatusCounts,
}

/// GET /admin/verifications/pending.
pub async fn pending_verifications(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PendingResponse>> {
    require_admin(&ctx)?;
    let filter = VerificationFilter {
        organization_id: Some(ctx.organization_id),
        status: Some(VerificationStatus::Pending),
        pending_approval_only: true,
        ..Default::default()
    };
    let events = state.store.list_events(&filter, page.window()).await?;
    let counts = state
        .store
        .pending_status_counts(&ctx.organization_id)
        .await?;
    Ok(Json(PendingResponse { events, counts }))
}

#[derive(Deserialize)]
pub struct AdjudicationRequest {
    pub reason: String,
}

fn caller(ctx: &RequestContext) -> CallerInfo {
    CallerInfo {
        user_id: ctx.user_id,
        ip: ctx.ip.clone(),
        user_agent: ctx.user_agent.clone(),
    }
}

/// POST /admin/verifications/{id}/approve.
pub async fn approve_verification(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(request): Json<AdjudicationRequest>,
) -> ApiResult<Json<VerificationEvent>> {
    adjudicate(state, ctx, id, true, request.reason).await
}

/// POST /admin/verifications/{id}/deny.
pub async fn deny_verification(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(request): Json<AdjudicationRequest>,
) -> ApiResult<Json<VerificationEvent>> {
    adjudicate(state, ctx, id, false, request.reason).await
}

async fn adjudicate(
    state: AppState,
    ctx: RequestContext,
    id: String,
    approve: bool,
    reason: String,
) -> ApiResult<Json<VerificationEvent>> {
    require_admin(&ctx)?;
    if reason.trim().is_empty() {
        return Err(ApiError::Validation(
            "an adjudication requires a reason".to_string(),
        ));
    }
    let event_id = VerificationId::from_uuid(parse_uuid(&id)?);
    let event = state
        .decider
        .adjudicate(
            &ctx.organization_id,
            &event_id,
            approve,
            &reason,
            &caller(&ctx),
        )
        .await?;
    Ok(Json(event))
}

#[derive(Deserialize)]
pub struct CapabilityRequestQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /admin/capability-requests.
pub async fn list_capability_requests(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<CapabilityRequestQuery>,
) -> ApiResult<Json<Vec<CapabilityRequest>>> {
    require_admin(&ctx)?;
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            CapabilityRequestStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown status `{raw}`")))
        })
        .transpose()?;
    let window = Pagination {
        limit: query.limit,
        offset: query.offset,
    }
    .window();
    Ok(Json(
        state
            .store
            .list_capability_requests(&ctx.organization_id, status, window)
            .await?,
    ))
}

/// POST /admin/capability-requests/{id}/approve - approval creates the grant.
pub async fn approve_capability_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<CapabilityRequest>> {
    decide_capability_request(state, ctx, id, true).await
}

/// POST /admin/capability-requests/{id}/reject.
pub async fn reject_capability_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<CapabilityRequest>> {
    decide_capability_request(state, ctx, id, false).await
}

async fn decide_capability_request(
    state: AppState,
    ctx: RequestContext,
    id: String,
    approve: bool,
) -> ApiResult<Json<CapabilityRequest>> {
    require_admin(&ctx)?;
    let request_id = CapabilityRequestId::from_uuid(parse_uuid(&id)?);
    let (request, grant) = state
        .store
        .decide_capability_request(
            &ctx.organization_id,
            &request_id,
            approve,
            ctx.user_id,
            Utc::now(),
        )
        .await?;

    audit(
        &state,
        &ctx,
        if approve {
            "capability_request.approved"
        } else {
            "capability_request.rejected"
        },
        "capability_request",
        request.id.to_string(),
        serde_json::json!({"agent_id": request.agent_id, "capability_type": request.capability_type}),
    )
    .await?;

    if grant.is_some() {
        recalculate_trust(&state, &request.agent_id, "capability request approved").await;
    }
    Ok(Json(request))
}
