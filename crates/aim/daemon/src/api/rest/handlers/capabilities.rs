//! Capability grants and requests.

use super::agents::fetch_agent;
use super::{audit, parse_uuid};
use crate::api::rest::auth::require_writer;
use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use aim_storage::{AgentStore, CapabilityStore};
use aim_types::{
    AgentCapability, CapabilityId, CapabilityRequest, CapabilityRequestId,
    CapabilityRequestStatus, RequestContext,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct GrantRequest {
    pub capability_type: String,
    #[serde(default)]
    pub scope: serde_json::Value,
}

/// POST /agents/{id}/capabilities.
pub async fn grant_capability(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(request): Json<GrantRequest>,
) -> ApiResult<(StatusCode, Json<AgentCapability>)> {
    require_writer(&ctx)?;
    let agent = fetch_agent(&state, &ctx, &id).await?;
    let scope = if request.scope.is_null() {
        serde_json::json!({})
    } else {
        request.scope
    };
    let grant = state
        .capabilities
        .grant(
            ctx.organization_id,
            agent.id,
            request.capability_type,
            scope,
            ctx.user_id,
        )
        .await?;

    audit(
        &state,
        &ctx,
        "capability.granted",
        "capability",
        grant.id.to_string(),
        serde_json::json!({"agent_id": agent.id, "capability_type": grant.capability_type}),
    )
    .await?;
    recalculate_trust(&state, &agent.id, "capability granted").await;

    Ok((StatusCode::CREATED, Json(grant)))
}

#[derive(Deserialize)]
pub struct ListCapabilitiesQuery {
    #[serde(default)]
    pub active_only: Option<bool>,
}

/// GET /agents/{id}/capabilities.
pub async fn list_capabilities(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(query): Query<ListCapabilitiesQuery>,
) -> ApiResult<Json<Vec<AgentCapability>>> {
    let agent = fetch_agent(&state, &ctx, &id).await?;
    Ok(Json(
        state
            .capabilities
            .list(&agent.id, query.active_only.unwrap_or(true))
            .await?,
    ))
}

/// DELETE /agents/{id}/capabilities/{cid}.
pub async fn revoke_capability(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, cid)): Path<(String, String)>,
) -> ApiResult<Json<AgentCapability>> {
    require_writer(&ctx)?;
    let agent = fetch_agent(&state, &ctx, &id).await?;
    let capability_id = CapabilityId::from_uuid(parse_uuid(&cid)?);
    let revoked = state
        .capabilities
        .revoke(&ctx.organization_id, &capability_id, ctx.user_id)
        .await?;

    audit(
        &state,
        &ctx,
        "capability.revoked",
        "capability",
        revoked.id.to_string(),
        serde_json::json!({"agent_id": agent.id, "capability_type": revoked.capability_type}),
    )
    .await?;
    recalculate_trust(&state, &agent.id, "capability revoked").await;

    Ok(Json(revoked))
}

#[derive(Deserialize)]
pub struct CapabilityRequestBody {
    pub capability_type: String,
    #[serde(default)]
    pub scope: serde_json::Value,
    #[serde(default)]
    pub justification: Option<String>,
}

/// POST /agents/{id}/capability-requests.
pub async fn create_capability_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<CapabilityRequestBody>,
) -> ApiResult<(StatusCode, Json<CapabilityRequest>)> {
    let agent = fetch_agent(&state, &ctx, &id).await?;
    let request = CapabilityRequest {
        id: CapabilityRequestId::generate(),
        organization_id: ctx.organization_id,
        agent_id: agent.id,
        capability_type: body.capability_type,
        scope: if body.scope.is_null() {
            serde_json::json!({})
        } else {
            body.scope
        },
        justification: body.justification,
        status: CapabilityRequestStatus::Pending,
        requested_by: ctx.user_id,
        requested_at: Utc::now(),
        decided_by: None,
        decided_at: None,
    };
    let request = state.store.create_capability_request(request).await?;

    audit(
        &state,
        &ctx,
        "capability_request.created",
        "capability_request",
        request.id.to_string(),
        serde_json::json!({"agent_id": agent.id, "capability_type": request.capability_type}),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(request)))
}

/// Grants and revocations move the compliance inputs; recalculate in the
/// background so the mutation path stays fast.
pub(crate) async fn recalculate_trust(state: &AppState, agent_id: &aim_types::AgentId, reason: &str) {
    let store = state.store.clone();
    let trust = state.trust.clone();
    let agent_id = *agent_id;
    let reason = reason.to_string();
    tokio::spawn(async move {
        if let Ok(Some(agent)) = store.get_agent(&agent_id).await {
            if let Err(error) = trust.calculate(&agent, &reason).await {
                tracing::warn!(%error, "trust recalculation failed");
            }
        }
    });
}
