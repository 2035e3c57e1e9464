//! Trust-score endpoints.

use super::agents::fetch_agent;
use super::{audit, Pagination};
use crate::api::rest::auth::require_admin;
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use aim_types::{RequestContext, TrustScore, TrustScoreHistory};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;

/// GET /agents/{id}/trust-score - current score with full breakdown.
pub async fn get_trust_score(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<TrustScore>> {
    let agent = fetch_agent(&state, &ctx, &id).await?;
    Ok(Json(state.trust.latest(&agent).await?))
}

/// POST /agents/{id}/trust-score/recalculate.
pub async fn recalculate_trust_score(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<TrustScore>> {
    let agent = fetch_agent(&state, &ctx, &id).await?;
    let score = state.trust.calculate(&agent, "manual recalculation").await?;
    audit(
        &state,
        &ctx,
        "trust_score.recalculated",
        "agent",
        agent.id.to_string(),
        serde_json::json!({"score": score.score}),
    )
    .await?;
    Ok(Json(score))
}

/// GET /agents/{id}/trust-score/history.
pub async fn trust_score_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<TrustScoreHistory>>> {
    let agent = fetch_agent(&state, &ctx, &id).await?;
    Ok(Json(
        state
            .trust
            .history(&agent.id, page.window().limit)
            .await?,
    ))
}

#[derive(Deserialize)]
pub struct OverrideRequest {
    pub score: f64,
    pub reason: String,
}

/// PUT /agents/{id}/trust-score - admin override; the old value is recorded.
pub async fn override_trust_score(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<Json<TrustScore>> {
    require_admin(&ctx)?;
    if request.reason.trim().is_empty() {
        return Err(ApiError::Validation(
            "an override requires a reason".to_string(),
        ));
    }
    let agent = fetch_agent(&state, &ctx, &id).await?;
    let score = state
        .trust
        .override_score(&agent, request.score, &request.reason, ctx.user_id)
        .await?;
    audit(
        &state,
        &ctx,
        "trust_score.overridden",
        "agent",
        agent.id.to_string(),
        serde_json::json!({"old": agent.trust_score, "new": score.score, "reason": request.reason}),
    )
    .await?;
    Ok(Json(score))
}
