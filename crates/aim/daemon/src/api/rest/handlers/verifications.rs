//! Verification endpoints: the signed decision path and the event log.

use super::{parse_uuid, Pagination};
use crate::api::rest::auth::client_ip;
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use aim_decider::{CallerInfo, DecisionKind};
use aim_storage::{VerificationEventStore, VerificationFilter, VerificationStats};
use aim_types::{
    AgentId, McpServerId, Protocol, RequestContext, SignedActionRequest, VerificationEvent,
    VerificationId, VerificationStatus,
};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize)]
pub struct DecisionResponse {
    pub status: &'static str,
    pub verification_id: VerificationId,
    pub audit_id: Uuid,
    pub trust_score: f64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn caller_from_headers(headers: &HeaderMap) -> CallerInfo {
    CallerInfo {
        user_id: None,
        ip: client_ip(headers),
        user_agent: headers
            .get("user-agent")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

/// POST /verifications - the signed decision path.
/// 201 approved, 200 pending, 403 denied, 401 signature failure.
pub async fn create_verification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SignedActionRequest>,
) -> Result<Response, ApiError> {
    let caller = caller_from_headers(&headers);
    let outcome = state.decider.decide(&request, &caller).await?;

    let labels = [
        ("decision", decision_label(outcome.kind)),
        ("protocol", outcome.event.protocol.as_str()),
    ];
    metrics::counter!("aim_verification_decisions_total", &labels).increment(1);

    match outcome.kind {
        DecisionKind::Denied => Err(ApiError::Denied {
            reason: outcome
                .reason
                .unwrap_or_else(|| "denied".to_string()),
            audit_id: outcome.audit_id,
            verification_id: outcome.event.id.0,
        }),
        kind => {
            let status = match kind {
                DecisionKind::Approved => StatusCode::CREATED,
                _ => StatusCode::OK,
            };
            let body = DecisionResponse {
                status: decision_label(kind),
                verification_id: outcome.event.id,
                audit_id: outcome.audit_id,
                trust_score: outcome.trust_score,
                confidence: outcome.confidence,
                reason: outcome.reason,
                expires_at: outcome.expires_at,
            };
            Ok((status, Json(body)).into_response())
        }
    }
}

fn decision_label(kind: DecisionKind) -> &'static str {
    match kind {
        DecisionKind::Approved => "approved",
        DecisionKind::Denied => "denied",
        DecisionKind::PendingApproval => "pending",
    }
}

#[derive(Deserialize)]
pub struct ResultSubmission {
    pub audit_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// POST /verifications/{id}/result - the agent reports the actual outcome.
pub async fn submit_verification_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(submission): Json<ResultSubmission>,
) -> ApiResult<Json<VerificationEvent>> {
    let event_id = VerificationId::from_uuid(parse_uuid(&id)?);
    let caller = caller_from_headers(&headers);
    let event = state
        .decider
        .submit_result(
            &event_id,
            submission.audit_id,
            submission.success,
            submission.metadata,
            &caller,
        )
        .await?;
    Ok(Json(event))
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub agent_id: Option<String>,
    pub mcp_server_id: Option<String>,
    pub status: Option<String>,
    pub protocol: Option<String>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub search: Option<String>,
    // Flattening Pagination breaks numeric parsing in urlencoded queries,
    // so the fields are inlined here.
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl EventQuery {
    fn filter(&self, ctx: &RequestContext) -> ApiResult<VerificationFilter> {
        let mut filter = VerificationFilter {
            organization_id: Some(ctx.organization_id),
            action: self.action.clone(),
            from: self.from,
            to: self.to,
            search: self.search.clone(),
            ..Default::default()
        };
        if let Some(agent_id) = &self.agent_id {
            filter.agent_id = Some(AgentId::from_uuid(parse_uuid(agent_id)?));
        }
        if let Some(mcp) = &self.mcp_server_id {
            filter.mcp_server_id = Some(McpServerId::from_uuid(parse_uuid(mcp)?));
        }
        if let Some(status) = &self.status {
            filter.status = Some(
                VerificationStatus::parse(status)
                    .ok_or_else(|| ApiError::Validation(format!("unknown status `{status}`")))?,
            );
        }
        if let Some(protocol) = &self.protocol {
            filter.protocol = Some(
                Protocol::parse(protocol)
                    .ok_or_else(|| ApiError::Validation(format!("unknown protocol `{protocol}`")))?,
            );
        }
        Ok(filter)
    }
}

#[derive(Serialize)]
pub struct EventListResponse {
    pub events: Vec<VerificationEvent>,
    pub total: i64,
}

/// GET /verifications - paginated, filtered event log.
pub async fn list_verifications(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<EventListResponse>> {
    let filter = query.filter(&ctx)?;
    let window = Pagination {
        limit: query.limit,
        offset: query.offset,
    }
    .window();
    let events = state.store.list_events(&filter, window).await?;
    let total = state.store.count_events(&filter).await?;
    Ok(Json(EventListResponse { events, total }))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// GET /verifications/statistics - aggregates for a time window.
pub async fn verification_statistics(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<VerificationStats>> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::days(30));
    let stats = state
        .store
        .verification_stats(&ctx.organization_id, from, to)
        .await?;
    Ok(Json(stats))
}

/// GET /verifications/{id}.
pub async fn get_verification(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<VerificationEvent>> {
    let event_id = VerificationId::from_uuid(parse_uuid(&id)?);
    let event = state
        .store
        .get_event(&event_id)
        .await?
        .filter(|event| ctx.owns(&event.organization_id))
        .ok_or_else(|| ApiError::NotFound(format!("verification event {id}")))?;
    Ok(Json(event))
}
