//! MCP server registration and attestation.

use super::{audit, parse_uuid, Pagination};
use crate::api::rest::auth::require_writer;
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use aim_attestation::{AttestationSubmission, CapabilityDrift};
use aim_storage::{AttestationStore, NewMcpServer};
use aim_types::{
    AgentId, AgentMcpConnection, McpAttestation, McpServer, McpServerId, RequestContext,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct CreateMcpRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// POST /mcp-servers. Duplicate URLs within the org conflict.
pub async fn create_mcp_server(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<CreateMcpRequest>,
) -> ApiResult<(StatusCode, Json<McpServer>)> {
    require_writer(&ctx)?;
    if request.url.trim().is_empty() {
        return Err(ApiError::Validation("url is required".to_string()));
    }
    let server = state
        .store
        .create_mcp_server(NewMcpServer {
            organization_id: ctx.organization_id,
            name: request.name,
            url: request.url,
            capabilities: request.capabilities,
            created_by: ctx.user_id,
        })
        .await?;

    audit(
        &state,
        &ctx,
        "mcp_server.created",
        "mcp_server",
        server.id.to_string(),
        serde_json::json!({"url": server.url}),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(server)))
}

/// GET /mcp-servers.
pub async fn list_mcp_servers(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<McpServer>>> {
    Ok(Json(
        state
            .store
            .list_mcp_servers(&ctx.organization_id, page.window())
            .await?,
    ))
}

/// GET /mcp-servers/{id}.
pub async fn get_mcp_server(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<McpServer>> {
    let server_id = McpServerId::from_uuid(parse_uuid(&id)?);
    let server = state
        .store
        .get_mcp_server_scoped(&ctx.organization_id, &server_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("mcp server {id}")))?;
    Ok(Json(server))
}

#[derive(Deserialize)]
pub struct AttestRequest {
    pub agent_id: AgentId,
    #[serde(default)]
    pub capabilities_found: Vec<String>,
    pub connection_latency_ms: i64,
    pub signed_at: DateTime<Utc>,
    /// Ed25519 over the canonical attestation payload, base64.
    pub signature: String,
}

#[derive(Serialize)]
pub struct AttestResponse {
    pub attestation_id: aim_types::AttestationId,
    pub confidence: f64,
    pub attestation_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<CapabilityDrift>,
}

/// POST /mcp-servers/{id}/attest.
pub async fn attest_mcp_server(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(request): Json<AttestRequest>,
) -> ApiResult<(StatusCode, Json<AttestResponse>)> {
    let server_id = McpServerId::from_uuid(parse_uuid(&id)?);
    let outcome = state
        .attestation
        .attest(
            &ctx.organization_id,
            &server_id,
            AttestationSubmission {
                agent_id: request.agent_id,
                capabilities_found: request.capabilities_found,
                connection_latency_ms: request.connection_latency_ms,
                signed_at: request.signed_at,
                signature: request.signature,
            },
        )
        .await?;

    audit(
        &state,
        &ctx,
        "mcp_server.attested",
        "mcp_server",
        server_id.to_string(),
        serde_json::json!({
            "agent_id": request.agent_id,
            "confidence": outcome.confidence,
            "drifted": outcome.drift.is_some(),
        }),
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(AttestResponse {
            attestation_id: outcome.attestation.id,
            confidence: outcome.confidence,
            attestation_count: outcome.attestation_count,
            drift: outcome.drift,
        }),
    ))
}

/// GET /mcp-servers/{id}/attestations.
pub async fn list_attestations(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<McpAttestation>>> {
    let server_id = McpServerId::from_uuid(parse_uuid(&id)?);
    Ok(Json(
        state
            .attestation
            .list_attestations(&ctx.organization_id, &server_id, page.window())
            .await?,
    ))
}

/// GET /mcp-servers/{id}/connected-agents.
pub async fn connected_agents(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AgentMcpConnection>>> {
    let server_id = McpServerId::from_uuid(parse_uuid(&id)?);
    Ok(Json(
        state
            .attestation
            .connected_agents(&ctx.organization_id, &server_id)
            .await?,
    ))
}
