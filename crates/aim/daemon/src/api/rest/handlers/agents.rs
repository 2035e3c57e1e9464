//! Agent registration, keys and credentials.

use super::{audit, parse_uuid, Pagination};
use crate::api::rest::auth::{require_writer};
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use aim_crypto::{decode_public_key, generate_keypair};
use aim_storage::{AgentStore, NewAgent};
use aim_tokens::TokenManager;
use aim_types::{Agent, AgentId, AuthMethod, RequestContext};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Ed25519 public key, base64. Omitted: the server generates a keypair
    /// and returns the private half exactly once.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub talks_to: Vec<String>,
}

#[derive(Serialize)]
pub struct CreateAgentResponse {
    pub agent: Agent,
    /// Returned exactly once; only its hash is stored.
    pub api_key: String,
    /// Present only when the server generated the keypair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// POST /agents.
pub async fn create_agent(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<CreateAgentResponse>)> {
    require_writer(&ctx)?;
    if request.name.trim().is_empty() {
        return Err(ApiError::Validation("agent name is required".to_string()));
    }

    let (public_key, private_key) = match request.public_key {
        Some(key) => {
            decode_public_key(&key)
                .map_err(|error| ApiError::Validation(error.to_string()))?;
            (key, None)
        }
        None => {
            let keypair = generate_keypair();
            (keypair.public_key, Some(keypair.private_key))
        }
    };
    let (api_key, api_key_hash) = TokenManager::generate_api_key();

    let agent = state
        .store
        .create_agent(NewAgent {
            organization_id: ctx.organization_id,
            display_name: request
                .display_name
                .unwrap_or_else(|| request.name.clone()),
            name: request.name,
            public_key,
            api_key_hash: Some(api_key_hash),
            talks_to: request.talks_to,
            created_by: ctx.user_id,
        })
        .await?;

    audit(
        &state,
        &ctx,
        "agent.created",
        "agent",
        agent.id.to_string(),
        serde_json::json!({"name": agent.name}),
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateAgentResponse {
            agent,
            api_key,
            private_key,
        }),
    ))
}

/// GET /agents.
pub async fn list_agents(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<Agent>>> {
    Ok(Json(
        state
            .store
            .list_agents(&ctx.organization_id, page.window())
            .await?,
    ))
}

/// GET /agents/{id}.
pub async fn get_agent(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    let agent = fetch_agent(&state, &ctx, &id).await?;
    Ok(Json(agent))
}

#[derive(Serialize)]
pub struct RotateCredentialsResponse {
    pub agent: Agent,
    /// Returned exactly once.
    pub private_key: String,
    pub public_key: String,
    pub grace_until: Option<DateTime<Utc>>,
}

/// POST /agents/{id}/rotate-credentials.
pub async fn rotate_agent_credentials(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<RotateCredentialsResponse>> {
    require_writer(&ctx)?;
    let agent = fetch_agent(&state, &ctx, &id).await?;
    let (keypair, updated) = state.tokens.rotate_agent_credentials(&agent).await?;

    audit(
        &state,
        &ctx,
        "agent.credentials_rotated",
        "agent",
        updated.id.to_string(),
        serde_json::json!({"rotation_count": updated.rotation_count}),
    )
    .await?;

    Ok(Json(RotateCredentialsResponse {
        grace_until: updated.key_rotation_grace_until,
        public_key: keypair.public_key.clone(),
        private_key: keypair.private_key,
        agent: updated,
    }))
}

#[derive(Deserialize)]
pub struct RegisterKeyRequest {
    pub public_key: String,
}

/// PUT /agents/{id}/keys - SDK self-registers a public key.
pub async fn register_agent_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(request): Json<RegisterKeyRequest>,
) -> ApiResult<Json<Agent>> {
    let agent = fetch_agent(&state, &ctx, &id).await?;
    // An API-key caller may only touch its own keys.
    if ctx.auth_method == AuthMethod::ApiKey && ctx.agent_id != Some(agent.id) {
        return Err(ApiError::Forbidden(
            "API key does not belong to this agent".to_string(),
        ));
    }
    decode_public_key(&request.public_key)
        .map_err(|error| ApiError::Validation(error.to_string()))?;

    let updated = state
        .store
        .register_public_key(&agent.id, &request.public_key, Utc::now())
        .await?;

    audit(
        &state,
        &ctx,
        "agent.key_registered",
        "agent",
        updated.id.to_string(),
        serde_json::json!({}),
    )
    .await?;
    Ok(Json(updated))
}

pub(crate) async fn fetch_agent(
    state: &AppState,
    ctx: &RequestContext,
    id: &str,
) -> ApiResult<Agent> {
    let agent_id = AgentId::from_uuid(parse_uuid(id)?);
    state
        .store
        .get_agent_scoped(&ctx.organization_id, &agent_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent {id}")))
}
