//! Authentication middleware.
//!
//! The single site that classifies incoming credentials into an
//! [`AuthMethod`]: bearer JWT for users, `X-AIM-API-Key` for SDK/backend
//! callers. Ed25519-signed public endpoints bypass this middleware - their
//! authentication is the signature itself, checked by the decider.

use crate::api::rest::state::AppState;
use crate::error::ApiError;
use aim_crypto::sha256_hex;
use aim_storage::AgentStore;
use aim_types::{AuthMethod, RequestContext, UserRole};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Header carrying the SDK/backend API key.
pub const API_KEY_HEADER: &str = "X-AIM-API-Key";

/// Attach a [`RequestContext`] or short-circuit with 401.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match classify(&state, request.headers()).await {
        Ok(ctx) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(error) => error.into_response(),
    }
}

async fn classify(state: &AppState, headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let ip = client_ip(headers);
    let user_agent = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        let claims = state.tokens.verify_access_token(bearer)?;
        let subject = claims.subject()?;
        return Ok(RequestContext {
            organization_id: subject.organization_id,
            user_id: Some(subject.user_id),
            role: Some(subject.role),
            agent_id: None,
            auth_method: AuthMethod::UserJwt,
            ip,
            user_agent,
        });
    }

    if let Some(api_key) = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        let agent = state
            .store
            .find_agent_by_api_key_hash(&sha256_hex(api_key.as_bytes()))
            .await?
            .ok_or_else(|| ApiError::Unauthorized("invalid API key".to_string()))?;
        return Ok(RequestContext {
            organization_id: agent.organization_id,
            user_id: None,
            role: None,
            agent_id: Some(agent.id),
            auth_method: AuthMethod::ApiKey,
            ip,
            user_agent,
        });
    }

    Err(ApiError::Unauthorized("missing credentials".to_string()))
}

/// Best-effort client address for audit rows and rate-limit keys.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').next().unwrap_or(value).trim().to_string())
}

/// Admin-only surfaces.
pub fn require_admin(ctx: &RequestContext) -> Result<(), ApiError> {
    match ctx.role {
        Some(role) if role.is_admin() => Ok(()),
        Some(_) => Err(ApiError::Forbidden("admin role required".to_string())),
        None => Err(ApiError::Forbidden(
            "user credentials required".to_string(),
        )),
    }
}

/// Mutating surfaces: any user who can write, or an agent API key.
pub fn require_writer(ctx: &RequestContext) -> Result<(), ApiError> {
    match (ctx.role, ctx.auth_method) {
        (_, AuthMethod::ApiKey) => Ok(()),
        (Some(role), _) if role.can_mutate() => Ok(()),
        (Some(UserRole::Viewer), _) => {
            Err(ApiError::Forbidden("viewer role is read-only".to_string()))
        }
        _ => Err(ApiError::Forbidden("insufficient role".to_string())),
    }
}
