//! SDK token endpoints: refresh rotation and revoked-token recovery.

use super::parse_uuid;
use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use aim_types::SdkTokenId;
use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub refresh_token: String,
    pub token_id: SdkTokenId,
    pub expires_at: DateTime<Utc>,
}

/// POST /auth/refresh - rotates the SDK refresh token; the old token is
/// revoked with reason "rotated".
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let issued = state
        .tokens
        .rotate_refresh_token(&request.refresh_token)
        .await?;
    Ok(Json(TokenResponse {
        refresh_token: issued.token,
        token_id: issued.record.id,
        expires_at: issued.expires_at,
    }))
}

/// POST /sdk-tokens/{id}/recover - mints a replacement for an
/// already-revoked refresh token, keeping its device metadata.
pub async fn recover_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let token_id = SdkTokenId::from_uuid(parse_uuid(&id)?);
    let issued = state
        .tokens
        .recover_revoked_token(&token_id, &request.refresh_token)
        .await?;
    Ok(Json(TokenResponse {
        refresh_token: issued.token,
        token_id: issued.record.id,
        expires_at: issued.expires_at,
    }))
}
