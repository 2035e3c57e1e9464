//! Webhook subscription management.

use super::{audit, parse_uuid, Pagination};
use crate::api::rest::auth::require_writer;
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use aim_storage::WebhookStore;
use aim_types::{RequestContext, Webhook, WebhookDelivery, WebhookId};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateWebhookRequest {
    pub url: String,
    /// HMAC secret; generated when omitted and returned exactly once.
    #[serde(default)]
    pub secret: Option<String>,
    pub event_types: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
}

fn default_max_attempts() -> i32 {
    5
}

#[derive(Serialize)]
pub struct CreateWebhookResponse {
    pub webhook: Webhook,
    /// Present only at creation.
    pub secret: String,
}

/// POST /webhooks.
pub async fn create_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<CreateWebhookRequest>,
) -> ApiResult<(StatusCode, Json<CreateWebhookResponse>)> {
    require_writer(&ctx)?;
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(ApiError::Validation("url must be http(s)".to_string()));
    }
    if request.event_types.is_empty() {
        return Err(ApiError::Validation(
            "at least one event type is required".to_string(),
        ));
    }
    let secret = request
        .secret
        .unwrap_or_else(|| format!("whsec_{}", Uuid::new_v4().simple()));
    let webhook = Webhook {
        id: WebhookId::generate(),
        organization_id: ctx.organization_id,
        url: request.url,
        secret: secret.clone(),
        event_types: request.event_types,
        is_enabled: true,
        max_attempts: request.max_attempts.clamp(1, 20),
        created_at: Utc::now(),
    };
    let webhook = state.store.create_webhook(webhook).await?;

    audit(
        &state,
        &ctx,
        "webhook.created",
        "webhook",
        webhook.id.to_string(),
        serde_json::json!({"url": webhook.url}),
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateWebhookResponse { webhook, secret }),
    ))
}

/// GET /webhooks.
pub async fn list_webhooks(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<Vec<Webhook>>> {
    Ok(Json(state.store.list_webhooks(&ctx.organization_id).await?))
}

/// GET /webhooks/{id}.
pub async fn get_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Webhook>> {
    Ok(Json(fetch_webhook(&state, &ctx, &id).await?))
}

#[derive(Deserialize)]
pub struct UpdateWebhookRequest {
    pub url: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub is_enabled: Option<bool>,
    pub max_attempts: Option<i32>,
}

/// PUT /webhooks/{id}.
pub async fn update_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(request): Json<UpdateWebhookRequest>,
) -> ApiResult<Json<Webhook>> {
    require_writer(&ctx)?;
    let mut webhook = fetch_webhook(&state, &ctx, &id).await?;
    if let Some(url) = request.url {
        webhook.url = url;
    }
    if let Some(event_types) = request.event_types {
        webhook.event_types = event_types;
    }
    if let Some(is_enabled) = request.is_enabled {
        webhook.is_enabled = is_enabled;
    }
    if let Some(max_attempts) = request.max_attempts {
        webhook.max_attempts = max_attempts.clamp(1, 20);
    }
    let webhook = state.store.update_webhook(webhook).await?;

    audit(
        &state,
        &ctx,
        "webhook.updated",
        "webhook",
        webhook.id.to_string(),
        serde_json::json!({}),
    )
    .await?;
    Ok(Json(webhook))
}

/// DELETE /webhooks/{id}.
pub async fn delete_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_writer(&ctx)?;
    let webhook_id = WebhookId::from_uuid(parse_uuid(&id)?);
    state
        .store
        .delete_webhook(&ctx.organization_id, &webhook_id)
        .await?;
    audit(
        &state,
        &ctx,
        "webhook.deleted",
        "webhook",
        webhook_id.to_string(),
        serde_json::json!({}),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /webhooks/{id}/test - dispatches exactly one delivery.
pub async fn test_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<WebhookDelivery>> {
    let webhook = fetch_webhook(&state, &ctx, &id).await?;
    Ok(Json(state.webhooks.send_test(&webhook).await?))
}

/// GET /webhooks/{id}/deliveries.
pub async fn list_deliveries(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<WebhookDelivery>>> {
    let webhook = fetch_webhook(&state, &ctx, &id).await?;
    Ok(Json(
        state
            .store
            .list_deliveries(&webhook.id, page.window())
            .await?,
    ))
}

async fn fetch_webhook(state: &AppState, ctx: &RequestContext, id: &str) -> ApiResult<Webhook> {
    let webhook_id = WebhookId::from_uuid(parse_uuid(id)?);
    state
        .store
        .get_webhook(&ctx.organization_id, &webhook_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("webhook {id}")))
}
