//! API router configuration.

use super::handlers;
use super::state::AppState;
use super::{auth, rate_limit};
use axum::{
    extract::{MatchedPath, Request},
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    // Public surface: health, metrics, and the agent-facing endpoints whose
    // authentication is the Ed25519 signature or the refresh token itself.
    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::daemon_status))
        .route("/metrics", get(handlers::metrics))
        .route("/verifications", post(handlers::create_verification))
        .route(
            "/verifications/:id/result",
            post(handlers::submit_verification_result),
        )
        .route("/auth/refresh", post(handlers::refresh_token))
        .route("/sdk-tokens/:id/recover", post(handlers::recover_token))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::limit_public,
        ));

    // Everything else requires a classified credential.
    let protected = Router::new()
        // Agents
        .route("/agents", post(handlers::create_agent).get(handlers::list_agents))
        .route("/agents/:id", get(handlers::get_agent))
        .route(
            "/agents/:id/rotate-credentials",
            post(handlers::rotate_agent_credentials),
        )
        .route("/agents/:id/keys", put(handlers::register_agent_key))
        // Capabilities
        .route(
            "/agents/:id/capabilities",
            post(handlers::grant_capability).get(handlers::list_capabilities),
        )
        .route(
            "/agents/:id/capabilities/:cid",
            delete(handlers::revoke_capability),
        )
        .route(
            "/agents/:id/capability-requests",
            post(handlers::create_capability_request),
        )
        // Trust
        .route(
            "/agents/:id/trust-score",
            get(handlers::get_trust_score).put(handlers::override_trust_score),
        )
        .route(
            "/agents/:id/trust-score/recalculate",
            post(handlers::recalculate_trust_score),
        )
        .route(
            "/agents/:id/trust-score/history",
            get(handlers::trust_score_history),
        )
        // MCP servers
        .route(
            "/mcp-servers",
            post(handlers::create_mcp_server).get(handlers::list_mcp_servers),
        )
        .route("/mcp-servers/:id", get(handlers::get_mcp_server))
        .route("/mcp-servers/:id/attest", post(handlers::attest_mcp_server))
        .route(
            "/mcp-servers/:id/attestations",
            get(handlers::list_attestations),
        )
        .route(
            "/mcp-servers/:id/connected-agents",
            get(handlers::connected_agents),
        )
        // Verification event log
        .route("/verifications", get(handlers::list_verifications))
        .route(
            "/verifications/statistics",
            get(handlers::verification_statistics),
        )
        .route("/verifications/:id", get(handlers::get_verification))
        // Alerts
        .route("/alerts", get(handlers::list_alerts))
        .route("/alerts/:id/acknowledge", post(handlers::acknowledge_alert))
        .route("/alerts/:id/resolve", post(handlers::resolve_alert))
        // Audit
        .route("/audit-log", get(handlers::list_audit_log))
        // Webhooks
        .route(
            "/webhooks",
            post(handlers::create_webhook).get(handlers::list_webhooks),
        )
        .route(
            "/webhooks/:id",
            get(handlers::get_webhook)
                .put(handlers::update_webhook)
                .delete(handlers::delete_webhook),
        )
        .route("/webhooks/:id/test", post(handlers::test_webhook))
        .route("/webhooks/:id/deliveries", get(handlers::list_deliveries))
        // Admin adjudication
        .route(
            "/admin/verifications/pending",
            get(handlers::pending_verifications),
        )
        .route(
            "/admin/verifications/:id/approve",
            post(handlers::approve_verification),
        )
        .route(
            "/admin/verifications/:id/deny",
            post(handlers::deny_verification),
        )
        .route(
            "/admin/capability-requests",
            get(handlers::list_capability_requests),
        )
        .route(
            "/admin/capability-requests/:id/approve",
            post(handlers::approve_capability_request),
        )
        .route(
            "/admin/capability-requests/:id/reject",
            post(handlers::reject_capability_request),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(middleware::from_fn(track_http_metrics))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state))
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::new()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    }
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

async fn track_http_metrics(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();
    let response = next.run(request).await;
    let labels = [
        ("method", method.to_string()),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("aim_http_requests_total", &labels).increment(1);
    metrics::histogram!("aim_http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());
    response
}
