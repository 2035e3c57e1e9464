//! Shared application state.

use crate::api::rest::rate_limit::RateLimiter;
use crate::config::DaemonConfig;
use aim_alerts::AlertEngine;
use aim_attestation::AttestationEngine;
use aim_capability::CapabilityService;
use aim_decider::Decider;
use aim_storage::ControlPlaneStore;
use aim_tokens::TokenManager;
use aim_trust::TrustService;
use aim_webhook::WebhookDispatcher;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Everything the handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ControlPlaneStore>,
    pub decider: Decider,
    pub capabilities: CapabilityService,
    pub trust: TrustService,
    pub alerts: AlertEngine,
    pub attestation: AttestationEngine,
    pub webhooks: WebhookDispatcher,
    pub tokens: TokenManager,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Option<PrometheusHandle>,
    pub config: Arc<DaemonConfig>,
}

impl AppState {
    /// Wire all services over a storage backend.
    pub fn build(store: Arc<dyn ControlPlaneStore>, config: DaemonConfig) -> Self {
        let trust = TrustService::new(store.clone());
        let alerts = AlertEngine::new(store.clone(), trust.clone());
        let webhooks = WebhookDispatcher::start(store.clone());
        let capabilities = CapabilityService::new(store.clone());
        let attestation = AttestationEngine::new(store.clone(), alerts.clone(), webhooks.clone());
        let decider = Decider::new(
            store.clone(),
            capabilities.clone(),
            alerts.clone(),
            webhooks.clone(),
        );
        let tokens = TokenManager::with_grace_window(
            store.clone(),
            &config.auth.jwt_secret,
            config.auth.rotation_grace_hours,
        );
        let rate_limiter = Arc::new(RateLimiter::per_minute(
            config.server.public_rate_limit_per_minute,
        ));
        // The recorder is process-global; a second build (tests) serves the
        // surface without its own exporter.
        let metrics = PrometheusBuilder::new().install_recorder().ok();

        Self {
            store,
            decider,
            capabilities,
            trust,
            alerts,
            attestation,
            webhooks,
            tokens,
            rate_limiter,
            metrics,
            config: Arc::new(config),
        }
    }
}
