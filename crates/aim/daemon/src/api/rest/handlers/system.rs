//! Health, status and metrics handlers.

use crate::api::rest::state::AppState;
use crate::config::StorageConfig;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

static STARTED_AT: OnceLock<Instant> = OnceLock::new();

/// Record process start; called once from server boot.
pub fn mark_started() {
    let _ = STARTED_AT.set(Instant::now());
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub storage: &'static str,
    pub uptime_secs: u64,
}

pub async fn daemon_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        storage: match &state.config.storage {
            StorageConfig::Memory => "memory",
            StorageConfig::Postgres { .. } => "postgres",
        },
        uptime_secs: STARTED_AT
            .get()
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0),
    })
}

/// Prometheus exposition.
pub async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
