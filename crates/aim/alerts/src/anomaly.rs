//! Anomaly detection over recent verification activity.
//!
//! Runs as a background task after a decision is returned. It receives a
//! [`TaskContext`] of copied values and its own deadline; it must never
//! hold request state, which is gone by the time it runs.

use crate::AlertEngine;
use aim_storage::{ControlPlaneStore, VerificationEventStore};
use aim_types::{AgentId, AlertSeverity, TaskContext};
use chrono::{Duration, Timelike, Utc};
use std::sync::Arc;

/// Baselines an organization considers normal.
#[derive(Clone, Copy, Debug)]
pub struct AnomalyBaselines {
    /// Requests tolerated inside the lookback window.
    pub max_requests_per_window: i64,
    /// Lookback window, minutes.
    pub window_minutes: i64,
    /// Business hours (UTC, inclusive); activity mostly outside them is
    /// flagged.
    pub business_hours: (u32, u32),
    /// Off-hours share of recent events above which an alert fires.
    pub max_off_hours_ratio: f64,
}

impl Default for AnomalyBaselines {
    fn default() -> Self {
        Self {
            max_requests_per_window: 60,
            window_minutes: 15,
            business_hours: (8, 18),
            max_off_hours_ratio: 0.5,
        }
    }
}

/// Deadline for one scan.
pub const ANOMALY_SCAN_TIMEOUT_SECS: u64 = 30;

/// Scan an agent's recent events and raise an alert when the request rate
/// or the off-hours ratio crosses the baselines.
pub async fn run_anomaly_scan(
    store: Arc<dyn ControlPlaneStore>,
    alerts: AlertEngine,
    ctx: TaskContext,
    agent_id: AgentId,
    baselines: AnomalyBaselines,
) {
    let scan = async {
        let now = Utc::now();
        let window_start = now - Duration::minutes(baselines.window_minutes);
        let rate = match store.count_agent_events_since(&agent_id, window_start).await {
            Ok(rate) => rate,
            Err(error) => {
                tracing::warn!(%error, "anomaly scan could not count events");
                return;
            }
        };

        if rate > baselines.max_requests_per_window {
            let _ = alerts
                .create(
                    ctx.organization_id,
                    "unusual_activity",
                    AlertSeverity::High,
                    "Unusual request rate",
                    format!(
                        "{rate} verification requests in the last {} minutes (baseline {})",
                        baselines.window_minutes, baselines.max_requests_per_window
                    ),
                    Some("agent".to_string()),
                    Some(agent_id.to_string()),
                )
                .await
                .map_err(|error| tracing::warn!(%error, "rate-anomaly alert failed"));
            return;
        }

        let day_start = now - Duration::hours(24);
        let recent = match store.recent_agent_events(&agent_id, day_start, 500).await {
            Ok(events) => events,
            Err(error) => {
                tracing::warn!(%error, "anomaly scan could not load recent events");
                return;
            }
        };
        if recent.len() < 10 {
            // Not enough signal to call anything anomalous.
            return;
        }
        let (start, end) = baselines.business_hours;
        let off_hours = recent
            .iter()
            .filter(|event| {
                let hour = event.started_at.hour();
                hour < start || hour > end
            })
            .count();
        let ratio = off_hours as f64 / recent.len() as f64;
        if ratio > baselines.max_off_hours_ratio {
            let _ = alerts
                .create(
                    ctx.organization_id,
                    "unusual_activity",
                    AlertSeverity::Warning,
                    "Off-hours activity",
                    format!(
                        "{:.0}% of the agent's recent requests fall outside {start:02}:00-{end:02}:00 UTC",
                        ratio * 100.0
                    ),
                    Some("agent".to_string()),
                    Some(agent_id.to_string()),
                )
                .await
                .map_err(|error| tracing::warn!(%error, "off-hours alert failed"));
        }
    };

    if tokio::time::timeout(
        std::time::Duration::from_secs(ANOMALY_SCAN_TIMEOUT_SECS),
        scan,
    )
    .await
    .is_err()
    {
        tracing::warn!(agent_id = %agent_id, "anomaly scan timed out");
    }
}
