//! AIM Alerts - security signals and anomaly detection (C9).

#![deny(unsafe_code)]

pub mod anomaly;
pub mod severity;

pub use anomaly::{run_anomaly_scan, AnomalyBaselines};
pub use severity::derive_severity;

use aim_storage::{
    AgentStore, AlertFilter, AlertStore, ControlPlaneStore, QueryWindow, StorageResult,
};
use aim_trust::TrustService;
use aim_types::{
    Alert, AlertId, AlertSeverity, OrganizationId, UserId,
};
use chrono::Utc;
use std::sync::Arc;

/// Alert creation and lifecycle.
#[derive(Clone)]
pub struct AlertEngine {
    store: Arc<dyn ControlPlaneStore>,
    trust: TrustService,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn ControlPlaneStore>, trust: TrustService) -> Self {
        Self { store, trust }
    }

    /// Create an alert. High and critical alerts against an agent trigger a
    /// trust recalculation, since the security-alerts factor just changed.
    pub async fn create(
        &self,
        organization_id: OrganizationId,
        alert_type: impl Into<String>,
        severity: AlertSeverity,
        title: impl Into<String>,
        description: impl Into<String>,
        resource_type: Option<String>,
        resource_id: Option<String>,
    ) -> StorageResult<Alert> {
        let alert_type = alert_type.into();
        let alert = Alert {
            id: AlertId::generate(),
            organization_id,
            alert_type: alert_type.clone(),
            severity,
            title: title.into(),
            description: description.into(),
            resource_type: resource_type.clone(),
            resource_id: resource_id.clone(),
            is_acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            resolution: None,
            created_at: Utc::now(),
        };
        let alert = self.store.insert_alert(alert).await?;
        tracing::warn!(
            alert_type = %alert.alert_type,
            severity = %alert.severity.as_str(),
            "alert created"
        );
        metrics::counter!("aim_alerts_created_total", "severity" => severity.as_str())
            .increment(1);

        if severity >= AlertSeverity::High && resource_type.as_deref() == Some("agent") {
            if let Some(agent_id) = resource_id.and_then(|id| aim_types::AgentId::parse(&id).ok())
            {
                if let Ok(Some(agent)) = self.store.get_agent(&agent_id).await {
                    if let Err(error) = self
                        .trust
                        .calculate(&agent, "high-severity alert created")
                        .await
                    {
                        tracing::warn!(%error, "trust recalculation after alert failed");
                    }
                }
            }
        }
        Ok(alert)
    }

    pub async fn acknowledge(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
        acknowledged_by: UserId,
    ) -> StorageResult<Alert> {
        self.store
            .acknowledge_alert(organization_id, id, acknowledged_by, Utc::now())
            .await
    }

    pub async fn resolve(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
        resolution: &str,
    ) -> StorageResult<Alert> {
        self.store
            .resolve_alert(organization_id, id, resolution, Utc::now())
            .await
    }

    pub async fn list(
        &self,
        organization_id: &OrganizationId,
        filter: &AlertFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<Alert>> {
        self.store.list_alerts(organization_id, filter, window).await
    }

    pub async fn get(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
    ) -> StorageResult<Option<Alert>> {
        self.store.get_alert(organization_id, id).await
    }
}
