//! Asynchronous side effects of a decision (C8-C10 triggering).
//!
//! Runs detached from the request. Failures here are logged and counted,
//! never surfaced to the caller - the decision already went out.

use crate::{DecisionKind, SideEffectInputs};
use aim_alerts::{derive_severity, run_anomaly_scan, AlertEngine, AnomalyBaselines};
use aim_storage::ControlPlaneStore;
use aim_types::RiskLevel;
use aim_webhook::WebhookDispatcher;
use std::sync::Arc;

/// Execute the fan-out for one decision.
pub async fn run(
    store: Arc<dyn ControlPlaneStore>,
    alerts: AlertEngine,
    webhooks: WebhookDispatcher,
    baselines: AnomalyBaselines,
    inputs: SideEffectInputs,
) {
    let denied = inputs.kind == DecisionKind::Denied;
    let medium_or_higher = !inputs.action_class.is_low_risk()
        || inputs.explicit_risk.map_or(false, |risk| risk >= RiskLevel::Medium);

    let should_alert = (denied && medium_or_higher)
        || (inputs.capability_violation && medium_or_higher)
        || inputs.policy_alert;

    if should_alert {
        let severity = derive_severity(inputs.action_class, inputs.explicit_risk);
        let (alert_type, title) = if inputs.capability_violation {
            (
                "security_breach",
                format!("Capability violation: `{}`", inputs.action),
            )
        } else if denied {
            ("action_denied", format!("Denied action: `{}`", inputs.action))
        } else {
            ("policy_match", format!("Policy alert: `{}`", inputs.action))
        };
        if let Err(error) = alerts
            .create(
                inputs.ctx.organization_id,
                alert_type,
                severity,
                title,
                inputs
                    .reason
                    .clone()
                    .unwrap_or_else(|| "policy requested an alert".to_string()),
                Some("agent".to_string()),
                Some(inputs.agent.id.to_string()),
            )
            .await
        {
            tracing::warn!(%error, "decision alert creation failed");
            metrics::counter!("aim_side_effect_failures_total").increment(1);
        }
    }

    let decision = match inputs.kind {
        DecisionKind::Approved => "approved",
        DecisionKind::Denied => "denied",
        DecisionKind::PendingApproval => "pending",
    };
    if let Err(error) = webhooks
        .publish(
            inputs.ctx.organization_id,
            "verification.decided",
            serde_json::json!({
                "agent_id": inputs.agent.id,
                "agent_name": inputs.agent.name,
                "action": inputs.action,
                "decision": decision,
                "reason": inputs.reason,
            }),
        )
        .await
    {
        tracing::warn!(%error, "decision webhook publish failed");
        metrics::counter!("aim_side_effect_failures_total").increment(1);
    }

    // Anomaly detection runs last, on its own deadline, against copied ids.
    run_anomaly_scan(store, alerts, inputs.ctx, inputs.agent.id, baselines).await;
}
