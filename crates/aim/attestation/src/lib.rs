//! AIM Attestation - MCP confidence engine (C5).
//!
//! Only a verified, non-compromised agent may attest. A valid attestation
//! folds into the server's rolling confidence (EWMA, alpha 0.2); a
//! capability diff against the server's declared set applies a fixed drift
//! penalty, raises a warning alert and notifies `mcp.drift_detected`
//! subscribers.

#![deny(unsafe_code)]

use aim_alerts::AlertEngine;
use aim_crypto::{verify_attestation_signature, SignatureError};
use aim_storage::{
    AgentStore, AttestationStore, ControlPlaneStore, QueryWindow, StorageError, StorageResult,
};
use aim_types::{
    AgentId, AgentMcpConnection, AlertSeverity, AttestationId, McpAttestation, McpServer,
    McpServerId, McpVerificationStatus, OrganizationId,
};
use aim_webhook::WebhookDispatcher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// EWMA smoothing factor for confidence updates.
const CONFIDENCE_ALPHA: f64 = 0.2;

/// Fixed confidence penalty when reported capabilities drift from the
/// declared set.
const DRIFT_PENALTY: f64 = 0.1;

#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("mcp server not found")]
    McpNotFound,

    #[error("agent not found")]
    AgentNotFound,

    #[error("agent is not eligible to attest: {0}")]
    AgentNotEligible(String),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One accepted attestation's effect.
#[derive(Clone, Debug)]
pub struct AttestationOutcome {
    pub attestation: McpAttestation,
    pub confidence: f64,
    pub attestation_count: i64,
    /// Declared capabilities the agent did not observe, and vice versa.
    pub drift: Option<CapabilityDrift>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct CapabilityDrift {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// The fields an agent submits when attesting an MCP server.
#[derive(Clone, Debug)]
pub struct AttestationSubmission {
    pub agent_id: AgentId,
    pub capabilities_found: Vec<String>,
    pub connection_latency_ms: i64,
    pub signed_at: DateTime<Utc>,
    pub signature: String,
}

/// Attestation engine over the control-plane store.
#[derive(Clone)]
pub struct AttestationEngine {
    store: Arc<dyn ControlPlaneStore>,
    alerts: AlertEngine,
    webhooks: WebhookDispatcher,
}

impl AttestationEngine {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        alerts: AlertEngine,
        webhooks: WebhookDispatcher,
    ) -> Self {
        Self {
            store,
            alerts,
            webhooks,
        }
    }

    /// Verify and record an attestation, returning the server's updated
    /// confidence and count.
    pub async fn attest(
        &self,
        organization_id: &OrganizationId,
        mcp_server_id: &McpServerId,
        submission: AttestationSubmission,
    ) -> Result<AttestationOutcome, AttestationError> {
        let server = self
            .store
            .get_mcp_server_scoped(organization_id, mcp_server_id)
            .await?
            .ok_or(AttestationError::McpNotFound)?;
        let agent = self
            .store
            .get_agent_scoped(organization_id, &submission.agent_id)
            .await?
            .ok_or(AttestationError::AgentNotFound)?;

        if agent.is_compromised {
            return Err(AttestationError::AgentNotEligible(
                "agent is flagged compromised".to_string(),
            ));
        }
        if agent.status != aim_types::AgentStatus::Verified {
            return Err(AttestationError::AgentNotEligible(format!(
                "agent status is {}",
                agent.status.as_str()
            )));
        }

        let now = Utc::now();
        let attestation = McpAttestation {
            id: AttestationId::generate(),
            mcp_server_id: server.id,
            agent_id: agent.id,
            capabilities_found: submission.capabilities_found,
            connection_latency_ms: submission.connection_latency_ms,
            signed_at: submission.signed_at,
            signature: submission.signature,
            verified: true,
            created_at: now,
        };
        verify_attestation_signature(&agent, &attestation, now)?;

        let drift = capability_drift(&server, &attestation.capabilities_found);
        let (penalty, status) = if drift.is_some() {
            (DRIFT_PENALTY, McpVerificationStatus::Drifted)
        } else {
            (0.0, McpVerificationStatus::Attested)
        };

        let (confidence, attestation_count) = self
            .store
            .apply_attestation(
                attestation.clone(),
                1.0,
                penalty,
                CONFIDENCE_ALPHA,
                status,
                now,
            )
            .await?;

        tracing::info!(
            mcp = %server.id,
            agent_id = %agent.id,
            confidence,
            drifted = drift.is_some(),
            "attestation recorded"
        );

        if let Some(drift) = &drift {
            if let Err(error) = self
                .alerts
                .create(
                    *organization_id,
                    "mcp_drift",
                    AlertSeverity::Warning,
                    format!("Capability drift on MCP `{}`", server.name),
                    format!(
                        "attested capabilities diverge from the declared set \
                         (missing: [{}], unexpected: [{}])",
                        drift.missing.join(", "),
                        drift.unexpected.join(", ")
                    ),
                    Some("mcp_server".to_string()),
                    Some(server.id.to_string()),
                )
                .await
            {
                tracing::warn!(%error, "drift alert creation failed");
            }
            if let Err(error) = self
                .webhooks
                .publish(
                    *organization_id,
                    "mcp.drift_detected",
                    serde_json::json!({
                        "mcp_server_id": server.id,
                        "agent_id": agent.id,
                        "declared": server.capabilities,
                        "found": attestation.capabilities_found,
                        "diff": drift,
                        "confidence": confidence,
                    }),
                )
                .await
            {
                tracing::warn!(%error, "drift webhook publish failed");
            }
        }

        if let Err(error) = self
            .webhooks
            .publish(
                *organization_id,
                "mcp.attested",
                serde_json::json!({
                    "mcp_server_id": server.id,
                    "agent_id": agent.id,
                    "confidence": confidence,
                    "attestation_count": attestation_count,
                }),
            )
            .await
        {
            tracing::warn!(%error, "attestation webhook publish failed");
        }

        Ok(AttestationOutcome {
            attestation,
            confidence,
            attestation_count,
            drift,
        })
    }

    pub async fn list_attestations(
        &self,
        organization_id: &OrganizationId,
        mcp_server_id: &McpServerId,
        window: QueryWindow,
    ) -> Result<Vec<McpAttestation>, AttestationError> {
        self.store
            .get_mcp_server_scoped(organization_id, mcp_server_id)
            .await?
            .ok_or(AttestationError::McpNotFound)?;
        Ok(self.store.list_attestations(mcp_server_id, window).await?)
    }

    pub async fn connected_agents(
        &self,
        organization_id: &OrganizationId,
        mcp_server_id: &McpServerId,
    ) -> Result<Vec<AgentMcpConnection>, AttestationError> {
        self.store
            .get_mcp_server_scoped(organization_id, mcp_server_id)
            .await?
            .ok_or(AttestationError::McpNotFound)?;
        Ok(self.store.connected_agents(mcp_server_id).await?)
    }
}

/// Compare found capabilities against the declared set.
fn capability_drift(server: &McpServer, found: &[String]) -> Option<CapabilityDrift> {
    let missing: Vec<String> = server
        .capabilities
        .iter()
        .filter(|declared| !found.contains(declared))
        .cloned()
        .collect();
    let unexpected: Vec<String> = found
        .iter()
        .filter(|capability| !server.capabilities.contains(capability))
        .cloned()
        .collect();
    if missing.is_empty() && unexpected.is_empty() {
        None
    } else {
        Some(CapabilityDrift { missing, unexpected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_crypto::{canonical_attestation_payload, generate_keypair, sign_payload};
    use aim_storage::{AlertStore, MemoryStore, NewAgent, NewMcpServer};
    use aim_trust::TrustService;
    use aim_types::AgentStatus;
    use chrono::Duration;

    struct Fixture {
        engine: AttestationEngine,
        store: Arc<MemoryStore>,
        org: OrganizationId,
        agent_id: AgentId,
        server_id: McpServerId,
        keypair: aim_crypto::Keypair,
    }

    async fn fixture(declared: Vec<&str>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let org = OrganizationId::generate();
        let keypair = generate_keypair();
        let agent = store
            .create_agent(NewAgent {
                organization_id: org,
                name: "attester".to_string(),
                display_name: "Attester".to_string(),
                public_key: keypair.public_key.clone(),
                api_key_hash: None,
                talks_to: vec![],
                created_by: None,
            })
            .await
            .unwrap();
        store
            .update_agent_status(&agent.id, AgentStatus::Verified)
            .await
            .unwrap();
        let server = store
            .create_mcp_server(NewMcpServer {
                organization_id: org,
                name: "files".to_string(),
                url: "https://mcp.example.com".to_string(),
                capabilities: declared.into_iter().map(String::from).collect(),
                created_by: None,
            })
            .await
            .unwrap();

        let shared: Arc<dyn ControlPlaneStore> = store.clone();
        let trust = TrustService::new(shared.clone());
        let alerts = AlertEngine::new(shared.clone(), trust);
        let webhooks = WebhookDispatcher::start(shared.clone());
        Fixture {
            engine: AttestationEngine::new(shared, alerts, webhooks),
            store,
            org,
            agent_id: agent.id,
            server_id: server.id,
            keypair,
        }
    }

    fn signed_submission(
        fixture: &Fixture,
        capabilities: Vec<&str>,
        signed_at: DateTime<Utc>,
    ) -> AttestationSubmission {
        let capabilities: Vec<String> = capabilities.into_iter().map(String::from).collect();
        let payload = canonical_attestation_payload(
            &fixture.server_id.to_string(),
            &fixture.agent_id.to_string(),
            &capabilities,
            12,
            signed_at,
        )
        .unwrap();
        AttestationSubmission {
            agent_id: fixture.agent_id,
            capabilities_found: capabilities,
            connection_latency_ms: 12,
            signed_at,
            signature: sign_payload(&fixture.keypair.private_key, &payload).unwrap(),
        }
    }

    #[tokio::test]
    async fn clean_attestation_raises_confidence() {
        let fixture = fixture(vec!["read_files"]).await;
        let submission = signed_submission(&fixture, vec!["read_files"], Utc::now());
        let outcome = fixture
            .engine
            .attest(&fixture.org, &fixture.server_id, submission)
            .await
            .unwrap();
        assert!(outcome.drift.is_none());
        assert_eq!(outcome.attestation_count, 1);
        // 0.5 * 0.8 + 1.0 * 0.2 = 0.6
        assert!((outcome.confidence - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn drift_applies_penalty_and_alerts() {
        let fixture = fixture(vec!["read_files", "execute_code"]).await;
        let submission = signed_submission(&fixture, vec!["read_files"], Utc::now());
        let outcome = fixture
            .engine
            .attest(&fixture.org, &fixture.server_id, submission)
            .await
            .unwrap();
        let drift = outcome.drift.expect("drift detected");
        assert_eq!(drift.missing, vec!["execute_code".to_string()]);
        // EWMA 0.6 minus the 0.1 penalty.
        assert!((outcome.confidence - 0.5).abs() < 1e-9);

        let alerts = fixture
            .store
            .list_alerts(
                &fixture.org,
                &aim_storage::AlertFilter::default(),
                QueryWindow::default(),
            )
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "mcp_drift");
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[tokio::test]
    async fn stale_attestation_is_rejected() {
        let fixture = fixture(vec!["read_files"]).await;
        let submission = signed_submission(
            &fixture,
            vec!["read_files"],
            Utc::now() - Duration::seconds(300),
        );
        let result = fixture
            .engine
            .attest(&fixture.org, &fixture.server_id, submission)
            .await;
        assert!(matches!(
            result,
            Err(AttestationError::Signature(SignatureError::StaleAttestation))
        ));
    }

    #[tokio::test]
    async fn unverified_agent_cannot_attest() {
        let fixture = fixture(vec!["read_files"]).await;
        fixture
            .store
            .update_agent_status(&fixture.agent_id, AgentStatus::Pending)
            .await
            .unwrap();
        let submission = signed_submission(&fixture, vec!["read_files"], Utc::now());
        let result = fixture
            .engine
            .attest(&fixture.org, &fixture.server_id, submission)
            .await;
        assert!(matches!(result, Err(AttestationError::AgentNotEligible(_))));
    }
}
