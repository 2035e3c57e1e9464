//! AIM Decider - the action-verification pipeline (C6).
//!
//! One place composes crypto, capability, policy and trust into a decision:
//!
//! 1. agent status gate (suspended/compromised rejected before anything)
//! 2. signature verification - failures still persist a failed event
//! 3. action-adjusted trust against the class threshold
//! 4. capability check, with capability-violation policy enforcement
//! 5. remaining policies, first blocking match wins
//! 6. compiled-in critical actions always go to human approval
//! 7. high-risk actions below 0.9 trust go to human approval
//! 8. confidence scoring and asynchronous side-effect fan-out

#![deny(unsafe_code)]

pub mod confidence;
pub mod effects;

pub use confidence::decision_confidence;

use aim_alerts::{AlertEngine, AnomalyBaselines};
use aim_capability::CapabilityService;
use aim_crypto::{verify_signed_request, SignatureError};
use aim_policy::PolicyInput;
use aim_storage::{
    AgentStore, AlertStore, AuditStore, CapabilityStore, ControlPlaneStore, PolicyStore,
    StorageError, VerificationEventStore,
};
use aim_trust::action_adjusted_trust;
use aim_types::{
    is_critical_action, ActionRiskClass, Agent, AgentStatus, AuditAppend, CapabilityViolation,
    PolicyType, Protocol, RiskLevel, SignedActionRequest, TaskContext, UserId, VerificationEvent,
    VerificationId, VerificationOutcome, VerificationStatus, VerificationType,
};
use aim_webhook::WebhookDispatcher;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// How long an approval stays actionable before the caller should re-verify.
const APPROVAL_TTL_HOURS: i64 = 24;

/// High-risk actions need at least this much base trust to skip review.
const HIGH_RISK_AUTO_APPROVE_TRUST: f64 = 0.9;

/// What the pipeline decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionKind {
    Approved,
    Denied,
    PendingApproval,
}

/// Transport-level caller details carried into audit rows.
#[derive(Clone, Debug, Default)]
pub struct CallerInfo {
    pub user_id: Option<UserId>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// A completed decision, ready for the HTTP layer.
#[derive(Clone, Debug)]
pub struct DecisionOutcome {
    pub kind: DecisionKind,
    pub reason: Option<String>,
    pub event: VerificationEvent,
    /// Handle the agent quotes when reporting the action's actual outcome.
    pub audit_id: Uuid,
    pub trust_score: f64,
    pub confidence: f64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("agent not found")]
    AgentNotFound,

    #[error("agent is {0}")]
    AgentInactive(&'static str),

    /// Signature failures persist a failed event before surfacing.
    #[error("signature_verification_failed: {source}")]
    Signature {
        source: SignatureError,
        event_id: VerificationId,
    },

    #[error("event not found")]
    EventNotFound,

    #[error("audit id does not match this event")]
    AuditMismatch,

    #[error("event is already terminal")]
    AlreadyDecided,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The verification decider.
#[derive(Clone)]
pub struct Decider {
    store: Arc<dyn ControlPlaneStore>,
    capabilities: CapabilityService,
    alerts: AlertEngine,
    webhooks: WebhookDispatcher,
    baselines: AnomalyBaselines,
    /// Lookback for the unusual-activity rate, minutes.
    activity_window_minutes: i64,
}

impl Decider {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        capabilities: CapabilityService,
        alerts: AlertEngine,
        webhooks: WebhookDispatcher,
    ) -> Self {
        Self {
            store,
            capabilities,
            alerts,
            webhooks,
            baselines: AnomalyBaselines::default(),
            activity_window_minutes: 15,
        }
    }

    /// Decide a signed verification request.
    pub async fn decide(
        &self,
        request: &SignedActionRequest,
        caller: &CallerInfo,
    ) -> Result<DecisionOutcome, DecisionError> {
        let started_at = Utc::now();
        let agent = self
            .store
            .get_agent(&request.agent_id)
            .await?
            .ok_or(DecisionError::AgentNotFound)?;

        // Suspended and compromised agents are cut off before any
        // capability or policy work happens.
        if !agent.status.can_act() {
            let event = self
                .persist_terminal_event(
                    &agent,
                    request,
                    started_at,
                    Some("agent_inactive"),
                    Some(format!("agent is {}", agent.status.as_str())),
                    0.0,
                    Uuid::new_v4(),
                )
                .await?;
            self.audit_decision(&agent, request, &event, caller, "verification.rejected")
                .await?;
            let status: &'static str = match agent.status {
                AgentStatus::Compromised => "compromised",
                _ => "suspended",
            };
            return Err(DecisionError::AgentInactive(status));
        }

        let now = Utc::now();
        if let Err(source) = verify_signed_request(&agent, request, now) {
            // Failed-signature requests are security signal: the event is
            // persisted for intrusion detection before the 401 goes out.
            let key_match = !matches!(source, SignatureError::KeyMismatch);
            let confidence =
                decision_confidence(false, key_match, &agent, agent.trust_score, true);
            let audit_id = Uuid::new_v4();
            let event = self
                .persist_terminal_event(
                    &agent,
                    request,
                    started_at,
                    Some(signature_error_code(&source)),
                    Some(source.to_string()),
                    confidence,
                    audit_id,
                )
                .await?;
            self.audit_decision(&agent, request, &event, caller, "verification.signature_failed")
                .await?;
            self.spawn_side_effects(SideEffectInputs {
                action: request.action_type.clone(),
                action_class: ActionRiskClass::classify(&request.action_type),
                explicit_risk: explicit_risk(request),
                kind: DecisionKind::Denied,
                reason: Some("invalid_signature".to_string()),
                policy_alert: false,
                capability_violation: false,
                ctx: TaskContext {
                    organization_id: agent.organization_id,
                    agent_id: Some(agent.id),
                    trigger: "signature_failure".to_string(),
                },
                agent,
            });
            return Err(DecisionError::Signature {
                source,
                event_id: event.id,
            });
        }

        // Everything the policy rules may look at, gathered once.
        let action_class = ActionRiskClass::classify(&request.action_type);
        let explicit_risk = explicit_risk(request);
        let resource = request.normalized_resource();
        let has_capability = self
            .capabilities
            .has_capability(&agent.id, &request.action_type, resource, &request.context)
            .await?;
        let grants = self.store.list_grants(&agent.id, true).await?;
        let granted_types: Vec<String> = grants
            .iter()
            .map(|grant| grant.capability_type.clone())
            .collect();
        let recent = self
            .store
            .count_agent_events_since(
                &agent.id,
                now - Duration::minutes(self.activity_window_minutes),
            )
            .await?;
        let payload_bytes = resource.map_or(0, |r| r.len() as u64)
            + serde_json::to_string(&request.context)
                .map(|s| s.len() as u64)
                .unwrap_or(0);
        let policies = self
            .store
            .list_enabled_policies(&agent.organization_id)
            .await?;
        let policy_input = PolicyInput {
            agent: &agent,
            action_type: &request.action_type,
            action_class,
            resource,
            context: &request.context,
            has_capability,
            granted_capability_types: &granted_types,
            recent_event_count: recent,
            payload_bytes,
            now,
        };

        let effective_trust = action_adjusted_trust(agent.trust_score, action_class);
        let required_trust = action_class.required_trust();

        let mut policy_alert = false;
        let mut capability_violation = false;

        let (kind, reason) = if effective_trust < required_trust {
            (
                DecisionKind::Denied,
                Some("trust_below_threshold".to_string()),
            )
        } else {
            let mut denial: Option<String> = None;

            if !has_capability {
                capability_violation = true;
                let decision = aim_policy::evaluate_where(&policies, &policy_input, |ptype| {
                    ptype == PolicyType::CapabilityViolation
                });
                policy_alert |= decision.alert;
                match decision.matched_policy {
                    // An alert_only policy lets the request continue despite
                    // the missing grant; anything else denies.
                    Some(_) if !decision.block => {}
                    Some(_) => {
                        denial = Some(
                            decision
                                .reason
                                .map(|reason| format!("capability_not_granted: {reason}"))
                                .unwrap_or_else(|| "capability_not_granted".to_string()),
                        );
                    }
                    None => denial = Some("capability_not_granted".to_string()),
                }
            }

            if denial.is_none() {
                let decision = aim_policy::evaluate_where(&policies, &policy_input, |ptype| {
                    ptype != PolicyType::CapabilityViolation
                });
                policy_alert |= decision.alert;
                if decision.block {
                    denial = Some(
                        decision
                            .reason
                            .or(decision.matched_policy)
                            .map(|reason| format!("policy_violation: {reason}"))
                            .unwrap_or_else(|| "policy_violation".to_string()),
                    );
                }
            }

            match denial {
                Some(reason) => (DecisionKind::Denied, Some(reason)),
                None => match approval_gate(&request.action_type, action_class, &agent) {
                    Some(gate) => gate,
                    None => (DecisionKind::Approved, None),
                },
            }
        };

        let audit_id = Uuid::new_v4();
        let denied = kind == DecisionKind::Denied;
        let confidence = decision_confidence(true, true, &agent, agent.trust_score, denied);

        let (status, result) = match kind {
            // Approved events stay pending with the decision recorded; the
            // agent's result submission performs the single terminal
            // transition.
            DecisionKind::Approved => (
                VerificationStatus::Pending,
                Some(VerificationOutcome::Verified),
            ),
            DecisionKind::Denied => (
                VerificationStatus::Failed,
                Some(VerificationOutcome::Denied),
            ),
            DecisionKind::PendingApproval => (VerificationStatus::Pending, None),
        };

        let mut event = self.build_event(&agent, request, started_at, status, result, audit_id);
        event.confidence = confidence;
        if denied {
            let now = Utc::now();
            event.error_code = Some("denied".to_string());
            event.error_reason = reason.clone();
            event.completed_at = Some(now);
            event.duration_ms = Some((now - started_at).num_milliseconds());
        }
        let event = self.store.insert_event(event).await?;

        if capability_violation {
            self.store
                .insert_violation(CapabilityViolation {
                    id: Uuid::new_v4(),
                    organization_id: agent.organization_id,
                    agent_id: agent.id,
                    action: request.action_type.clone(),
                    resource: resource.map(str::to_string),
                    created_at: Utc::now(),
                })
                .await?;
            self.store.increment_violation_count(&agent.id).await?;
        }

        // Audit is synchronous and load-bearing: if it fails, the decision
        // does not leave the building.
        self.audit_decision(&agent, request, &event, caller, "verification.decided")
            .await?;

        // The agent was active, whatever we decided.
        if let Err(error) = self.store.touch_last_active(&agent.id, Utc::now()).await {
            tracing::warn!(%error, "last_active bump failed");
        }

        self.spawn_side_effects(SideEffectInputs {
            action: request.action_type.clone(),
            action_class,
            explicit_risk,
            kind,
            reason: reason.clone(),
            policy_alert,
            capability_violation,
            ctx: TaskContext {
                organization_id: agent.organization_id,
                agent_id: Some(agent.id),
                trigger: "verification".to_string(),
            },
            agent: agent.clone(),
        });

        tracing::info!(
            agent_id = %agent.id,
            action = %request.action_type,
            decision = ?kind,
            confidence,
            "verification decided"
        );

        Ok(DecisionOutcome {
            kind,
            reason,
            audit_id,
            trust_score: agent.trust_score,
            confidence,
            expires_at: (kind == DecisionKind::Approved)
                .then(|| Utc::now() + Duration::hours(APPROVAL_TTL_HOURS)),
            event,
        })
    }

    /// Agent reports the actual outcome of an approved action.
    pub async fn submit_result(
        &self,
        event_id: &VerificationId,
        audit_id: Uuid,
        success: bool,
        metadata: serde_json::Value,
        caller: &CallerInfo,
    ) -> Result<VerificationEvent, DecisionError> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(DecisionError::EventNotFound)?;
        if event.meta().audit_id != Some(audit_id) {
            return Err(DecisionError::AuditMismatch);
        }
        if event.status.is_terminal() {
            return Err(DecisionError::AlreadyDecided);
        }

        let (status, result) = if success {
            (
                VerificationStatus::Success,
                event.result.unwrap_or(VerificationOutcome::Verified),
            )
        } else {
            (
                VerificationStatus::Failed,
                event.result.unwrap_or(VerificationOutcome::Denied),
            )
        };
        let updated = self
            .store
            .complete_event(event_id, status, result, None, None, Utc::now())
            .await
            .map_err(|error| match error {
                StorageError::InvariantViolation(_) => DecisionError::AlreadyDecided,
                other => DecisionError::Storage(other),
            })?;

        self.store
            .append_audit(AuditAppend {
                organization_id: event.organization_id,
                user_id: caller.user_id,
                action: "verification.result_submitted".to_string(),
                entity_type: "verification_event".to_string(),
                entity_id: event.id.to_string(),
                ip: caller.ip.clone(),
                user_agent: caller.user_agent.clone(),
                metadata,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(updated)
    }

    /// Admin adjudication of a pending event.
    pub async fn adjudicate(
        &self,
        organization_id: &aim_types::OrganizationId,
        event_id: &VerificationId,
        approve: bool,
        reason: &str,
        caller: &CallerInfo,
    ) -> Result<VerificationEvent, DecisionError> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(DecisionError::EventNotFound)?;
        if &event.organization_id != organization_id {
            return Err(DecisionError::EventNotFound);
        }
        // Only events awaiting human review are adjudicable; approved events
        // waiting on their result submission already carry a decision.
        if event.status.is_terminal() || event.result.is_some() {
            return Err(DecisionError::AlreadyDecided);
        }

        let (status, result, error_code) = if approve {
            (
                VerificationStatus::Success,
                VerificationOutcome::Verified,
                None,
            )
        } else {
            (
                VerificationStatus::Failed,
                VerificationOutcome::Denied,
                Some("denied_by_admin".to_string()),
            )
        };
        let updated = self
            .store
            .complete_event(
                event_id,
                status,
                result,
                error_code,
                (!approve).then(|| reason.to_string()),
                Utc::now(),
            )
            .await
            .map_err(|error| match error {
                StorageError::InvariantViolation(_) => DecisionError::AlreadyDecided,
                other => DecisionError::Storage(other),
            })?;

        self.store
            .append_audit(AuditAppend {
                organization_id: event.organization_id,
                user_id: caller.user_id,
                action: if approve {
                    "verification.approved".to_string()
                } else {
                    "verification.denied".to_string()
                },
                entity_type: "verification_event".to_string(),
                entity_id: event.id.to_string(),
                ip: caller.ip.clone(),
                user_agent: caller.user_agent.clone(),
                metadata: serde_json::json!({ "reason": reason }),
                timestamp: Utc::now(),
            })
            .await?;

        let webhooks = self.webhooks.clone();
        let org = event.organization_id;
        let payload = serde_json::json!({
            "event_id": updated.id,
            "approved": approve,
            "reason": reason,
        });
        tokio::spawn(async move {
            if let Err(error) = webhooks
                .publish(org, "verification.adjudicated", payload)
                .await
            {
                tracing::warn!(%error, "adjudication webhook publish failed");
            }
        });
        Ok(updated)
    }

    fn build_event(
        &self,
        agent: &Agent,
        request: &SignedActionRequest,
        started_at: DateTime<Utc>,
        status: VerificationStatus,
        result: Option<VerificationOutcome>,
        audit_id: Uuid,
    ) -> VerificationEvent {
        let (resource_type, resource_id) = request.resource_parts();
        VerificationEvent {
            id: VerificationId::generate(),
            organization_id: agent.organization_id,
            agent_id: agent.id,
            protocol: Protocol::Mcp,
            verification_type: VerificationType::Capability,
            status,
            result,
            signature: Some(request.signature.clone()),
            public_key: Some(request.public_key.clone()),
            confidence: 0.0,
            duration_ms: None,
            error_code: None,
            error_reason: None,
            initiator_type: "agent".to_string(),
            action: request.action_type.clone(),
            resource_type,
            resource_id,
            started_at,
            completed_at: None,
            metadata: aim_types::VerificationEventMeta {
                agent_name: Some(agent.name.clone()),
                audit_id: Some(audit_id),
                resource: request.normalized_resource().map(str::to_string),
                mcp_server_id: None,
            }
            .to_value(),
        }
    }

    async fn persist_terminal_event(
        &self,
        agent: &Agent,
        request: &SignedActionRequest,
        started_at: DateTime<Utc>,
        error_code: Option<&str>,
        error_reason: Option<String>,
        confidence: f64,
        audit_id: Uuid,
    ) -> Result<VerificationEvent, DecisionError> {
        let mut event = self.build_event(
            agent,
            request,
            started_at,
            VerificationStatus::Failed,
            Some(VerificationOutcome::Denied),
            audit_id,
        );
        let now = Utc::now();
        event.confidence = confidence;
        event.error_code = error_code.map(str::to_string);
        event.error_reason = error_reason;
        event.completed_at = Some(now);
        event.duration_ms = Some((now - started_at).num_milliseconds());
        Ok(self.store.insert_event(event).await?)
    }

    async fn audit_decision(
        &self,
        agent: &Agent,
        request: &SignedActionRequest,
        event: &VerificationEvent,
        caller: &CallerInfo,
        action: &str,
    ) -> Result<(), DecisionError> {
        self.store
            .append_audit(AuditAppend {
                organization_id: agent.organization_id,
                user_id: caller.user_id,
                action: action.to_string(),
                entity_type: "verification_event".to_string(),
                entity_id: event.id.to_string(),
                ip: caller.ip.clone(),
                user_agent: caller.user_agent.clone(),
                metadata: serde_json::json!({
                    "agent_id": agent.id,
                    "action_type": request.action_type,
                    "status": event.status.as_str(),
                }),
                timestamp: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Fan out the asynchronous side effects. The task captures owned
    /// values and a [`TaskContext`] only; the request context is about to
    /// be dropped with the response.
    fn spawn_side_effects(&self, inputs: SideEffectInputs) {
        let store = self.store.clone();
        let alerts = self.alerts.clone();
        let webhooks = self.webhooks.clone();
        let baselines = self.baselines;
        tokio::spawn(async move {
            effects::run(store, alerts, webhooks, baselines, inputs).await;
        });
    }
}

/// Steps 6 and 7: mandatory human approval. `None` means auto-approve.
fn approval_gate(
    action_type: &str,
    action_class: ActionRiskClass,
    agent: &Agent,
) -> Option<(DecisionKind, Option<String>)> {
    if is_critical_action(action_type) {
        return Some((
            DecisionKind::PendingApproval,
            Some("critical_action_requires_approval".to_string()),
        ));
    }
    if action_class.is_high_risk() && agent.trust_score < HIGH_RISK_AUTO_APPROVE_TRUST {
        return Some((
            DecisionKind::PendingApproval,
            Some("high_risk_requires_approval".to_string()),
        ));
    }
    None
}

/// Owned inputs for the side-effect task.
#[derive(Clone, Debug)]
pub struct SideEffectInputs {
    pub agent: Agent,
    pub action: String,
    pub action_class: ActionRiskClass,
    pub explicit_risk: Option<RiskLevel>,
    pub kind: DecisionKind,
    pub reason: Option<String>,
    pub policy_alert: bool,
    pub capability_violation: bool,
    pub ctx: TaskContext,
}

fn explicit_risk(request: &SignedActionRequest) -> Option<RiskLevel> {
    request
        .risk_level
        .as_deref()
        .and_then(RiskLevel::parse)
        .or_else(|| {
            request
                .context
                .get("risk_level")
                .and_then(|value| value.as_str())
                .and_then(RiskLevel::parse)
        })
}

fn signature_error_code(error: &SignatureError) -> &'static str {
    match error {
        SignatureError::KeyMismatch => "key_mismatch",
        SignatureError::StaleTimestamp | SignatureError::MalformedTimestamp(_) => {
            "stale_timestamp"
        }
        SignatureError::StaleAttestation => "stale_attestation",
        _ => "signature_verification_failed",
    }
}
