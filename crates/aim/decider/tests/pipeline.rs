//! End-to-end pipeline scenarios over the in-memory backend.

use aim_alerts::AlertEngine;
use aim_capability::CapabilityService;
use aim_crypto::{canonical_request_payload, generate_keypair, sign_payload, Keypair};
use aim_decider::{CallerInfo, Decider, DecisionError, DecisionKind};
use aim_storage::{
    AgentStore, AlertFilter, AlertStore, AuditStore, ControlPlaneStore, MemoryStore, NewAgent,
    QueryWindow, TrustStore, VerificationEventStore, VerificationFilter,
};
use aim_trust::TrustService;
use aim_types::{
    Agent, AgentStatus, AlertSeverity, OrganizationId, SignedActionRequest, TrustScoreHistory,
    VerificationOutcome, VerificationStatus,
};
use aim_webhook::WebhookDispatcher;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    decider: Decider,
    capabilities: CapabilityService,
    store: Arc<MemoryStore>,
    org: OrganizationId,
    agent: Agent,
    keypair: Keypair,
}

async fn fixture(trust: f64) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn ControlPlaneStore> = store.clone();
    let org = OrganizationId::generate();
    let keypair = generate_keypair();

    let agent = store
        .create_agent(NewAgent {
            organization_id: org,
            name: "reporting-agent".to_string(),
            display_name: "Reporting Agent".to_string(),
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
    store
        .record_trust_score(TrustScoreHistory {
            agent_id: agent.id,
            organization_id: org,
            score: trust,
            factors: Default::default(),
            weights: Default::default(),
            contributions: Default::default(),
            confidence: 1.0,
            recorded_at: Utc::now(),
            reason: "fixture".to_string(),
        })
        .await
        .unwrap();
    let agent = store.get_agent(&agent.id).await.unwrap().unwrap();

    let trust_service = TrustService::new(shared.clone());
    let alerts = AlertEngine::new(shared.clone(), trust_service);
    let webhooks = WebhookDispatcher::start(shared.clone());
    let capabilities = CapabilityService::new(shared.clone());
    let decider = Decider::new(shared, capabilities.clone(), alerts, webhooks);

    Fixture {
        decider,
        capabilities,
        store,
        org,
        agent,
        keypair,
    }
}

fn signed_request(fixture: &Fixture, action: &str, resource: Option<&str>) -> SignedActionRequest {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let context = BTreeMap::new();
    let payload = canonical_request_payload(
        &fixture.agent.id.to_string(),
        action,
        resource,
        &context,
        &timestamp,
    )
    .unwrap();
    SignedActionRequest {
        agent_id: fixture.agent.id,
        action_type: action.to_string(),
        resource: resource.map(str::to_string),
        context,
        timestamp,
        signature: sign_payload(&fixture.keypair.private_key, &payload).unwrap(),
        public_key: fixture.keypair.public_key.clone(),
        risk_level: None,
    }
}

async fn wait_for_alerts(fixture: &Fixture, expected: usize) -> Vec<aim_types::Alert> {
    for _ in 0..50 {
        let alerts = fixture
            .store
            .list_alerts(&fixture.org, &AlertFilter::default(), QueryWindow::default())
            .await
            .unwrap();
        if alerts.len() >= expected {
            return alerts;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {expected} alerts");
}

#[tokio::test]
async fn happy_path_read_is_approved() {
    let fixture = fixture(0.8).await;
    fixture
        .capabilities
        .grant(fixture.org, fixture.agent.id, "read_database", json!({}), None)
        .await
        .unwrap();

    let request = signed_request(
        &fixture,
        "read_database",
        Some("SELECT id FROM customers LIMIT 10"),
    );
    let outcome = fixture
        .decider
        .decide(&request, &CallerInfo::default())
        .await
        .unwrap();

    assert_eq!(outcome.kind, DecisionKind::Approved);
    assert!((outcome.trust_score - 0.8).abs() < 1e-9);
    assert!(outcome.expires_at.is_some());
    assert_eq!(outcome.event.result, Some(VerificationOutcome::Verified));

    // One audit row for the decision, agent activity bumped, no alert.
    let audit = fixture
        .store
        .list_audit(&fixture.org, QueryWindow::default())
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    let agent = fixture.store.get_agent(&fixture.agent.id).await.unwrap().unwrap();
    assert!(agent.last_active.is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let alerts = fixture
        .store
        .list_alerts(&fixture.org, &AlertFilter::default(), QueryWindow::default())
        .await
        .unwrap();
    assert!(alerts.is_empty());
}

#[tokio::test]
async fn missing_capability_denies_and_alerts() {
    let fixture = fixture(0.8).await;
    // No send_email grant.
    let request = signed_request(&fixture, "send_email", Some("mailto:ceo@example.com"));
    let outcome = fixture
        .decider
        .decide(&request, &CallerInfo::default())
        .await
        .unwrap();

    assert_eq!(outcome.kind, DecisionKind::Denied);
    assert!(outcome
        .reason
        .as_deref()
        .unwrap()
        .starts_with("capability_not_granted"));
    assert_eq!(outcome.event.status, VerificationStatus::Failed);
    assert_eq!(outcome.event.result, Some(VerificationOutcome::Denied));

    let alerts = wait_for_alerts(&fixture, 1).await;
    assert_eq!(alerts[0].alert_type, "security_breach");
    assert_eq!(alerts[0].severity, AlertSeverity::High);

    let violations = fixture
        .store
        .count_agent_violations_since(&fixture.agent.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(violations, 1);
    let agent = fixture.store.get_agent(&fixture.agent.id).await.unwrap().unwrap();
    assert_eq!(agent.capability_violation_count, 1);
}

#[tokio::test]
async fn critical_action_requires_human_approval() {
    let fixture = fixture(0.95).await;
    fixture
        .capabilities
        .grant(fixture.org, fixture.agent.id, "drop_database", json!({}), None)
        .await
        .unwrap();

    let request = signed_request(&fixture, "drop_database", Some("db://production"));
    let outcome = fixture
        .decider
        .decide(&request, &CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(outcome.kind, DecisionKind::PendingApproval);
    assert_eq!(outcome.event.status, VerificationStatus::Pending);
    assert_eq!(outcome.event.result, None);

    // Admin approves with a reason; event becomes success + verified.
    let approved = fixture
        .decider
        .adjudicate(
            &fixture.org,
            &outcome.event.id,
            true,
            "planned migration",
            &CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(approved.status, VerificationStatus::Success);
    assert_eq!(approved.result, Some(VerificationOutcome::Verified));

    // A second adjudication is rejected.
    let again = fixture
        .decider
        .adjudicate(
            &fixture.org,
            &outcome.event.id,
            false,
            "changed my mind",
            &CallerInfo::default(),
        )
        .await;
    assert!(matches!(again, Err(DecisionError::AlreadyDecided)));
}

#[tokio::test]
async fn forged_signature_persists_failed_event() {
    let fixture = fixture(0.8).await;
    fixture
        .capabilities
        .grant(fixture.org, fixture.agent.id, "read_database", json!({}), None)
        .await
        .unwrap();

    // Signature and key from a different keypair.
    let forger = generate_keypair();
    let mut request = signed_request(&fixture, "read_database", Some("db://customers"));
    let payload = canonical_request_payload(
        &fixture.agent.id.to_string(),
        &request.action_type,
        request.normalized_resource(),
        &request.context,
        &request.timestamp,
    )
    .unwrap();
    request.public_key = forger.public_key.clone();
    request.signature = sign_payload(&forger.private_key, &payload).unwrap();

    let result = fixture.decider.decide(&request, &CallerInfo::default()).await;
    let Err(DecisionError::Signature { event_id, .. }) = result else {
        panic!("expected a signature error");
    };

    let event = fixture.store.get_event(&event_id).await.unwrap().unwrap();
    assert_eq!(event.status, VerificationStatus::Failed);
    assert_eq!(event.result, Some(VerificationOutcome::Denied));
    assert_eq!(event.error_code.as_deref(), Some("key_mismatch"));
    // 0.2 * status_bonus + 0.2 * trust, halved by the denial.
    assert!((event.confidence - 0.18).abs() < 1e-9);
}

#[tokio::test]
async fn zero_trust_blocks_even_reads() {
    let fixture = fixture(0.0).await;
    fixture
        .capabilities
        .grant(fixture.org, fixture.agent.id, "read_database", json!({}), None)
        .await
        .unwrap();

    let request = signed_request(&fixture, "read_database", Some("db://customers"));
    let outcome = fixture
        .decider
        .decide(&request, &CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(outcome.kind, DecisionKind::Denied);
    assert_eq!(outcome.reason.as_deref(), Some("trust_below_threshold"));
}

#[tokio::test]
async fn result_submission_is_the_single_terminal_transition() {
    let fixture = fixture(0.8).await;
    fixture
        .capabilities
        .grant(fixture.org, fixture.agent.id, "read_database", json!({}), None)
        .await
        .unwrap();

    let request = signed_request(&fixture, "read_database", Some("db://customers"));
    let outcome = fixture
        .decider
        .decide(&request, &CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(outcome.event.status, VerificationStatus::Pending);

    // Wrong audit id is rejected.
    let wrong = fixture
        .decider
        .submit_result(
            &outcome.event.id,
            uuid::Uuid::new_v4(),
            true,
            json!({}),
            &CallerInfo::default(),
        )
        .await;
    assert!(matches!(wrong, Err(DecisionError::AuditMismatch)));

    let done = fixture
        .decider
        .submit_result(
            &outcome.event.id,
            outcome.audit_id,
            true,
            json!({"rows": 10}),
            &CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(done.status, VerificationStatus::Success);
    assert_eq!(done.result, Some(VerificationOutcome::Verified));
    assert!(done.completed_at.unwrap() >= done.started_at);

    // The transition is single-shot.
    let again = fixture
        .decider
        .submit_result(
            &outcome.event.id,
            outcome.audit_id,
            false,
            json!({}),
            &CallerInfo::default(),
        )
        .await;
    assert!(matches!(again, Err(DecisionError::AlreadyDecided)));
}

#[tokio::test]
async fn old_key_works_only_inside_the_rotation_grace_window() {
    let fixture = fixture(0.8).await;
    fixture
        .capabilities
        .grant(fixture.org, fixture.agent.id, "read_database", json!({}), None)
        .await
        .unwrap();

    // Rotate to a new key with an open grace window; the old key still
    // verifies.
    let replacement = generate_keypair();
    fixture
        .store
        .rotate_agent_keys(
            &fixture.agent.id,
            fixture.agent.version,
            &replacement.public_key,
            Utc::now() + chrono::Duration::hours(24),
            Utc::now(),
        )
        .await
        .unwrap();

    let request = signed_request(&fixture, "read_database", Some("db://customers"));
    let outcome = fixture
        .decider
        .decide(&request, &CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(outcome.kind, DecisionKind::Approved);

    // Close the grace window by rotating again from the current version;
    // the previous key is now the replacement key, and the original key is
    // no longer registered at all.
    let agent = fixture.store.get_agent(&fixture.agent.id).await.unwrap().unwrap();
    let latest = generate_keypair();
    fixture
        .store
        .rotate_agent_keys(
            &agent.id,
            agent.version,
            &latest.public_key,
            Utc::now() + chrono::Duration::hours(24),
            Utc::now(),
        )
        .await
        .unwrap();

    let request = signed_request(&fixture, "read_database", Some("db://customers"));
    let result = fixture.decider.decide(&request, &CallerInfo::default()).await;
    assert!(matches!(
        result,
        Err(DecisionError::Signature {
            source: aim_crypto::SignatureError::KeyMismatch,
            ..
        })
    ));
}

#[tokio::test]
async fn suspended_agent_is_rejected_before_capability_checks() {
    let fixture = fixture(0.9).await;
    fixture
        .store
        .update_agent_status(&fixture.agent.id, AgentStatus::Suspended)
        .await
        .unwrap();

    let request = signed_request(&fixture, "read_database", Some("db://customers"));
    let result = fixture.decider.decide(&request, &CallerInfo::default()).await;
    assert!(matches!(result, Err(DecisionError::AgentInactive(_))));

    let events = fixture
        .store
        .list_events(
            &VerificationFilter {
                organization_id: Some(fixture.org),
                ..Default::default()
            },
            QueryWindow::default(),
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].error_code.as_deref(), Some("agent_inactive"));
}
