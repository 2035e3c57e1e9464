//! HTTP surface tests over the in-memory backend.

use aim_crypto::{canonical_request_payload, generate_keypair, sign_payload, Keypair};
use aim_daemon::api::rest::{create_router, AppState};
use aim_daemon::DaemonConfig;
use aim_storage::{AgentStore, MemoryStore, TrustStore};
use aim_tokens::TokenSubject;
use aim_types::{OrganizationId, UserId, UserRole};
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: AppState,
    org: OrganizationId,
    admin_jwt: String,
}

fn test_app() -> TestApp {
    let state = AppState::build(Arc::new(MemoryStore::new()), DaemonConfig::default());
    let org = OrganizationId::generate();
    let admin = TokenSubject {
        user_id: UserId::generate(),
        organization_id: org,
        email: "admin@example.com".to_string(),
        role: UserRole::Admin,
    };
    let admin_jwt = state
        .tokens
        .issue_access_token(&admin, Duration::hours(1))
        .unwrap();
    TestApp {
        router: create_router(state.clone()),
        state,
        org,
        admin_jwt,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn create_agent(app: &TestApp, name: &str, keypair: &Keypair) -> (Value, String) {
    let request = Request::builder()
        .method("POST")
        .uri("/agents")
        .header(header::AUTHORIZATION, format!("Bearer {}", app.admin_jwt))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "name": name,
                "display_name": name,
                "public_key": keypair.public_key,
            })
            .to_string(),
        ))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::CREATED, "agent create failed: {body}");
    let api_key = body["api_key"].as_str().unwrap().to_string();
    (body["agent"].clone(), api_key)
}

fn signed_verification_body(
    agent_id: &str,
    keypair: &Keypair,
    action: &str,
    resource: Option<&str>,
) -> Value {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let context: BTreeMap<String, Value> = BTreeMap::new();
    let payload =
        canonical_request_payload(agent_id, action, resource, &context, &timestamp).unwrap();
    json!({
        "agent_id": agent_id,
        "action_type": action,
        "resource": resource,
        "context": {},
        "timestamp": timestamp,
        "signature": sign_payload(&keypair.private_key, &payload).unwrap(),
        "public_key": keypair.public_key,
    })
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app();
    let (status, body) = send(
        &app.router,
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn protected_routes_require_credentials() {
    let app = test_app();
    let (status, _) = send(
        &app.router,
        Request::builder()
            .uri("/agents")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn verification_happy_path_returns_201() {
    let app = test_app();
    let keypair = generate_keypair();
    let (agent, _) = create_agent(&app, "reporting-agent", &keypair).await;
    let agent_id = agent["id"].as_str().unwrap().to_string();

    // Verify the agent and give it the capability plus some trust.
    let typed_id = aim_types::AgentId::parse(&agent_id).unwrap();
    app.state
        .store
        .update_agent_status(&typed_id, aim_types::AgentStatus::Verified)
        .await
        .unwrap();
    app.state
        .store
        .record_trust_score(aim_types::TrustScoreHistory {
            agent_id: typed_id,
            organization_id: app.org,
            score: 0.8,
            factors: Default::default(),
            weights: Default::default(),
            contributions: Default::default(),
            confidence: 1.0,
            recorded_at: Utc::now(),
            reason: "test".to_string(),
        })
        .await
        .unwrap();
    app.state
        .capabilities
        .grant(app.org, typed_id, "read_database", json!({}), None)
        .await
        .unwrap();

    let body = signed_verification_body(
        &agent_id,
        &keypair,
        "read_database",
        Some("SELECT id FROM customers LIMIT 10"),
    );
    let (status, response) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/verifications")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED, "body: {response}");
    assert_eq!(response["status"], "approved");
    assert!((response["trust_score"].as_f64().unwrap() - 0.8).abs() < 1e-9);
    assert!(response["expires_at"].is_string());
    assert!(response["audit_id"].is_string());
}

#[tokio::test]
async fn capability_violation_returns_403_with_reason() {
    let app = test_app();
    let keypair = generate_keypair();
    let (agent, _) = create_agent(&app, "mailless-agent", &keypair).await;
    let agent_id = agent["id"].as_str().unwrap().to_string();
    let typed_id = aim_types::AgentId::parse(&agent_id).unwrap();
    app.state
        .store
        .update_agent_status(&typed_id, aim_types::AgentStatus::Verified)
        .await
        .unwrap();
    app.state
        .store
        .record_trust_score(aim_types::TrustScoreHistory {
            agent_id: typed_id,
            organization_id: app.org,
            score: 0.8,
            factors: Default::default(),
            weights: Default::default(),
            contributions: Default::default(),
            confidence: 1.0,
            recorded_at: Utc::now(),
            reason: "test".to_string(),
        })
        .await
        .unwrap();

    let body = signed_verification_body(&agent_id, &keypair, "send_email", None);
    let (status, response) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/verifications")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(response["reason"]
        .as_str()
        .unwrap()
        .starts_with("capability_not_granted"));
    assert!(response["audit_id"].is_string());
}

#[tokio::test]
async fn forged_signature_returns_401() {
    let app = test_app();
    let keypair = generate_keypair();
    let forger = generate_keypair();
    let (agent, _) = create_agent(&app, "target-agent", &keypair).await;
    let agent_id = agent["id"].as_str().unwrap().to_string();

    let body = signed_verification_body(&agent_id, &forger, "read_database", None);
    let (status, response) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/verifications")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "key_mismatch");
}

#[tokio::test]
async fn unknown_agent_returns_404() {
    let app = test_app();
    let keypair = generate_keypair();
    let body = signed_verification_body(
        &uuid::Uuid::new_v4().to_string(),
        &keypair,
        "read_database",
        None,
    );
    let (status, _) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/verifications")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_can_adjudicate_pending_critical_action() {
    let app = test_app();
    let keypair = generate_keypair();
    let (agent, _) = create_agent(&app, "ops-agent", &keypair).await;
    let agent_id = agent["id"].as_str().unwrap().to_string();
    let typed_id = aim_types::AgentId::parse(&agent_id).unwrap();
    app.state
        .store
        .update_agent_status(&typed_id, aim_types::AgentStatus::Verified)
        .await
        .unwrap();
    app.state
        .store
        .record_trust_score(aim_types::TrustScoreHistory {
            agent_id: typed_id,
            organization_id: app.org,
            score: 0.95,
            factors: Default::default(),
            weights: Default::default(),
            contributions: Default::default(),
            confidence: 1.0,
            recorded_at: Utc::now(),
            reason: "test".to_string(),
        })
        .await
        .unwrap();
    app.state
        .capabilities
        .grant(app.org, typed_id, "drop_database", json!({}), None)
        .await
        .unwrap();

    let body = signed_verification_body(&agent_id, &keypair, "drop_database", Some("db://prod"));
    let (status, response) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/verifications")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "pending");
    let verification_id = response["verification_id"].as_str().unwrap().to_string();

    // The event shows up in the pending queue.
    let (status, pending) = send(
        &app.router,
        Request::builder()
            .uri("/admin/verifications/pending")
            .header(header::AUTHORIZATION, format!("Bearer {}", app.admin_jwt))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["counts"]["pending"], 1);

    let (status, approved) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri(format!("/admin/verifications/{verification_id}/approve"))
            .header(header::AUTHORIZATION, format!("Bearer {}", app.admin_jwt))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"reason": "planned migration"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approved["status"], "success");
    assert_eq!(approved["result"], "verified");
}

#[tokio::test]
async fn viewer_cannot_mutate_and_non_admin_cannot_adjudicate() {
    let app = test_app();
    let viewer = TokenSubject {
        user_id: UserId::generate(),
        organization_id: app.org,
        email: "viewer@example.com".to_string(),
        role: UserRole::Viewer,
    };
    let viewer_jwt = app
        .state
        .tokens
        .issue_access_token(&viewer, Duration::hours(1))
        .unwrap();

    let (status, _) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/agents")
            .header(header::AUTHORIZATION, format!("Bearer {viewer_jwt}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"name": "x"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app.router,
        Request::builder()
            .uri("/admin/verifications/pending")
            .header(header::AUTHORIZATION, format!("Bearer {viewer_jwt}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn refresh_rotation_and_revoked_token_flow() {
    let app = test_app();
    let subject = TokenSubject {
        user_id: UserId::generate(),
        organization_id: app.org,
        email: "dev@example.com".to_string(),
        role: UserRole::Member,
    };
    let issued = app
        .state
        .tokens
        .issue_refresh_token(&subject, Some("laptop".to_string()), None)
        .await
        .unwrap();

    // Rotate: old token becomes unusable with 401 token_revoked.
    let (status, rotated) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/auth/refresh")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"refresh_token": issued.token}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(rotated["refresh_token"].is_string());

    let (status, body) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/auth/refresh")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"refresh_token": issued.token}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "token_revoked");

    // Recovery accepts the revoked token and keeps device metadata.
    let token_id = issued.record.id.to_string();
    let (status, recovered) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri(format!("/sdk-tokens/{token_id}/recover"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"refresh_token": issued.token}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(recovered["refresh_token"].is_string());
}

#[tokio::test]
async fn webhook_test_creates_exactly_one_delivery() {
    let app = test_app();
    let (status, created) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/webhooks")
            .header(header::AUTHORIZATION, format!("Bearer {}", app.admin_jwt))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "url": "https://hooks.example.com/aim",
                    "event_types": ["*"],
                })
                .to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(created["secret"].as_str().unwrap().starts_with("whsec_"));
    let webhook_id = created["webhook"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri(format!("/webhooks/{webhook_id}/test"))
            .header(header::AUTHORIZATION, format!("Bearer {}", app.admin_jwt))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, deliveries) = send(
        &app.router,
        Request::builder()
            .uri(format!("/webhooks/{webhook_id}/deliveries"))
            .header(header::AUTHORIZATION, format!("Bearer {}", app.admin_jwt))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deliveries.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn tenancy_hides_other_organizations() {
    let app = test_app();
    let keypair = generate_keypair();
    let (agent, _) = create_agent(&app, "tenant-a-agent", &keypair).await;
    let agent_id = agent["id"].as_str().unwrap().to_string();

    // An admin of a different organization cannot see the agent.
    let other_admin = TokenSubject {
        user_id: UserId::generate(),
        organization_id: OrganizationId::generate(),
        email: "other@example.com".to_string(),
        role: UserRole::Admin,
    };
    let other_jwt = app
        .state
        .tokens
        .issue_access_token(&other_admin, Duration::hours(1))
        .unwrap();
    let (status, _) = send(
        &app.router,
        Request::builder()
            .uri(format!("/agents/{agent_id}"))
            .header(header::AUTHORIZATION, format!("Bearer {other_jwt}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
