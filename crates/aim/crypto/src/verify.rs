//! Signed-request verification (C1).
//!
//! Checks run in a fixed order and the most specific failure wins:
//! key match against the agent's registered keys, timestamp freshness,
//! then the Ed25519 verification itself.

use crate::canonical::{canonical_attestation_payload, canonical_request_payload};
use crate::keys::{decode_public_key, decode_signature};
use aim_types::{Agent, McpAttestation, SignedActionRequest};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::Verifier;
use thiserror::Error;

/// Replay window for request timestamps: exactly five minutes old is still
/// accepted, five minutes plus one millisecond is not.
const TIMESTAMP_WINDOW_SECS: i64 = 300;

/// Attestations must be strictly younger than five minutes.
const ATTESTATION_MAX_AGE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The presented public key is neither the agent's active key nor its
    /// previous key inside the rotation grace window.
    #[error("public key does not match a registered key for the agent")]
    KeyMismatch,

    #[error("request timestamp is outside the allowed window")]
    StaleTimestamp,

    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),

    #[error("malformed key or signature: {0}")]
    Malformed(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("attestation is older than the freshness window")]
    StaleAttestation,
}

/// Verify a signed action request against the agent's registered keys.
pub fn verify_signed_request(
    agent: &Agent,
    request: &SignedActionRequest,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    if !agent.accepts_key(&request.public_key, now) {
        return Err(SignatureError::KeyMismatch);
    }

    let timestamp = DateTime::parse_from_rfc3339(&request.timestamp)
        .map_err(|e| SignatureError::MalformedTimestamp(e.to_string()))?
        .with_timezone(&Utc);
    let skew = (now - timestamp).abs();
    if skew > Duration::seconds(TIMESTAMP_WINDOW_SECS) {
        return Err(SignatureError::StaleTimestamp);
    }

    let payload = canonical_request_payload(
        &request.agent_id.to_string(),
        &request.action_type,
        request.normalized_resource(),
        &request.context,
        &request.timestamp,
    )
    .map_err(|e| SignatureError::Malformed(e.to_string()))?;

    let verifying_key =
        decode_public_key(&request.public_key).map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let signature =
        decode_signature(&request.signature).map_err(|e| SignatureError::Malformed(e.to_string()))?;

    verifying_key
        .verify(&payload, &signature)
        .map_err(|_| SignatureError::InvalidSignature)
}

/// Verify an MCP attestation's signature and freshness against the
/// attesting agent's key.
pub fn verify_attestation_signature(
    agent: &Agent,
    attestation: &McpAttestation,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    if now - attestation.signed_at >= Duration::seconds(ATTESTATION_MAX_AGE_SECS) {
        return Err(SignatureError::StaleAttestation);
    }

    let payload = canonical_attestation_payload(
        &attestation.mcp_server_id.to_string(),
        &attestation.agent_id.to_string(),
        &attestation.capabilities_found,
        attestation.connection_latency_ms,
        attestation.signed_at,
    )
    .map_err(|e| SignatureError::Malformed(e.to_string()))?;

    let verifying_key =
        decode_public_key(&agent.public_key).map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let signature = decode_signature(&attestation.signature)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;

    verifying_key
        .verify(&payload, &signature)
        .map_err(|_| SignatureError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_keypair, sign_payload};
    use aim_types::{AgentId, AgentStatus, AttestationId, McpServerId, OrganizationId};
    use chrono::SecondsFormat;
    use std::collections::BTreeMap;

    fn agent_with_key(public_key: &str) -> Agent {
        Agent {
            id: AgentId::generate(),
            organization_id: OrganizationId::generate(),
            name: "test-agent".to_string(),
            display_name: "Test Agent".to_string(),
            status: AgentStatus::Verified,
            public_key: public_key.to_string(),
            api_key_hash: None,
            previous_public_key: None,
            key_created_at: Utc::now(),
            key_expires_at: None,
            key_rotation_grace_until: None,
            rotation_count: 0,
            trust_score: 0.8,
            capability_violation_count: 0,
            is_compromised: false,
            talks_to: vec![],
            last_active: None,
            created_by: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    fn signed_request(agent: &Agent, keypair: &crate::keys::Keypair, timestamp: DateTime<Utc>) -> SignedActionRequest {
        let timestamp = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        let payload = canonical_request_payload(
            &agent.id.to_string(),
            "read_database",
            Some("db://customers"),
            &BTreeMap::new(),
            &timestamp,
        )
        .unwrap();
        SignedActionRequest {
            agent_id: agent.id,
            action_type: "read_database".to_string(),
            resource: Some("db://customers".to_string()),
            context: BTreeMap::new(),
            timestamp,
            signature: sign_payload(&keypair.private_key, &payload).unwrap(),
            public_key: keypair.public_key.clone(),
            risk_level: None,
        }
    }

    #[test]
    fn valid_request_verifies() {
        let keypair = generate_keypair();
        let agent = agent_with_key(&keypair.public_key);
        let request = signed_request(&agent, &keypair, Utc::now());
        assert_eq!(verify_signed_request(&agent, &request, Utc::now()), Ok(()));
    }

    #[test]
    fn foreign_key_is_a_key_mismatch() {
        let keypair = generate_keypair();
        let other = generate_keypair();
        let agent = agent_with_key(&keypair.public_key);
        let mut request = signed_request(&agent, &keypair, Utc::now());
        request.public_key = other.public_key;
        assert_eq!(
            verify_signed_request(&agent, &request, Utc::now()),
            Err(SignatureError::KeyMismatch)
        );
    }

    #[test]
    fn forged_signature_fails_verification() {
        let keypair = generate_keypair();
        let forger = generate_keypair();
        let agent = agent_with_key(&keypair.public_key);
        let mut request = signed_request(&agent, &keypair, Utc::now());
        // Signature produced by a different keypair over the same payload.
        let payload = canonical_request_payload(
            &agent.id.to_string(),
            "read_database",
            Some("db://customers"),
            &BTreeMap::new(),
            &request.timestamp,
        )
        .unwrap();
        request.signature = sign_payload(&forger.private_key, &payload).unwrap();
        assert_eq!(
            verify_signed_request(&agent, &request, Utc::now()),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn timestamp_exactly_five_minutes_old_is_accepted() {
        let keypair = generate_keypair();
        let agent = agent_with_key(&keypair.public_key);
        let now = Utc::now();
        let request = signed_request(&agent, &keypair, now - Duration::seconds(300));
        assert_eq!(verify_signed_request(&agent, &request, now), Ok(()));
    }

    #[test]
    fn timestamp_past_the_window_is_stale() {
        let keypair = generate_keypair();
        let agent = agent_with_key(&keypair.public_key);
        let now = Utc::now();
        let request =
            signed_request(&agent, &keypair, now - Duration::seconds(300) - Duration::milliseconds(1));
        assert_eq!(
            verify_signed_request(&agent, &request, now),
            Err(SignatureError::StaleTimestamp)
        );
    }

    #[test]
    fn tampered_payload_fails() {
        let keypair = generate_keypair();
        let agent = agent_with_key(&keypair.public_key);
        let mut request = signed_request(&agent, &keypair, Utc::now());
        request.resource = Some("db://orders".to_string());
        assert_eq!(
            verify_signed_request(&agent, &request, Utc::now()),
            Err(SignatureError::InvalidSignature)
        );
    }

    fn attestation_signed_at(
        agent: &Agent,
        keypair: &crate::keys::Keypair,
        signed_at: DateTime<Utc>,
    ) -> McpAttestation {
        let mcp_server_id = McpServerId::generate();
        let capabilities = vec!["read_files".to_string()];
        let payload = canonical_attestation_payload(
            &mcp_server_id.to_string(),
            &agent.id.to_string(),
            &capabilities,
            12,
            signed_at,
        )
        .unwrap();
        McpAttestation {
            id: AttestationId::generate(),
            mcp_server_id,
            agent_id: agent.id,
            capabilities_found: capabilities,
            connection_latency_ms: 12,
            signed_at,
            signature: sign_payload(&keypair.private_key, &payload).unwrap(),
            verified: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn fresh_attestation_verifies() {
        let keypair = generate_keypair();
        let agent = agent_with_key(&keypair.public_key);
        let attestation = attestation_signed_at(&agent, &keypair, Utc::now());
        assert_eq!(
            verify_attestation_signature(&agent, &attestation, Utc::now()),
            Ok(())
        );
    }

    #[test]
    fn attestation_exactly_five_minutes_old_is_rejected() {
        let keypair = generate_keypair();
        let agent = agent_with_key(&keypair.public_key);
        let now = Utc::now();
        let attestation = attestation_signed_at(&agent, &keypair, now - Duration::seconds(300));
        assert_eq!(
            verify_attestation_signature(&agent, &attestation, now),
            Err(SignatureError::StaleAttestation)
        );
    }
}
