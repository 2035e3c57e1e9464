//! Decision-confidence scoring.
//!
//! `0.3 * signature_ok + 0.3 * key_match + 0.2 * status_bonus + 0.2 * trust`,
//! halved when the final result is a denial.

use aim_types::{Agent, AgentStatus};

fn status_bonus(agent: &Agent) -> f64 {
    match agent.status {
        AgentStatus::Verified => 1.0,
        AgentStatus::Pending => 0.5,
        AgentStatus::Suspended | AgentStatus::Compromised => 0.0,
    }
}

/// Compute the confidence attached to a verification event.
pub fn decision_confidence(
    signature_ok: bool,
    key_match: bool,
    agent: &Agent,
    trust_score: f64,
    denied: bool,
) -> f64 {
    let mut confidence = 0.3 * f64::from(signature_ok as u8)
        + 0.3 * f64::from(key_match as u8)
        + 0.2 * status_bonus(agent)
        + 0.2 * trust_score.clamp(0.0, 1.0);
    if denied {
        confidence *= 0.5;
    }
    confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_types::{AgentId, OrganizationId};
    use chrono::Utc;

    fn agent(status: AgentStatus, trust: f64) -> Agent {
        Agent {
            id: AgentId::generate(),
            organization_id: OrganizationId::generate(),
            name: "a".to_string(),
            display_name: "A".to_string(),
            status,
            public_key: "pk".to_string(),
            api_key_hash: None,
            previous_public_key: None,
            key_created_at: Utc::now(),
            key_expires_at: None,
            key_rotation_grace_until: None,
            rotation_count: 0,
            trust_score: trust,
            capability_violation_count: 0,
            is_compromised: false,
            talks_to: vec![],
            last_active: None,
            created_by: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    #[test]
    fn clean_approval_scores_high() {
        let agent = agent(AgentStatus::Verified, 0.8);
        let confidence = decision_confidence(true, true, &agent, 0.8, false);
        assert!((confidence - 0.96).abs() < 1e-9);
    }

    #[test]
    fn key_mismatch_denial_scores_near_point_two() {
        // Forged key: no signature, no key match; verified agent with 0.8
        // trust, denied result halves the remainder.
        let agent = agent(AgentStatus::Verified, 0.8);
        let confidence = decision_confidence(false, false, &agent, 0.8, true);
        assert!((confidence - 0.18).abs() < 1e-9);
    }

    #[test]
    fn denial_halves_confidence() {
        let agent = agent(AgentStatus::Verified, 1.0);
        let approved = decision_confidence(true, true, &agent, 1.0, false);
        let denied = decision_confidence(true, true, &agent, 1.0, true);
        assert!((approved - 2.0 * denied).abs() < 1e-9);
    }
}
