//! The factor model itself - pure computation over a snapshot.

use aim_types::{Agent, AgentStatus, TrustFactors, TrustScore, TrustWeights};
use chrono::Utc;

/// Hours in the 30-day uptime window.
const WINDOW_HOURS: f64 = 30.0 * 24.0;

/// Days after which the age factor saturates.
const AGE_SATURATION_DAYS: f64 = 180.0;

/// Alerts in the window that zero out the security-alerts factor.
const ALERT_SATURATION: f64 = 10.0;

/// Observed data backing the factors.
#[derive(Clone, Debug)]
pub struct TrustInputs {
    pub status: AgentStatus,
    pub attempts: i64,
    pub successes: i64,
    pub active_hours: i64,
    pub alerts_last_window: i64,
    pub policy_checks: i64,
    pub policy_passes: i64,
    pub days_since_creation: f64,
    pub drift_events: i64,
    pub drift_threshold: i64,
    /// Normalized average operator rating, when any exists.
    pub feedback: Option<f64>,
}

/// Compute the weighted score. Factors without observed data sit at the
/// neutral 0.5 and lower the confidence instead of skewing the score.
pub fn compute(
    agent: &Agent,
    inputs: &TrustInputs,
    weights: TrustWeights,
    reason: &str,
) -> TrustScore {
    let mut observed = 0u32;
    let mut considered = 0u32;
    let mut track = |has_data: bool| {
        considered += 1;
        if has_data {
            observed += 1;
        }
    };

    let verification_status = if inputs.status == AgentStatus::Verified {
        1.0
    } else {
        0.0
    };
    track(true);

    let uptime = clamp(inputs.active_hours as f64 / WINDOW_HOURS);
    track(inputs.attempts > 0);

    let success_rate = if inputs.attempts > 0 {
        clamp(inputs.successes as f64 / inputs.attempts as f64)
    } else {
        0.5
    };
    track(inputs.attempts > 0);

    let security_alerts = clamp(1.0 - (inputs.alerts_last_window as f64 / ALERT_SATURATION).min(1.0));
    track(true);

    let compliance = if inputs.policy_checks > 0 {
        clamp(inputs.policy_passes as f64 / inputs.policy_checks as f64)
    } else {
        1.0
    };
    track(inputs.policy_checks > 0);

    let age = clamp(inputs.days_since_creation / AGE_SATURATION_DAYS);
    track(true);

    let drift_detection = if inputs.drift_threshold > 0 {
        clamp(1.0 - inputs.drift_events as f64 / inputs.drift_threshold as f64)
    } else {
        1.0
    };
    track(true);

    let user_feedback = inputs.feedback.map_or(0.5, clamp);
    track(inputs.feedback.is_some());

    let factors = TrustFactors {
        verification_status,
        uptime,
        success_rate,
        security_alerts,
        compliance,
        age,
        drift_detection,
        user_feedback,
    };

    let contributions = TrustFactors {
        verification_status: factors.verification_status * weights.verification_status,
        uptime: factors.uptime * weights.uptime,
        success_rate: factors.success_rate * weights.success_rate,
        security_alerts: factors.security_alerts * weights.security_alerts,
        compliance: factors.compliance * weights.compliance,
        age: factors.age * weights.age,
        drift_detection: factors.drift_detection * weights.drift_detection,
        user_feedback: factors.user_feedback * weights.user_feedback,
    };

    let score = clamp(
        contributions.verification_status
            + contributions.uptime
            + contributions.success_rate
            + contributions.security_alerts
            + contributions.compliance
            + contributions.age
            + contributions.drift_detection
            + contributions.user_feedback,
    );

    TrustScore {
        agent_id: agent.id,
        score,
        factors,
        weights,
        contributions,
        confidence: observed as f64 / considered as f64,
        calculated_at: Utc::now(),
        reason: reason.to_string(),
    }
}

fn clamp(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_types::{AgentId, OrganizationId};
    use proptest::prelude::*;

    fn agent(status: AgentStatus) -> Agent {
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
            trust_score: 0.5,
            capability_violation_count: 0,
            is_compromised: false,
            talks_to: vec![],
            last_active: None,
            created_by: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    fn baseline_inputs() -> TrustInputs {
        TrustInputs {
            status: AgentStatus::Verified,
            attempts: 100,
            successes: 95,
            active_hours: 360,
            alerts_last_window: 0,
            policy_checks: 100,
            policy_passes: 100,
            days_since_creation: 180.0,
            drift_events: 0,
            drift_threshold: 10,
            feedback: Some(0.9),
        }
    }

    #[test]
    fn healthy_agent_scores_high() {
        let agent = agent(AgentStatus::Verified);
        let score = compute(&agent, &baseline_inputs(), TrustWeights::default(), "test");
        assert!(score.score > 0.85, "score was {}", score.score);
        assert_eq!(score.confidence, 1.0);
    }

    #[test]
    fn unverified_status_drops_a_quarter() {
        let verified = compute(
            &agent(AgentStatus::Verified),
            &baseline_inputs(),
            TrustWeights::default(),
            "test",
        );
        let mut inputs = baseline_inputs();
        inputs.status = AgentStatus::Pending;
        let pending = compute(
            &agent(AgentStatus::Pending),
            &inputs,
            TrustWeights::default(),
            "test",
        );
        assert!((verified.score - pending.score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn alerts_erode_the_security_factor() {
        let mut inputs = baseline_inputs();
        inputs.alerts_last_window = 5;
        let score = compute(
            &agent(AgentStatus::Verified),
            &inputs,
            TrustWeights::default(),
            "test",
        );
        assert!((score.factors.security_alerts - 0.5).abs() < 1e-9);

        inputs.alerts_last_window = 25;
        let floored = compute(
            &agent(AgentStatus::Verified),
            &inputs,
            TrustWeights::default(),
            "test",
        );
        assert_eq!(floored.factors.security_alerts, 0.0);
    }

    #[test]
    fn contributions_sum_to_score() {
        let score = compute(
            &agent(AgentStatus::Verified),
            &baseline_inputs(),
            TrustWeights::default(),
            "test",
        );
        let sum = score.contributions.verification_status
            + score.contributions.uptime
            + score.contributions.success_rate
            + score.contributions.security_alerts
            + score.contributions.compliance
            + score.contributions.age
            + score.contributions.drift_detection
            + score.contributions.user_feedback;
        assert!((sum - score.score).abs() < 1e-9);
    }

    proptest! {
        // The score must stay inside [0,1] for any inputs.
        #[test]
        fn score_is_always_bounded(
            attempts in 0i64..10_000,
            successes in 0i64..10_000,
            active_hours in 0i64..2_000,
            alerts in 0i64..1_000,
            violations in 0i64..10_000,
            days in 0.0f64..10_000.0,
            drift in 0i64..1_000,
            feedback in proptest::option::of(0.0f64..1.0),
        ) {
            let inputs = TrustInputs {
                status: AgentStatus::Verified,
                attempts,
                successes: successes.min(attempts),
                active_hours,
                alerts_last_window: alerts,
                policy_checks: attempts,
                policy_passes: (attempts - violations).max(0),
                days_since_creation: days,
                drift_events: drift,
                drift_threshold: 10,
                feedback,
            };
            let score = compute(
                &agent(AgentStatus::Verified),
                &inputs,
                TrustWeights::default(),
                "prop",
            );
            prop_assert!((0.0..=1.0).contains(&score.score));
            prop_assert!((0.0..=1.0).contains(&score.confidence));
        }
    }
}
