//! AIM Trust - the 8-factor trust model (C4).
//!
//! The score is a weighted sum of eight factors, each clamped to [0,1].
//! Computation is pure over a [`TrustInputs`] snapshot; [`TrustService`]
//! gathers the snapshot from storage and records every recalculation as an
//! atomic {history row, agent score} pair.

#![deny(unsafe_code)]

pub mod model;

pub use model::{compute, TrustInputs};

use aim_storage::{
    AgentStore, AlertStore, ControlPlaneStore, StorageError, StorageResult, TrustStore,
    VerificationEventStore,
};
use aim_types::{
    ActionRiskClass, Agent, AgentId, AgentStatus, TrustScore, TrustScoreHistory, TrustWeights,
    UserId,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Lookback for event-derived factors.
const FACTOR_WINDOW_DAYS: i64 = 30;

/// Drift events tolerated before the drift factor reaches zero.
const DRIFT_THRESHOLD: i64 = 10;

/// Trust calculator over the control-plane store.
#[derive(Clone)]
pub struct TrustService {
    store: Arc<dyn ControlPlaneStore>,
}

impl TrustService {
    pub fn new(store: Arc<dyn ControlPlaneStore>) -> Self {
        Self { store }
    }

    /// Recalculate the agent's trust score and persist it atomically with a
    /// history row.
    pub async fn calculate(&self, agent: &Agent, reason: &str) -> StorageResult<TrustScore> {
        let inputs = self.collect_inputs(agent).await?;
        let score = compute(agent, &inputs, TrustWeights::default(), reason);
        self.record(&score).await?;
        Ok(score)
    }

    /// Latest recorded score; recalculates when the agent has no history.
    pub async fn latest(&self, agent: &Agent) -> StorageResult<TrustScore> {
        match self.store.latest_trust(&agent.id).await? {
            Some(row) => Ok(TrustScore {
                agent_id: row.agent_id,
                score: row.score,
                factors: row.factors,
                weights: row.weights,
                contributions: row.contributions,
                confidence: row.confidence,
                calculated_at: row.recorded_at,
                reason: row.reason,
            }),
            None => self.calculate(agent, "initial calculation").await,
        }
    }

    pub async fn history(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> StorageResult<Vec<TrustScoreHistory>> {
        self.store.trust_history(agent_id, limit).await
    }

    /// Operator override. Records the old value in the history reason.
    pub async fn override_score(
        &self,
        agent: &Agent,
        new_score: f64,
        reason: &str,
        overridden_by: Option<UserId>,
    ) -> StorageResult<TrustScore> {
        if !(0.0..=1.0).contains(&new_score) {
            return Err(StorageError::InvalidInput(format!(
                "trust score {new_score} outside [0,1]"
            )));
        }
        let inputs = self.collect_inputs(agent).await?;
        let mut score = compute(agent, &inputs, TrustWeights::default(), reason);
        score.reason = format!(
            "manual override {:.3} -> {:.3} by {}: {}",
            agent.trust_score,
            new_score,
            overridden_by.map_or("system".to_string(), |id| id.to_string()),
            reason
        );
        score.score = new_score;
        self.record(&score).await?;
        tracing::info!(agent_id = %agent.id, new_score, "trust score overridden");
        Ok(score)
    }

    async fn record(&self, score: &TrustScore) -> StorageResult<()> {
        metrics::histogram!("aim_trust_score_distribution").record(score.score);
        let agent = self
            .store
            .get_agent(&score.agent_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("agent {}", score.agent_id)))?;
        self.store
            .record_trust_score(TrustScoreHistory {
                agent_id: score.agent_id,
                organization_id: agent.organization_id,
                score: score.score,
                factors: score.factors,
                weights: score.weights,
                contributions: score.contributions,
                confidence: score.confidence,
                recorded_at: score.calculated_at,
                reason: score.reason.clone(),
            })
            .await
    }

    async fn collect_inputs(&self, agent: &Agent) -> StorageResult<TrustInputs> {
        let since = Utc::now() - Duration::days(FACTOR_WINDOW_DAYS);
        let event_stats = self.store.agent_event_stats(&agent.id, since).await?;
        let alerts = self.store.count_agent_alerts_since(&agent.id, since).await?;
        let drift_alerts = self
            .store
            .count_agent_alerts_by_type_since(&agent.id, "config_drift", since)
            .await?;
        let violations = self
            .store
            .count_agent_violations_since(&agent.id, since)
            .await?;
        let days_since_creation = (Utc::now() - agent.created_at).num_seconds() as f64 / 86_400.0;

        Ok(TrustInputs {
            status: agent.status,
            attempts: event_stats.attempts,
            successes: event_stats.successes,
            active_hours: event_stats.active_hours,
            alerts_last_window: alerts,
            // Compliance observes policy outcomes through violations: each
            // violation is a failed policy check against an attempt.
            policy_checks: event_stats.attempts,
            policy_passes: (event_stats.attempts - violations).max(0),
            days_since_creation,
            drift_events: drift_alerts,
            drift_threshold: DRIFT_THRESHOLD,
            feedback: None,
        })
    }
}

/// Effective trust for threshold comparison: base score shrunk by the
/// action-risk multiplier.
pub fn action_adjusted_trust(base_score: f64, action_class: ActionRiskClass) -> f64 {
    (base_score * action_class.trust_multiplier()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_storage::{MemoryStore, NewAgent};

    #[tokio::test]
    async fn calculate_persists_score_and_history_together() {
        let store = Arc::new(MemoryStore::new());
        let agent = store
            .create_agent(NewAgent {
                organization_id: aim_types::OrganizationId::generate(),
                name: "worker".to_string(),
                display_name: "Worker".to_string(),
                public_key: "pk".to_string(),
                api_key_hash: None,
                talks_to: vec![],
                created_by: None,
            })
            .await
            .unwrap();
        let mut agent = agent;
        agent.status = AgentStatus::Verified;
        store
            .update_agent_status(&agent.id, AgentStatus::Verified)
            .await
            .unwrap();

        let service = TrustService::new(store.clone());
        let score = service.calculate(&agent, "test").await.unwrap();
        assert!((0.0..=1.0).contains(&score.score));

        let stored = store.get_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(stored.trust_score, score.score);
        assert_eq!(service.history(&agent.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn override_records_old_value_in_reason() {
        let store = Arc::new(MemoryStore::new());
        let agent = store
            .create_agent(NewAgent {
                organization_id: aim_types::OrganizationId::generate(),
                name: "worker".to_string(),
                display_name: "Worker".to_string(),
                public_key: "pk".to_string(),
                api_key_hash: None,
                talks_to: vec![],
                created_by: None,
            })
            .await
            .unwrap();

        let service = TrustService::new(store.clone());
        let score = service
            .override_score(&agent, 0.95, "incident cleared", None)
            .await
            .unwrap();
        assert_eq!(score.score, 0.95);
        assert!(score.reason.contains("0.5"));
        assert!(score.reason.contains("incident cleared"));

        let rejected = service.override_score(&agent, 1.5, "bad", None).await;
        assert!(rejected.is_err());
    }

    #[test]
    fn action_adjustment_shrinks_by_risk() {
        assert_eq!(action_adjusted_trust(0.8, ActionRiskClass::Read), 0.8);
        assert!((action_adjusted_trust(0.8, ActionRiskClass::Write) - 0.64).abs() < 1e-9);
        assert!((action_adjusted_trust(0.8, ActionRiskClass::Execute) - 0.24).abs() < 1e-9);
    }
}
