//! Trust scores: the 8-factor weighted model.

use crate::ids::{AgentId, OrganizationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The eight factor values, each clamped to [0,1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustFactors {
    pub verification_status: f64,
    pub uptime: f64,
    pub success_rate: f64,
    pub security_alerts: f64,
    pub compliance: f64,
    pub age: f64,
    pub drift_detection: f64,
    pub user_feedback: f64,
}

/// Factor weights. The defaults sum to 1.0.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustWeights {
    pub verification_status: f64,
    pub uptime: f64,
    pub success_rate: f64,
    pub security_alerts: f64,
    pub compliance: f64,
    pub age: f64,
    pub drift_detection: f64,
    pub user_feedback: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            verification_status: 0.25,
            uptime: 0.15,
            success_rate: 0.15,
            security_alerts: 0.15,
            compliance: 0.10,
            age: 0.10,
            drift_detection: 0.05,
            user_feedback: 0.05,
        }
    }
}

/// A computed trust score with its breakdown.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustScore {
    pub agent_id: AgentId,
    /// Weighted sum in [0,1].
    pub score: f64,
    pub factors: TrustFactors,
    pub weights: TrustWeights,
    /// Per-factor weighted contributions; sums to `score`.
    pub contributions: TrustFactors,
    /// How much observed data backs the factors, in [0,1].
    pub confidence: f64,
    pub calculated_at: DateTime<Utc>,
    pub reason: String,
}

/// Append-only history row, one per recalculation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustScoreHistory {
    pub agent_id: AgentId,
    pub organization_id: OrganizationId,
    pub score: f64,
    pub factors: TrustFactors,
    pub weights: TrustWeights,
    pub contributions: TrustFactors,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
    pub reason: String,
}
