//! Severity derivation for action-related alerts.
//!
//! The heuristic branches on the action's risk class; an explicit
//! `risk_level` supplied with the request always wins.

use aim_types::{ActionRiskClass, AlertSeverity, RiskLevel};

/// Severity for an alert about `action_class`, honoring an explicit
/// request-level override.
pub fn derive_severity(
    action_class: ActionRiskClass,
    explicit: Option<RiskLevel>,
) -> AlertSeverity {
    if let Some(level) = explicit {
        return match level {
            RiskLevel::Low => AlertSeverity::Info,
            RiskLevel::Medium => AlertSeverity::Warning,
            RiskLevel::High => AlertSeverity::High,
            RiskLevel::Critical => AlertSeverity::Critical,
        };
    }
    match action_class {
        ActionRiskClass::Delete | ActionRiskClass::Execute => AlertSeverity::Critical,
        ActionRiskClass::Write | ActionRiskClass::Modify => AlertSeverity::High,
        ActionRiskClass::Read => AlertSeverity::Warning,
        ActionRiskClass::Unknown => AlertSeverity::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_follows_the_risk_class() {
        assert_eq!(
            derive_severity(ActionRiskClass::Delete, None),
            AlertSeverity::Critical
        );
        assert_eq!(
            derive_severity(ActionRiskClass::Write, None),
            AlertSeverity::High
        );
        assert_eq!(
            derive_severity(ActionRiskClass::Read, None),
            AlertSeverity::Warning
        );
        assert_eq!(
            derive_severity(ActionRiskClass::Unknown, None),
            AlertSeverity::Info
        );
    }

    #[test]
    fn explicit_risk_level_overrides() {
        assert_eq!(
            derive_severity(ActionRiskClass::Read, Some(RiskLevel::Critical)),
            AlertSeverity::Critical
        );
        assert_eq!(
            derive_severity(ActionRiskClass::Execute, Some(RiskLevel::Low)),
            AlertSeverity::Info
        );
    }
}
