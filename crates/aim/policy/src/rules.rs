//! Typed policy rules.
//!
//! Each `policy_type` has one rule variant; the stored `rules` JSON carries
//! its parameters. Adding a policy type means adding a variant here - the
//! decider never inspects rule internals.

use crate::PolicyError;
use aim_capability::glob_matches;
use aim_types::{ActionRiskClass, Agent, PolicyType, SecurityPolicy};
use chrono::{DateTime, Timelike, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Everything a rule may inspect, assembled once per request by the decider.
#[derive(Clone, Debug)]
pub struct PolicyInput<'a> {
    pub agent: &'a Agent,
    pub action_type: &'a str,
    pub action_class: ActionRiskClass,
    pub resource: Option<&'a str>,
    pub context: &'a BTreeMap<String, Value>,
    /// Whether C2 found an active grant covering this request.
    pub has_capability: bool,
    /// Types of the agent's active grants, for drift comparison.
    pub granted_capability_types: &'a [String],
    /// Verification events for this agent in the activity lookback window.
    pub recent_event_count: i64,
    /// Size of the request payload (resource + context), in bytes.
    pub payload_bytes: u64,
    pub now: DateTime<Utc>,
}

/// Hour-of-day window during which activity is considered normal.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct AllowedHours {
    pub start: u32,
    pub end: u32,
}

impl AllowedHours {
    fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            (self.start..=self.end).contains(&hour)
        } else {
            // Overnight window, e.g. 22..6.
            hour >= self.start || hour <= self.end
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct UnusualActivityParams {
    #[serde(default = "default_rate_limit")]
    rate_limit: i64,
    #[serde(default)]
    allowed_hours: Option<AllowedHours>,
}

fn default_rate_limit() -> i64 {
    100
}

#[derive(Clone, Debug, Deserialize)]
struct TrustScoreLowParams {
    threshold: f64,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct UnauthorizedAccessParams {
    #[serde(default)]
    forbidden_patterns: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct DataExfiltrationParams {
    #[serde(default)]
    sensitive_actions: Vec<String>,
    #[serde(default = "default_max_bytes")]
    max_bytes: u64,
    /// Hosts that do not count as external targets.
    #[serde(default)]
    allowed_hosts: Vec<String>,
}

fn default_max_bytes() -> u64 {
    1024 * 1024
}

/// A policy's rule, parsed into its typed form.
#[derive(Clone, Debug)]
pub enum PolicyRule {
    CapabilityViolation,
    TrustScoreLow(TrustScoreLowRule),
    UnusualActivity(UnusualActivityRule),
    UnauthorizedAccess(UnauthorizedAccessRule),
    DataExfiltration(DataExfiltrationRule),
    ConfigDrift,
}

#[derive(Clone, Debug)]
pub struct TrustScoreLowRule {
    threshold: f64,
}

#[derive(Clone, Debug)]
pub struct UnusualActivityRule {
    rate_limit: i64,
    allowed_hours: Option<AllowedHours>,
}

#[derive(Clone, Debug)]
pub struct UnauthorizedAccessRule {
    forbidden_patterns: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct DataExfiltrationRule {
    sensitive_actions: Vec<String>,
    max_bytes: u64,
    allowed_hosts: Vec<String>,
}

impl PolicyRule {
    /// Parse the stored rule parameters for a policy.
    pub fn from_policy(policy: &SecurityPolicy) -> Result<Self, PolicyError> {
        let invalid = |message: String| PolicyError::InvalidRule {
            policy: policy.name.clone(),
            message,
        };
        match policy.policy_type {
            PolicyType::CapabilityViolation => Ok(Self::CapabilityViolation),
            PolicyType::TrustScoreLow => {
                let params: TrustScoreLowParams = serde_json::from_value(policy.rules.clone())
                    .map_err(|e| invalid(e.to_string()))?;
                if !(0.0..=1.0).contains(&params.threshold) {
                    return Err(invalid(format!(
                        "threshold {} outside [0,1]",
                        params.threshold
                    )));
                }
                Ok(Self::TrustScoreLow(TrustScoreLowRule {
                    threshold: params.threshold,
                }))
            }
            PolicyType::UnusualActivity => {
                let params: UnusualActivityParams = serde_json::from_value(policy.rules.clone())
                    .map_err(|e| invalid(e.to_string()))?;
                Ok(Self::UnusualActivity(UnusualActivityRule {
                    rate_limit: params.rate_limit,
                    allowed_hours: params.allowed_hours,
                }))
            }
            PolicyType::UnauthorizedAccess => {
                let params: UnauthorizedAccessParams =
                    serde_json::from_value(policy.rules.clone())
                        .map_err(|e| invalid(e.to_string()))?;
                Ok(Self::UnauthorizedAccess(UnauthorizedAccessRule {
                    forbidden_patterns: params.forbidden_patterns,
                }))
            }
            PolicyType::DataExfiltration => {
                let params: DataExfiltrationParams = serde_json::from_value(policy.rules.clone())
                    .map_err(|e| invalid(e.to_string()))?;
                Ok(Self::DataExfiltration(DataExfiltrationRule {
                    sensitive_actions: params.sensitive_actions,
                    max_bytes: params.max_bytes,
                    allowed_hosts: params.allowed_hosts,
                }))
            }
            PolicyType::ConfigDrift => Ok(Self::ConfigDrift),
        }
    }

    /// Returns the match reason when the rule fires.
    pub fn evaluate(&self, input: &PolicyInput<'_>) -> Option<String> {
        match self {
            Self::CapabilityViolation => (!input.has_capability).then(|| {
                format!(
                    "agent holds no active grant for `{}`",
                    input.action_type
                )
            }),
            Self::TrustScoreLow(rule) => (input.agent.trust_score < rule.threshold).then(|| {
                format!(
                    "trust score {:.2} below threshold {:.2}",
                    input.agent.trust_score, rule.threshold
                )
            }),
            Self::UnusualActivity(rule) => {
                if input.recent_event_count > rule.rate_limit {
                    return Some(format!(
                        "{} verifications in the activity window exceed the limit of {}",
                        input.recent_event_count, rule.rate_limit
                    ));
                }
                if let Some(hours) = rule.allowed_hours {
                    let hour = input.now.hour();
                    if !hours.contains(hour) {
                        return Some(format!(
                            "request at hour {hour} outside allowed window {}..{}",
                            hours.start, hours.end
                        ));
                    }
                }
                None
            }
            Self::UnauthorizedAccess(rule) => {
                let resource = input.resource?;
                rule.forbidden_patterns
                    .iter()
                    .find(|pattern| glob_matches(pattern, resource))
                    .map(|pattern| {
                        format!("resource `{resource}` matches forbidden pattern `{pattern}`")
                    })
            }
            Self::DataExfiltration(rule) => {
                if !rule
                    .sensitive_actions
                    .iter()
                    .any(|action| action == input.action_type)
                {
                    return None;
                }
                if input.payload_bytes > rule.max_bytes {
                    return Some(format!(
                        "payload of {} bytes exceeds the {}-byte limit for `{}`",
                        input.payload_bytes, rule.max_bytes, input.action_type
                    ));
                }
                if let Some(host) = external_host(input.resource, &rule.allowed_hosts) {
                    return Some(format!("sensitive action targets external host `{host}`"));
                }
                None
            }
            Self::ConfigDrift => detect_drift(input),
        }
    }
}

/// Extract the host when the resource is an http(s) URL pointing outside the
/// allowed set.
fn external_host(resource: Option<&str>, allowed_hosts: &[String]) -> Option<String> {
    let resource = resource?;
    let rest = resource
        .strip_prefix("https://")
        .or_else(|| resource.strip_prefix("http://"))?;
    let host = rest.split(['/', ':', '?']).next().unwrap_or(rest);
    if allowed_hosts.iter().any(|allowed| allowed == host) {
        return None;
    }
    Some(host.to_string())
}

/// Compare runtime-reported configuration against the registered baseline.
fn detect_drift(input: &PolicyInput<'_>) -> Option<String> {
    if let Some(reported) = string_list(input.context.get("current_mcp_servers")) {
        let unknown: Vec<&String> = reported
            .iter()
            .filter(|server| !input.agent.talks_to.contains(server))
            .collect();
        if let Some(server) = unknown.first() {
            return Some(format!("agent reports unregistered MCP server `{server}`"));
        }
    }
    if let Some(reported) = string_list(input.context.get("current_capabilities")) {
        let unknown: Vec<&String> = reported
            .iter()
            .filter(|capability| !input.granted_capability_types.contains(capability))
            .collect();
        if let Some(capability) = unknown.first() {
            return Some(format!("agent reports ungranted capability `{capability}`"));
        }
    }
    None
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let items = value?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_hours_handles_overnight_windows() {
        let overnight = AllowedHours { start: 22, end: 6 };
        assert!(overnight.contains(23));
        assert!(overnight.contains(3));
        assert!(!overnight.contains(12));

        let daytime = AllowedHours { start: 8, end: 18 };
        assert!(daytime.contains(8));
        assert!(daytime.contains(18));
        assert!(!daytime.contains(19));
    }

    #[test]
    fn external_host_respects_allowlist() {
        assert_eq!(
            external_host(Some("https://evil.example.com/upload"), &[]),
            Some("evil.example.com".to_string())
        );
        assert_eq!(
            external_host(
                Some("https://internal.corp/export"),
                &["internal.corp".to_string()]
            ),
            None
        );
        assert_eq!(external_host(Some("db://customers"), &[]), None);
    }
}
