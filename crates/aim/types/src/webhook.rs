//! Webhook subscriptions and delivery tracking.

use crate::ids::{DeliveryId, OrganizationId, WebhookId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A subscription to domain events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub organization_id: OrganizationId,
    pub url: String,
    /// HMAC-SHA256 secret for the `X-AIM-Signature` header. Never returned
    /// by list/get surfaces.
    #[serde(skip_serializing)]
    pub secret: String,
    /// Subscribed event types, e.g. `verification.decided`; `*` matches all.
    pub event_types: Vec<String>,
    pub is_enabled: bool,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types
            .iter()
            .any(|subscribed| subscribed == "*" || subscribed == event_type)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Abandoned,
}

impl WebhookDeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// Per-event delivery record; one row per (webhook, event), updated on each
/// attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub organization_id: OrganizationId,
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub status: WebhookDeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The wire envelope POSTed to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub organization_id: OrganizationId,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        organization_id: OrganizationId,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            occurred_at,
            organization_id,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_subscription_matches_everything() {
        let webhook = Webhook {
            id: WebhookId::generate(),
            organization_id: OrganizationId::generate(),
            url: "https://example.com/hook".to_string(),
            secret: "s".to_string(),
            event_types: vec!["*".to_string()],
            is_enabled: true,
            max_attempts: 5,
            created_at: Utc::now(),
        };
        assert!(webhook.subscribes_to("verification.decided"));
        assert!(webhook.subscribes_to("mcp.drift_detected"));
    }

    #[test]
    fn secret_is_never_serialized() {
        let webhook = Webhook {
            id: WebhookId::generate(),
            organization_id: OrganizationId::generate(),
            url: "https://example.com/hook".to_string(),
            secret: "super-secret".to_string(),
            event_types: vec![],
            is_enabled: true,
            max_attempts: 5,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&webhook).unwrap();
        assert!(!json.contains("super-secret"));
    }
}
