//! AIM Webhook - domain-event fan-out (C10).
//!
//! Matched subscriptions get an HMAC-signed envelope POSTed with bounded
//! retries. Every attempt lands on the delivery row; a delivery is
//! abandoned after the subscription's `max_attempts`. Deliveries for the
//! same subscription are not ordered: concurrent retries may interleave.

#![deny(unsafe_code)]

use aim_crypto::webhook_signature_header;
use aim_storage::{ControlPlaneStore, StorageResult, WebhookStore};
use aim_types::{
    EventEnvelope, OrganizationId, Webhook, WebhookDelivery, WebhookDeliveryStatus,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Signature header on every delivery.
pub const SIGNATURE_HEADER: &str = "X-AIM-Signature";

/// Per-attempt timeout.
const ATTEMPT_TIMEOUT_SECS: u64 = 15;

/// Base delay for the exponential backoff.
const BACKOFF_BASE_SECS: u64 = 2;

/// Backoff ceiling.
const BACKOFF_CAP_SECS: u64 = 300;

/// How often the sweeper re-enqueues due retries.
const SWEEP_INTERVAL_SECS: u64 = 10;

#[derive(Debug)]
struct DeliveryJob {
    delivery: WebhookDelivery,
    url: String,
    secret: String,
    max_attempts: i32,
}

struct Transport {
    store: Arc<dyn ControlPlaneStore>,
    client: reqwest::Client,
}

/// Dispatches domain events to webhook subscribers.
#[derive(Clone)]
pub struct WebhookDispatcher {
    transport: Arc<Transport>,
    tx: mpsc::UnboundedSender<DeliveryJob>,
}

impl WebhookDispatcher {
    /// Create the dispatcher and spawn its worker loop. The loop drains
    /// in-flight jobs and exits when the last dispatcher handle is dropped.
    pub fn start(store: Arc<dyn ControlPlaneStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ATTEMPT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        let transport = Arc::new(Transport { store, client });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(transport.clone(), rx));
        Self { transport, tx }
    }

    /// Fan an event out to every enabled subscription of the organization.
    /// Returns the number of deliveries enqueued.
    pub async fn publish(
        &self,
        organization_id: OrganizationId,
        event_type: &str,
        data: serde_json::Value,
    ) -> StorageResult<usize> {
        let webhooks = self
            .transport
            .store
            .enabled_webhooks_for_event(&organization_id, event_type)
            .await?;
        if webhooks.is_empty() {
            return Ok(0);
        }

        let envelope = EventEnvelope::new(organization_id, event_type, Utc::now(), data);
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| aim_storage::StorageError::Serialization(e.to_string()))?;

        let mut enqueued = 0;
        for webhook in webhooks {
            let delivery = new_delivery(&envelope, &webhook, payload.clone());
            let delivery = self.transport.store.insert_delivery(delivery).await?;
            self.enqueue(delivery, &webhook);
            enqueued += 1;
        }
        tracing::debug!(event_type, enqueued, "webhook event published");
        Ok(enqueued)
    }

    /// Dispatch one synthetic `webhook.test` delivery to a subscription.
    pub async fn send_test(&self, webhook: &Webhook) -> StorageResult<WebhookDelivery> {
        let envelope = EventEnvelope::new(
            webhook.organization_id,
            "webhook.test",
            Utc::now(),
            serde_json::json!({"message": "test delivery"}),
        );
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| aim_storage::StorageError::Serialization(e.to_string()))?;
        let delivery = new_delivery(&envelope, webhook, payload);
        let delivery = self.transport.store.insert_delivery(delivery).await?;
        self.enqueue(delivery.clone(), webhook);
        Ok(delivery)
    }

    fn enqueue(&self, delivery: WebhookDelivery, webhook: &Webhook) {
        let job = DeliveryJob {
            delivery,
            url: webhook.url.clone(),
            secret: webhook.secret.clone(),
            max_attempts: webhook.max_attempts,
        };
        if self.tx.send(job).is_err() {
            tracing::error!("webhook worker is gone; delivery left for the sweeper");
        }
    }
}

fn new_delivery(
    envelope: &EventEnvelope,
    webhook: &Webhook,
    payload: serde_json::Value,
) -> WebhookDelivery {
    WebhookDelivery {
        id: aim_types::DeliveryId::generate(),
        webhook_id: webhook.id,
        organization_id: webhook.organization_id,
        event_id: envelope.id,
        event_type: envelope.event_type.clone(),
        payload,
        attempt_count: 0,
        last_status_code: None,
        last_error: None,
        status: WebhookDeliveryStatus::Pending,
        next_retry_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

async fn worker_loop(transport: Arc<Transport>, mut rx: mpsc::UnboundedReceiver<DeliveryJob>) {
    let mut sweep = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            job = rx.recv() => {
                match job {
                    Some(job) => attempt(&transport, job).await,
                    None => break,
                }
            }
            _ = sweep.tick() => sweep_due(&transport).await,
        }
    }
    tracing::debug!("webhook worker stopped");
}

async fn attempt(transport: &Transport, job: DeliveryJob) {
    metrics::counter!("aim_webhook_delivery_attempts_total").increment(1);
    let body = job.delivery.payload.to_string();
    let signature = webhook_signature_header(&job.secret, body.as_bytes());

    let outcome = transport
        .client
        .post(&job.url)
        .header("Content-Type", "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(body)
        .send()
        .await;

    let attempt_number = job.delivery.attempt_count + 1;
    let (status, status_code, error) = match outcome {
        Ok(response) if response.status().is_success() => (
            WebhookDeliveryStatus::Delivered,
            Some(response.status().as_u16() as i32),
            None,
        ),
        Ok(response) => (
            WebhookDeliveryStatus::Failed,
            Some(response.status().as_u16() as i32),
            Some(format!("subscriber returned {}", response.status())),
        ),
        Err(error) => (WebhookDeliveryStatus::Failed, None, Some(error.to_string())),
    };

    let (final_status, next_retry_at) = match status {
        WebhookDeliveryStatus::Delivered => (WebhookDeliveryStatus::Delivered, None),
        _ if attempt_number >= job.max_attempts => (WebhookDeliveryStatus::Abandoned, None),
        _ => (
            WebhookDeliveryStatus::Pending,
            Some(next_retry(attempt_number, Utc::now())),
        ),
    };

    if let Err(error) = transport
        .store
        .record_delivery_attempt(
            &job.delivery.id,
            final_status,
            status_code,
            error.clone(),
            next_retry_at,
            Utc::now(),
        )
        .await
    {
        tracing::error!(%error, "failed to record delivery attempt");
    }

    match final_status {
        WebhookDeliveryStatus::Delivered => {
            tracing::debug!(delivery = %job.delivery.id, attempt_number, "webhook delivered");
        }
        WebhookDeliveryStatus::Abandoned => {
            tracing::warn!(
                delivery = %job.delivery.id,
                attempt_number,
                error = error.as_deref().unwrap_or("unknown"),
                "webhook delivery abandoned"
            );
        }
        _ => {
            tracing::debug!(
                delivery = %job.delivery.id,
                attempt_number,
                "webhook attempt failed, will retry"
            );
        }
    }
}

async fn sweep_due(transport: &Transport) {
    let due = match transport.store.due_deliveries(Utc::now(), 50).await {
        Ok(due) => due,
        Err(error) => {
            tracing::warn!(%error, "retry sweep failed");
            return;
        }
    };
    for delivery in due {
        // Fresh rows are already queued by their publisher; the sweeper only
        // picks up deliveries whose retry time has arrived.
        if delivery.next_retry_at.is_none() && delivery.attempt_count == 0 {
            continue;
        }
        let webhook = match transport
            .store
            .get_webhook(&delivery.organization_id, &delivery.webhook_id)
            .await
        {
            Ok(Some(webhook)) => webhook,
            Ok(None) => continue,
            Err(error) => {
                tracing::warn!(%error, "retry sweep could not load webhook");
                continue;
            }
        };
        let job = DeliveryJob {
            url: webhook.url.clone(),
            secret: webhook.secret.clone(),
            max_attempts: webhook.max_attempts,
            delivery,
        };
        attempt(transport, job).await;
    }
}

/// Exponential backoff with jitter: `base * 2^attempt`, capped, plus up to
/// 50% random spread so synchronized failures do not retry in lockstep.
fn next_retry(attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    let exponent = attempt.clamp(0, 16) as u32;
    let base = BACKOFF_BASE_SECS
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    now + ChronoDuration::seconds((base + jitter) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let now = Utc::now();
        let first = next_retry(1, now) - now;
        let fifth = next_retry(5, now) - now;
        let huge = next_retry(12, now) - now;
        assert!(first.num_seconds() >= 4);
        assert!(fifth.num_seconds() >= 64);
        // Cap plus at most 50% jitter.
        assert!(huge.num_seconds() <= (BACKOFF_CAP_SECS + BACKOFF_CAP_SECS / 2) as i64);
    }
}
