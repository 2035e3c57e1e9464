use crate::model::{
    AgentEventStats, AlertFilter, NewAgent, NewMcpServer, PendingStatusCounts, QueryWindow,
    VerificationFilter, VerificationStats,
};
use crate::StorageResult;
use aim_types::{
    Agent, AgentCapability, AgentId, AgentMcpConnection, AgentStatus, Alert, AlertId, AuditAppend,
    AuditLogEntry, CapabilityId, CapabilityRequest, CapabilityRequestId, CapabilityRequestStatus,
    CapabilityViolation, DeliveryId, McpAttestation, McpServer, McpServerId, McpVerificationStatus,
    OrganizationId, PolicyId, SdkToken, SdkTokenId, SecurityPolicy, TrustScoreHistory, UserId,
    VerificationEvent, VerificationId, VerificationOutcome, VerificationStatus, Webhook,
    WebhookDelivery, WebhookDeliveryStatus, WebhookId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage interface for agent records.
///
/// The agent row is the primary contention point (key rotation, trust
/// updates, `last_active`): rotation is version-checked, counters and
/// `last_active` are single-statement updates.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert a new agent; `Conflict` when the name is taken in the org.
    async fn create_agent(&self, new: NewAgent) -> StorageResult<Agent>;

    async fn get_agent(&self, id: &AgentId) -> StorageResult<Option<Agent>>;

    /// Tenant-scoped read; an agent from another org is invisible.
    async fn get_agent_scoped(
        &self,
        organization_id: &OrganizationId,
        id: &AgentId,
    ) -> StorageResult<Option<Agent>>;

    async fn find_agent_by_api_key_hash(&self, hash: &str) -> StorageResult<Option<Agent>>;

    async fn list_agents(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Agent>>;

    async fn update_agent_status(&self, id: &AgentId, status: AgentStatus) -> StorageResult<()>;

    /// Version-checked key rotation: moves the active key to
    /// `previous_public_key`, installs the new key and opens the grace
    /// window. `Conflict` when `expected_version` no longer matches.
    async fn rotate_agent_keys(
        &self,
        id: &AgentId,
        expected_version: i64,
        new_public_key: &str,
        grace_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<Agent>;

    /// SDK self-registration of a public key for a pending agent.
    async fn register_public_key(
        &self,
        id: &AgentId,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Agent>;

    async fn touch_last_active(&self, id: &AgentId, now: DateTime<Utc>) -> StorageResult<()>;

    async fn increment_violation_count(&self, id: &AgentId) -> StorageResult<()>;
}

/// Storage interface for capability grants and capability requests.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    /// Insert a grant; `Conflict` when an active grant for the same
    /// (agent, capability_type) already exists.
    async fn insert_grant(&self, grant: AgentCapability) -> StorageResult<AgentCapability>;

    /// Revoke an active grant; `InvariantViolation` when already revoked.
    async fn revoke_grant(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityId,
        revoked_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<AgentCapability>;

    async fn get_grant(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityId,
    ) -> StorageResult<Option<AgentCapability>>;

    async fn list_grants(
        &self,
        agent_id: &AgentId,
        active_only: bool,
    ) -> StorageResult<Vec<AgentCapability>>;

    /// `Conflict` when a pending request for the same (agent, type) exists.
    async fn create_capability_request(
        &self,
        request: CapabilityRequest,
    ) -> StorageResult<CapabilityRequest>;

    async fn get_capability_request(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityRequestId,
    ) -> StorageResult<Option<CapabilityRequest>>;

    async fn list_capability_requests(
        &self,
        organization_id: &OrganizationId,
        status: Option<CapabilityRequestStatus>,
        window: QueryWindow,
    ) -> StorageResult<Vec<CapabilityRequest>>;

    /// Approve or reject a pending request; approval also inserts the grant
    /// in the same transaction. Returns the updated request and the grant
    /// when one was created.
    async fn decide_capability_request(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityRequestId,
        approve: bool,
        decided_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<(CapabilityRequest, Option<AgentCapability>)>;
}

/// Storage interface for security policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn upsert_policy(&self, policy: SecurityPolicy) -> StorageResult<SecurityPolicy>;

    /// Enabled policies for the org, priority ascending (lower = first).
    async fn list_enabled_policies(
        &self,
        organization_id: &OrganizationId,
    ) -> StorageResult<Vec<SecurityPolicy>>;

    async fn list_policies(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<SecurityPolicy>>;

    async fn delete_policy(
        &self,
        organization_id: &OrganizationId,
        id: &PolicyId,
    ) -> StorageResult<()>;
}

/// Storage interface for the append-only verification event log.
#[async_trait]
pub trait VerificationEventStore: Send + Sync {
    async fn insert_event(&self, event: VerificationEvent) -> StorageResult<VerificationEvent>;

    async fn get_event(&self, id: &VerificationId) -> StorageResult<Option<VerificationEvent>>;

    /// The single legal mutation: `pending -> success | failed`.
    /// `InvariantViolation` when the event is already terminal.
    #[allow(clippy::too_many_arguments)]
    async fn complete_event(
        &self,
        id: &VerificationId,
        status: VerificationStatus,
        result: VerificationOutcome,
        error_code: Option<String>,
        error_reason: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<VerificationEvent>;

    /// Newest first: `started_at` descending, id as the tiebreak.
    async fn list_events(
        &self,
        filter: &VerificationFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<VerificationEvent>>;

    async fn count_events(&self, filter: &VerificationFilter) -> StorageResult<i64>;

    async fn pending_status_counts(
        &self,
        organization_id: &OrganizationId,
    ) -> StorageResult<PendingStatusCounts>;

    async fn verification_stats(
        &self,
        organization_id: &OrganizationId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<VerificationStats>;

    async fn count_agent_events_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;

    async fn agent_event_stats(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<AgentEventStats>;

    async fn recent_agent_events(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<VerificationEvent>>;
}

/// Storage interface for hash-chained audit events. Appends must be durable
/// before the enclosing operation reports success.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditLogEntry>;

    async fn list_audit(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<AuditLogEntry>>;

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>>;
}

/// Storage interface for alerts and capability violations.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: Alert) -> StorageResult<Alert>;

    async fn get_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
    ) -> StorageResult<Option<Alert>>;

    async fn list_alerts(
        &self,
        organization_id: &OrganizationId,
        filter: &AlertFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<Alert>>;

    /// `InvariantViolation` when already acknowledged.
    async fn acknowledge_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
        acknowledged_by: UserId,
        now: DateTime<Utc>,
    ) -> StorageResult<Alert>;

    async fn resolve_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
        resolution: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Alert>;

    /// Alerts attached to an agent (resource_type = "agent") since a cutoff.
    async fn count_agent_alerts_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;

    async fn count_agent_alerts_by_type_since(
        &self,
        agent_id: &AgentId,
        alert_type: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;

    async fn insert_violation(&self, violation: CapabilityViolation) -> StorageResult<()>;

    async fn count_agent_violations_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;
}

/// Storage interface for MCP servers, attestations and connections.
#[async_trait]
pub trait AttestationStore: Send + Sync {
    /// `Conflict` when the URL or name is taken within the org.
    async fn create_mcp_server(&self, new: NewMcpServer) -> StorageResult<McpServer>;

    async fn get_mcp_server(&self, id: &McpServerId) -> StorageResult<Option<McpServer>>;

    async fn get_mcp_server_scoped(
        &self,
        organization_id: &OrganizationId,
        id: &McpServerId,
    ) -> StorageResult<Option<McpServer>>;

    async fn list_mcp_servers(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<McpServer>>;

    /// Persist a verified attestation and fold it into the server's rolling
    /// confidence in one transaction: insert the row, bump the
    /// (agent, server) connection counters, and apply
    /// `clamp((1-alpha)*confidence + alpha*sample - penalty)` together with
    /// `attestation_count + 1` as a single statement so concurrent
    /// attestations never lose an increment. Returns the updated
    /// (confidence, attestation_count).
    #[allow(clippy::too_many_arguments)]
    async fn apply_attestation(
        &self,
        attestation: McpAttestation,
        sample: f64,
        penalty: f64,
        alpha: f64,
        status: McpVerificationStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<(f64, i64)>;

    async fn list_attestations(
        &self,
        mcp_server_id: &McpServerId,
        window: QueryWindow,
    ) -> StorageResult<Vec<McpAttestation>>;

    async fn connected_agents(
        &self,
        mcp_server_id: &McpServerId,
    ) -> StorageResult<Vec<AgentMcpConnection>>;
}

/// Storage interface for trust scores.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Append a history row and update the agent's current score in one
    /// transaction; a reader never sees one without the other.
    async fn record_trust_score(&self, history: TrustScoreHistory) -> StorageResult<()>;

    async fn latest_trust(&self, agent_id: &AgentId) -> StorageResult<Option<TrustScoreHistory>>;

    /// Newest first.
    async fn trust_history(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> StorageResult<Vec<TrustScoreHistory>>;
}

/// Storage interface for webhook subscriptions and delivery tracking.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn create_webhook(&self, webhook: Webhook) -> StorageResult<Webhook>;

    async fn get_webhook(
        &self,
        organization_id: &OrganizationId,
        id: &WebhookId,
    ) -> StorageResult<Option<Webhook>>;

    async fn list_webhooks(&self, organization_id: &OrganizationId) -> StorageResult<Vec<Webhook>>;

    async fn update_webhook(&self, webhook: Webhook) -> StorageResult<Webhook>;

    async fn delete_webhook(
        &self,
        organization_id: &OrganizationId,
        id: &WebhookId,
    ) -> StorageResult<()>;

    async fn enabled_webhooks_for_event(
        &self,
        organization_id: &OrganizationId,
        event_type: &str,
    ) -> StorageResult<Vec<Webhook>>;

    async fn insert_delivery(&self, delivery: WebhookDelivery) -> StorageResult<WebhookDelivery>;

    /// Record one attempt outcome; bumps `attempt_count`.
    #[allow(clippy::too_many_arguments)]
    async fn record_delivery_attempt(
        &self,
        id: &DeliveryId,
        status: WebhookDeliveryStatus,
        status_code: Option<i32>,
        error: Option<String>,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StorageResult<WebhookDelivery>;

    async fn list_deliveries(
        &self,
        webhook_id: &WebhookId,
        window: QueryWindow,
    ) -> StorageResult<Vec<WebhookDelivery>>;

    /// Pending deliveries whose `next_retry_at` has passed.
    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<WebhookDelivery>>;
}

/// Storage interface for tracked SDK refresh tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, token: SdkToken) -> StorageResult<SdkToken>;

    async fn get_token(&self, id: &SdkTokenId) -> StorageResult<Option<SdkToken>>;

    async fn find_token_by_hash(&self, token_hash: &str) -> StorageResult<Option<SdkToken>>;

    /// `InvariantViolation` when the token is already revoked.
    async fn revoke_token(
        &self,
        id: &SdkTokenId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<SdkToken>;

    /// Atomic rotation: persist the new token, then revoke the old one with
    /// reason "rotated", in one transaction. A crash can leave the old token
    /// revoked or both tokens usable, never both revoked.
    async fn rotate_token(
        &self,
        new_token: SdkToken,
        old_id: &SdkTokenId,
        now: DateTime<Utc>,
    ) -> StorageResult<SdkToken>;
}

/// Unified storage bundle wired through the service layer.
pub trait ControlPlaneStore:
    AgentStore
    + CapabilityStore
    + PolicyStore
    + VerificationEventStore
    + AuditStore
    + AlertStore
    + AttestationStore
    + TrustStore
    + WebhookStore
    + TokenStore
    + Send
    + Sync
{
}

impl<T> ControlPlaneStore for T where
    T: AgentStore
        + CapabilityStore
        + PolicyStore
        + VerificationEventStore
        + AuditStore
        + AlertStore
        + AttestationStore
        + TrustStore
        + WebhookStore
        + TokenStore
        + Send
        + Sync
{
}
