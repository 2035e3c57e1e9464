//! PostgreSQL adapter - the transactional source of truth.
//!
//! Tenancy is enforced by `organization_id` columns; hot-path agent updates
//! (`last_active`, counters, confidence folds) are single statements so
//! concurrent writers never lose an increment, and the few multi-row
//! invariants (trust score + history, token rotation, grant dedup) run in
//! explicit transactions.

use crate::model::{
    compute_audit_hash, AgentEventStats, AlertFilter, NewAgent, NewMcpServer, PendingStatusCounts,
    QueryWindow, VerificationFilter, VerificationStats,
};
use crate::traits::{
    AgentStore, AlertStore, AttestationStore, AuditStore, CapabilityStore, PolicyStore, TokenStore,
    TrustStore, VerificationEventStore, WebhookStore,
};
use crate::{StorageError, StorageResult};
use aim_types::{
    Agent, AgentCapability, AgentId, AgentMcpConnection, AgentSelector, AgentStatus, Alert,
    AlertId, AlertSeverity, AuditAppend, AuditLogEntry, CapabilityId, CapabilityRequest,
    CapabilityRequestId, CapabilityRequestStatus, CapabilityViolation, DeliveryId,
    EnforcementAction, McpAttestation, McpServer, McpServerId, McpVerificationStatus,
    OrganizationId, PolicyId, PolicyType, Protocol, SdkToken, SdkTokenId, SecurityPolicy,
    TrustScoreHistory, UserId, VerificationEvent, VerificationId, VerificationOutcome,
    VerificationStatus, VerificationType, Webhook, WebhookDelivery, WebhookDeliveryStatus,
    WebhookId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

/// PostgreSQL-backed control-plane store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and initialize the schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create an adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS aim_agents (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                name TEXT NOT NULL,
                display_name TEXT NOT NULL,
                status TEXT NOT NULL,
                public_key TEXT NOT NULL,
                api_key_hash TEXT,
                previous_public_key TEXT,
                key_created_at TIMESTAMPTZ NOT NULL,
                key_expires_at TIMESTAMPTZ,
                key_rotation_grace_until TIMESTAMPTZ,
                rotation_count BIGINT NOT NULL DEFAULT 0,
                trust_score DOUBLE PRECISION NOT NULL DEFAULT 0.5,
                capability_violation_count BIGINT NOT NULL DEFAULT 0,
                is_compromised BOOLEAN NOT NULL DEFAULT FALSE,
                talks_to JSONB NOT NULL DEFAULT '[]',
                last_active TIMESTAMPTZ,
                created_by UUID,
                created_at TIMESTAMPTZ NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                UNIQUE (organization_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_capabilities (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                agent_id UUID NOT NULL,
                capability_type TEXT NOT NULL,
                scope JSONB NOT NULL DEFAULT '{}',
                granted_by UUID,
                granted_at TIMESTAMPTZ NOT NULL,
                revoked_at TIMESTAMPTZ,
                revoked_by UUID
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_capability_requests (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                agent_id UUID NOT NULL,
                capability_type TEXT NOT NULL,
                scope JSONB NOT NULL DEFAULT '{}',
                justification TEXT,
                status TEXT NOT NULL,
                requested_by UUID,
                requested_at TIMESTAMPTZ NOT NULL,
                decided_by UUID,
                decided_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_policies (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                name TEXT NOT NULL,
                policy_type TEXT NOT NULL,
                enforcement_action TEXT NOT NULL,
                severity_threshold TEXT NOT NULL,
                rules JSONB NOT NULL DEFAULT '{}',
                applies_to JSONB NOT NULL DEFAULT '{"kind":"all"}',
                is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                priority INT NOT NULL DEFAULT 100,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_verification_events (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                agent_id UUID NOT NULL,
                protocol TEXT NOT NULL,
                verification_type TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                signature TEXT,
                public_key TEXT,
                confidence DOUBLE PRECISION NOT NULL DEFAULT 0,
                duration_ms BIGINT,
                error_code TEXT,
                error_reason TEXT,
                initiator_type TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT,
                resource_id TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                metadata JSONB NOT NULL DEFAULT '{}'
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS aim_verification_events_agent_started
                ON aim_verification_events (agent_id, started_at DESC)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS aim_verification_events_org_started
                ON aim_verification_events (organization_id, started_at DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_audit_log (
                id UUID PRIMARY KEY,
                sequence BIGINT NOT NULL UNIQUE,
                organization_id UUID NOT NULL,
                user_id UUID,
                action TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                ip TEXT,
                user_agent TEXT,
                metadata JSONB NOT NULL DEFAULT '{}',
                timestamp TIMESTAMPTZ NOT NULL,
                previous_hash TEXT,
                hash TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_alerts (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                resource_type TEXT,
                resource_id TEXT,
                is_acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
                acknowledged_by UUID,
                acknowledged_at TIMESTAMPTZ,
                resolved_at TIMESTAMPTZ,
                resolution TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_capability_violations (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                agent_id UUID NOT NULL,
                action TEXT NOT NULL,
                resource TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_mcp_servers (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                confidence_score DOUBLE PRECISION NOT NULL DEFAULT 0.5,
                attestation_count BIGINT NOT NULL DEFAULT 0,
                last_attested_at TIMESTAMPTZ,
                verification_status TEXT NOT NULL DEFAULT 'unverified',
                capabilities JSONB NOT NULL DEFAULT '[]',
                created_by UUID,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (organization_id, url),
                UNIQUE (organization_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_attestations (
                id UUID PRIMARY KEY,
                mcp_server_id UUID NOT NULL,
                agent_id UUID NOT NULL,
                capabilities_found JSONB NOT NULL DEFAULT '[]',
                connection_latency_ms BIGINT NOT NULL,
                signed_at TIMESTAMPTZ NOT NULL,
                signature TEXT NOT NULL,
                verified BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_agent_mcp_connections (
                agent_id UUID NOT NULL,
                mcp_server_id UUID NOT NULL,
                attestation_count BIGINT NOT NULL DEFAULT 0,
                last_attested_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (agent_id, mcp_server_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_trust_history (
                id UUID PRIMARY KEY,
                agent_id UUID NOT NULL,
                organization_id UUID NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                factors JSONB NOT NULL,
                weights JSONB NOT NULL,
                contributions JSONB NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                reason TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS aim_trust_history_agent_recorded
                ON aim_trust_history (agent_id, recorded_at DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_webhooks (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL,
                url TEXT NOT NULL,
                secret TEXT NOT NULL,
                event_types JSONB NOT NULL DEFAULT '[]',
                is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                max_attempts INT NOT NULL DEFAULT 5,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_webhook_deliveries (
                id UUID PRIMARY KEY,
                webhook_id UUID NOT NULL,
                organization_id UUID NOT NULL,
                event_id UUID NOT NULL,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                attempt_count INT NOT NULL DEFAULT 0,
                last_status_code INT,
                last_error TEXT,
                status TEXT NOT NULL,
                next_retry_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS aim_sdk_tokens (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                organization_id UUID NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                token_id TEXT NOT NULL,
                device_name TEXT,
                device_fingerprint TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                revoked_at TIMESTAMPTZ,
                revoke_reason TEXT
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> StorageResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StorageError::Backend(format!("column {name}: {e}")))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &PgRow, name: &str) -> StorageResult<T> {
    let value: serde_json::Value = col(row, name)?;
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn parse_with<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> StorageResult<T> {
    parse(raw).ok_or_else(|| StorageError::Serialization(format!("unknown {what} `{raw}`")))
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}

fn push_window(builder: &mut QueryBuilder<'_, sqlx::Postgres>, window: QueryWindow) {
    if window.limit > 0 {
        builder.push(" LIMIT ");
        builder.push_bind(window.limit as i64);
    }
    builder.push(" OFFSET ");
    builder.push_bind(window.offset as i64);
}

const AGENT_COLUMNS: &str = "id, organization_id, name, display_name, status, public_key, \
     api_key_hash, previous_public_key, key_created_at, key_expires_at, key_rotation_grace_until, \
     rotation_count, trust_score, capability_violation_count, is_compromised, talks_to, \
     last_active, created_by, created_at, version";

fn agent_row(row: PgRow) -> StorageResult<Agent> {
    let status: String = col(&row, "status")?;
    Ok(Agent {
        id: AgentId::from_uuid(col(&row, "id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        name: col(&row, "name")?,
        display_name: col(&row, "display_name")?,
        status: parse_with(&status, AgentStatus::parse, "agent status")?,
        public_key: col(&row, "public_key")?,
        api_key_hash: col(&row, "api_key_hash")?,
        previous_public_key: col(&row, "previous_public_key")?,
        key_created_at: col(&row, "key_created_at")?,
        key_expires_at: col(&row, "key_expires_at")?,
        key_rotation_grace_until: col(&row, "key_rotation_grace_until")?,
        rotation_count: col(&row, "rotation_count")?,
        trust_score: col(&row, "trust_score")?,
        capability_violation_count: col(&row, "capability_violation_count")?,
        is_compromised: col(&row, "is_compromised")?,
        talks_to: json_col(&row, "talks_to")?,
        last_active: col(&row, "last_active")?,
        created_by: col::<Option<Uuid>>(&row, "created_by")?.map(UserId::from_uuid),
        created_at: col(&row, "created_at")?,
        version: col(&row, "version")?,
    })
}

fn capability_row(row: PgRow) -> StorageResult<AgentCapability> {
    Ok(AgentCapability {
        id: CapabilityId::from_uuid(col(&row, "id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        agent_id: AgentId::from_uuid(col(&row, "agent_id")?),
        capability_type: col(&row, "capability_type")?,
        scope: col(&row, "scope")?,
        granted_by: col::<Option<Uuid>>(&row, "granted_by")?.map(UserId::from_uuid),
        granted_at: col(&row, "granted_at")?,
        revoked_at: col(&row, "revoked_at")?,
        revoked_by: col::<Option<Uuid>>(&row, "revoked_by")?.map(UserId::from_uuid),
    })
}

fn capability_request_row(row: PgRow) -> StorageResult<CapabilityRequest> {
    let status: String = col(&row, "status")?;
    Ok(CapabilityRequest {
        id: CapabilityRequestId::from_uuid(col(&row, "id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        agent_id: AgentId::from_uuid(col(&row, "agent_id")?),
        capability_type: col(&row, "capability_type")?,
        scope: col(&row, "scope")?,
        justification: col(&row, "justification")?,
        status: parse_with(&status, CapabilityRequestStatus::parse, "request status")?,
        requested_by: col::<Option<Uuid>>(&row, "requested_by")?.map(UserId::from_uuid),
        requested_at: col(&row, "requested_at")?,
        decided_by: col::<Option<Uuid>>(&row, "decided_by")?.map(UserId::from_uuid),
        decided_at: col(&row, "decided_at")?,
    })
}

fn policy_row(row: PgRow) -> StorageResult<SecurityPolicy> {
    let policy_type: String = col(&row, "policy_type")?;
    let enforcement: String = col(&row, "enforcement_action")?;
    let severity: String = col(&row, "severity_threshold")?;
    let applies_to: AgentSelector = json_col(&row, "applies_to")?;
    Ok(SecurityPolicy {
        id: PolicyId::from_uuid(col(&row, "id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        name: col(&row, "name")?,
        policy_type: parse_with(&policy_type, PolicyType::parse, "policy type")?,
        enforcement_action: parse_with(&enforcement, EnforcementAction::parse, "enforcement")?,
        severity_threshold: parse_with(&severity, AlertSeverity::parse, "severity")?,
        rules: col(&row, "rules")?,
        applies_to,
        is_enabled: col(&row, "is_enabled")?,
        priority: col(&row, "priority")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

const EVENT_COLUMNS: &str = "id, organization_id, agent_id, protocol, verification_type, status, \
     result, signature, public_key, confidence, duration_ms, error_code, error_reason, \
     initiator_type, action, resource_type, resource_id, started_at, completed_at, metadata";

fn event_row(row: PgRow) -> StorageResult<VerificationEvent> {
    let protocol: String = col(&row, "protocol")?;
    let verification_type: String = col(&row, "verification_type")?;
    let status: String = col(&row, "status")?;
    let result: Option<String> = col(&row, "result")?;
    Ok(VerificationEvent {
        id: VerificationId::from_uuid(col(&row, "id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        agent_id: AgentId::from_uuid(col(&row, "agent_id")?),
        protocol: parse_with(&protocol, Protocol::parse, "protocol")?,
        verification_type: parse_with(&verification_type, VerificationType::parse, "type")?,
        status: parse_with(&status, VerificationStatus::parse, "status")?,
        result: result
            .map(|raw| parse_with(&raw, VerificationOutcome::parse, "result"))
            .transpose()?,
        signature: col(&row, "signature")?,
        public_key: col(&row, "public_key")?,
        confidence: col(&row, "confidence")?,
        duration_ms: col(&row, "duration_ms")?,
        error_code: col(&row, "error_code")?,
        error_reason: col(&row, "error_reason")?,
        initiator_type: col(&row, "initiator_type")?,
        action: col(&row, "action")?,
        resource_type: col(&row, "resource_type")?,
        resource_id: col(&row, "resource_id")?,
        started_at: col(&row, "started_at")?,
        completed_at: col(&row, "completed_at")?,
        metadata: col(&row, "metadata")?,
    })
}

fn audit_row(row: PgRow) -> StorageResult<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: col(&row, "id")?,
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        user_id: col::<Option<Uuid>>(&row, "user_id")?.map(UserId::from_uuid),
        action: col(&row, "action")?,
        entity_type: col(&row, "entity_type")?,
        entity_id: col(&row, "entity_id")?,
        ip: col(&row, "ip")?,
        user_agent: col(&row, "user_agent")?,
        metadata: col(&row, "metadata")?,
        timestamp: col(&row, "timestamp")?,
        sequence: col(&row, "sequence")?,
        previous_hash: col(&row, "previous_hash")?,
        hash: col(&row, "hash")?,
    })
}

fn alert_row(row: PgRow) -> StorageResult<Alert> {
    let severity: String = col(&row, "severity")?;
    Ok(Alert {
        id: AlertId::from_uuid(col(&row, "id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        alert_type: col(&row, "alert_type")?,
        severity: parse_with(&severity, AlertSeverity::parse, "severity")?,
        title: col(&row, "title")?,
        description: col(&row, "description")?,
        resource_type: col(&row, "resource_type")?,
        resource_id: col(&row, "resource_id")?,
        is_acknowledged: col(&row, "is_acknowledged")?,
        acknowledged_by: col::<Option<Uuid>>(&row, "acknowledged_by")?.map(UserId::from_uuid),
        acknowledged_at: col(&row, "acknowledged_at")?,
        resolved_at: col(&row, "resolved_at")?,
        resolution: col(&row, "resolution")?,
        created_at: col(&row, "created_at")?,
    })
}

fn mcp_row(row: PgRow) -> StorageResult<McpServer> {
    let status: String = col(&row, "verification_status")?;
    Ok(McpServer {
        id: McpServerId::from_uuid(col(&row, "id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        name: col(&row, "name")?,
        url: col(&row, "url")?,
        confidence_score: col(&row, "confidence_score")?,
        attestation_count: col(&row, "attestation_count")?,
        last_attested_at: col(&row, "last_attested_at")?,
        verification_status: parse_with(&status, McpVerificationStatus::parse, "mcp status")?,
        capabilities: json_col(&row, "capabilities")?,
        created_by: col::<Option<Uuid>>(&row, "created_by")?.map(UserId::from_uuid),
        created_at: col(&row, "created_at")?,
    })
}

fn attestation_row(row: PgRow) -> StorageResult<McpAttestation> {
    Ok(McpAttestation {
        id: aim_types::AttestationId::from_uuid(col(&row, "id")?),
        mcp_server_id: McpServerId::from_uuid(col(&row, "mcp_server_id")?),
        agent_id: AgentId::from_uuid(col(&row, "agent_id")?),
        capabilities_found: json_col(&row, "capabilities_found")?,
        connection_latency_ms: col(&row, "connection_latency_ms")?,
        signed_at: col(&row, "signed_at")?,
        signature: col(&row, "signature")?,
        verified: col(&row, "verified")?,
        created_at: col(&row, "created_at")?,
    })
}

fn connection_row(row: PgRow) -> StorageResult<AgentMcpConnection> {
    Ok(AgentMcpConnection {
        agent_id: AgentId::from_uuid(col(&row, "agent_id")?),
        mcp_server_id: McpServerId::from_uuid(col(&row, "mcp_server_id")?),
        attestation_count: col(&row, "attestation_count")?,
        last_attested_at: col(&row, "last_attested_at")?,
        created_at: col(&row, "created_at")?,
    })
}

fn trust_row(row: PgRow) -> StorageResult<TrustScoreHistory> {
    Ok(TrustScoreHistory {
        agent_id: AgentId::from_uuid(col(&row, "agent_id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        score: col(&row, "score")?,
        factors: json_col(&row, "factors")?,
        weights: json_col(&row, "weights")?,
        contributions: json_col(&row, "contributions")?,
        confidence: col(&row, "confidence")?,
        recorded_at: col(&row, "recorded_at")?,
        reason: col(&row, "reason")?,
    })
}

fn webhook_row(row: PgRow) -> StorageResult<Webhook> {
    Ok(Webhook {
        id: WebhookId::from_uuid(col(&row, "id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        url: col(&row, "url")?,
        secret: col(&row, "secret")?,
        event_types: json_col(&row, "event_types")?,
        is_enabled: col(&row, "is_enabled")?,
        max_attempts: col(&row, "max_attempts")?,
        created_at: col(&row, "created_at")?,
    })
}

fn delivery_row(row: PgRow) -> StorageResult<WebhookDelivery> {
    let status: String = col(&row, "status")?;
    Ok(WebhookDelivery {
        id: DeliveryId::from_uuid(col(&row, "id")?),
        webhook_id: WebhookId::from_uuid(col(&row, "webhook_id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        event_id: col(&row, "event_id")?,
        event_type: col(&row, "event_type")?,
        payload: col(&row, "payload")?,
        attempt_count: col(&row, "attempt_count")?,
        last_status_code: col(&row, "last_status_code")?,
        last_error: col(&row, "last_error")?,
        status: parse_with(&status, WebhookDeliveryStatus::parse, "delivery status")?,
        next_retry_at: col(&row, "next_retry_at")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

fn token_row(row: PgRow) -> StorageResult<SdkToken> {
    Ok(SdkToken {
        id: SdkTokenId::from_uuid(col(&row, "id")?),
        user_id: UserId::from_uuid(col(&row, "user_id")?),
        organization_id: OrganizationId::from_uuid(col(&row, "organization_id")?),
        token_hash: col(&row, "token_hash")?,
        token_id: col(&row, "token_id")?,
        device_name: col(&row, "device_name")?,
        device_fingerprint: col(&row, "device_fingerprint")?,
        created_at: col(&row, "created_at")?,
        expires_at: col(&row, "expires_at")?,
        revoked_at: col(&row, "revoked_at")?,
        revoke_reason: col(&row, "revoke_reason")?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[async_trait]
impl AgentStore for PgStore {
    async fn create_agent(&self, new: NewAgent) -> StorageResult<Agent> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO aim_agents
                (id, organization_id, name, display_name, status, public_key, api_key_hash,
                 key_created_at, talks_to, created_by, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $7)
            RETURNING {AGENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.organization_id.0)
        .bind(&new.name)
        .bind(&new.display_name)
        .bind(&new.public_key)
        .bind(&new.api_key_hash)
        .bind(now)
        .bind(to_json(&new.talks_to)?)
        .bind(new.created_by.map(|id| id.0))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        agent_row(row)
    }

    async fn get_agent(&self, id: &AgentId) -> StorageResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM aim_agents WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(agent_row).transpose()
    }

    async fn get_agent_scoped(
        &self,
        organization_id: &OrganizationId,
        id: &AgentId,
    ) -> StorageResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM aim_agents WHERE id = $1 AND organization_id = $2"
        ))
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(agent_row).transpose()
    }

    async fn find_agent_by_api_key_hash(&self, hash: &str) -> StorageResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM aim_agents WHERE api_key_hash = $1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(agent_row).transpose()
    }

    async fn list_agents(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Agent>> {
        let rows = if window.limit == 0 {
            sqlx::query(&format!(
                "SELECT {AGENT_COLUMNS} FROM aim_agents WHERE organization_id = $1
                 ORDER BY created_at DESC OFFSET $2"
            ))
            .bind(organization_id.0)
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(&format!(
                "SELECT {AGENT_COLUMNS} FROM aim_agents WHERE organization_id = $1
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
            ))
            .bind(organization_id.0)
            .bind(to_i64(window.limit)?)
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(agent_row).collect()
    }

    async fn update_agent_status(&self, id: &AgentId, status: AgentStatus) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE aim_agents SET status = $1, is_compromised = ($1 = 'compromised')
             WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }

    async fn rotate_agent_keys(
        &self,
        id: &AgentId,
        expected_version: i64,
        new_public_key: &str,
        grace_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<Agent> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE aim_agents
               SET previous_public_key = public_key,
                   public_key = $1,
                   key_created_at = $2,
                   key_rotation_grace_until = $3,
                   rotation_count = rotation_count + 1,
                   version = version + 1
             WHERE id = $4
               AND version = $5
            RETURNING {AGENT_COLUMNS}
            "#
        ))
        .bind(new_public_key)
        .bind(now)
        .bind(grace_until)
        .bind(id.0)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => agent_row(row),
            None => {
                if self.get_agent(id).await?.is_some() {
                    Err(StorageError::Conflict(format!(
                        "agent {id} was modified concurrently"
                    )))
                } else {
                    Err(StorageError::NotFound(format!("agent {id}")))
                }
            }
        }
    }

    async fn register_public_key(
        &self,
        id: &AgentId,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Agent> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE aim_agents
               SET public_key = $1, key_created_at = $2, version = version + 1
             WHERE id = $3
            RETURNING {AGENT_COLUMNS}
            "#
        ))
        .bind(public_key)
        .bind(now)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(agent_row)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound(format!("agent {id}")))
    }

    async fn touch_last_active(&self, id: &AgentId, now: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE aim_agents SET last_active = $1 WHERE id = $2")
            .bind(now)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn increment_violation_count(&self, id: &AgentId) -> StorageResult<()> {
        sqlx::query(
            "UPDATE aim_agents
                SET capability_violation_count = capability_violation_count + 1
              WHERE id = $1",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CapabilityStore for PgStore {
    async fn insert_grant(&self, grant: AgentCapability) -> StorageResult<AgentCapability> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Serialize concurrent grants of the same capability type.
        let existing = sqlx::query(
            "SELECT id FROM aim_capabilities
              WHERE agent_id = $1 AND capability_type = $2 AND revoked_at IS NULL
              FOR UPDATE",
        )
        .bind(grant.agent_id.0)
        .bind(&grant.capability_type)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if existing.is_some() {
            return Err(StorageError::Conflict(format!(
                "active grant for `{}` already exists",
                grant.capability_type
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO aim_capabilities
                (id, organization_id, agent_id, capability_type, scope, granted_by, granted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(grant.id.0)
        .bind(grant.organization_id.0)
        .bind(grant.agent_id.0)
        .bind(&grant.capability_type)
        .bind(&grant.scope)
        .bind(grant.granted_by.map(|id| id.0))
        .bind(grant.granted_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(grant)
    }

    async fn revoke_grant(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityId,
        revoked_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<AgentCapability> {
        let row = sqlx::query(
            r#"
            UPDATE aim_capabilities
               SET revoked_at = $1, revoked_by = $2
             WHERE id = $3 AND organization_id = $4 AND revoked_at IS NULL
            RETURNING id, organization_id, agent_id, capability_type, scope,
                      granted_by, granted_at, revoked_at, revoked_by
            "#,
        )
        .bind(now)
        .bind(revoked_by.map(|id| id.0))
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => capability_row(row),
            None => {
                if self.get_grant(organization_id, id).await?.is_some() {
                    Err(StorageError::InvariantViolation(format!(
                        "capability {id} is already revoked"
                    )))
                } else {
                    Err(StorageError::NotFound(format!("capability {id}")))
                }
            }
        }
    }

    async fn get_grant(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityId,
    ) -> StorageResult<Option<AgentCapability>> {
        let row = sqlx::query(
            "SELECT id, organization_id, agent_id, capability_type, scope,
                    granted_by, granted_at, revoked_at, revoked_by
               FROM aim_capabilities WHERE id = $1 AND organization_id = $2",
        )
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(capability_row).transpose()
    }

    async fn list_grants(
        &self,
        agent_id: &AgentId,
        active_only: bool,
    ) -> StorageResult<Vec<AgentCapability>> {
        let rows = if active_only {
            sqlx::query(
                "SELECT id, organization_id, agent_id, capability_type, scope,
                        granted_by, granted_at, revoked_at, revoked_by
                   FROM aim_capabilities
                  WHERE agent_id = $1 AND revoked_at IS NULL
                  ORDER BY granted_at DESC",
            )
            .bind(agent_id.0)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT id, organization_id, agent_id, capability_type, scope,
                        granted_by, granted_at, revoked_at, revoked_by
                   FROM aim_capabilities
                  WHERE agent_id = $1
                  ORDER BY granted_at DESC",
            )
            .bind(agent_id.0)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(capability_row).collect()
    }

    async fn create_capability_request(
        &self,
        request: CapabilityRequest,
    ) -> StorageResult<CapabilityRequest> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let pending = sqlx::query(
            "SELECT id FROM aim_capability_requests
              WHERE agent_id = $1 AND capability_type = $2 AND status = 'pending'
              FOR UPDATE",
        )
        .bind(request.agent_id.0)
        .bind(&request.capability_type)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if pending.is_some() {
            return Err(StorageError::Conflict(format!(
                "pending request for `{}` already exists",
                request.capability_type
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO aim_capability_requests
                (id, organization_id, agent_id, capability_type, scope, justification,
                 status, requested_by, requested_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(request.id.0)
        .bind(request.organization_id.0)
        .bind(request.agent_id.0)
        .bind(&request.capability_type)
        .bind(&request.scope)
        .bind(&request.justification)
        .bind(request.status.as_str())
        .bind(request.requested_by.map(|id| id.0))
        .bind(request.requested_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(request)
    }

    async fn get_capability_request(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityRequestId,
    ) -> StorageResult<Option<CapabilityRequest>> {
        let row = sqlx::query(
            "SELECT id, organization_id, agent_id, capability_type, scope, justification,
                    status, requested_by, requested_at, decided_by, decided_at
               FROM aim_capability_requests WHERE id = $1 AND organization_id = $2",
        )
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(capability_request_row).transpose()
    }

    async fn list_capability_requests(
        &self,
        organization_id: &OrganizationId,
        status: Option<CapabilityRequestStatus>,
        window: QueryWindow,
    ) -> StorageResult<Vec<CapabilityRequest>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, organization_id, agent_id, capability_type, scope, justification,
                    status, requested_by, requested_at, decided_by, decided_at
               FROM aim_capability_requests WHERE organization_id = ",
        );
        builder.push_bind(organization_id.0);
        if let Some(status) = status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY requested_at DESC");
        push_window(&mut builder, window);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(capability_request_row).collect()
    }

    async fn decide_capability_request(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityRequestId,
        approve: bool,
        decided_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<(CapabilityRequest, Option<AgentCapability>)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let new_status = if approve { "approved" } else { "rejected" };
        let row = sqlx::query(
            r#"
            UPDATE aim_capability_requests
               SET status = $1, decided_by = $2, decided_at = $3
             WHERE id = $4 AND organization_id = $5 AND status = 'pending'
            RETURNING id, organization_id, agent_id, capability_type, scope, justification,
                      status, requested_by, requested_at, decided_by, decided_at
            "#,
        )
        .bind(new_status)
        .bind(decided_by.map(|id| id.0))
        .bind(now)
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let request = match row {
            Some(row) => capability_request_row(row)?,
            None => {
                return if self.get_capability_request(organization_id, id).await?.is_some() {
                    Err(StorageError::InvariantViolation(format!(
                        "capability request {id} is already decided"
                    )))
                } else {
                    Err(StorageError::NotFound(format!("capability request {id}")))
                };
            }
        };

        let grant = if approve {
            let grant = AgentCapability {
                id: CapabilityId::generate(),
                organization_id: request.organization_id,
                agent_id: request.agent_id,
                capability_type: request.capability_type.clone(),
                scope: request.scope.clone(),
                granted_by: decided_by,
                granted_at: now,
                revoked_at: None,
                revoked_by: None,
            };
            sqlx::query(
                r#"
                INSERT INTO aim_capabilities
                    (id, organization_id, agent_id, capability_type, scope, granted_by, granted_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(grant.id.0)
            .bind(grant.organization_id.0)
            .bind(grant.agent_id.0)
            .bind(&grant.capability_type)
            .bind(&grant.scope)
            .bind(grant.granted_by.map(|id| id.0))
            .bind(grant.granted_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_conflict)?;
            Some(grant)
        } else {
            None
        };

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok((request, grant))
    }
}

#[async_trait]
impl PolicyStore for PgStore {
    async fn upsert_policy(&self, policy: SecurityPolicy) -> StorageResult<SecurityPolicy> {
        sqlx::query(
            r#"
            INSERT INTO aim_policies
                (id, organization_id, name, policy_type, enforcement_action, severity_threshold,
                 rules, applies_to, is_enabled, priority, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                policy_type = EXCLUDED.policy_type,
                enforcement_action = EXCLUDED.enforcement_action,
                severity_threshold = EXCLUDED.severity_threshold,
                rules = EXCLUDED.rules,
                applies_to = EXCLUDED.applies_to,
                is_enabled = EXCLUDED.is_enabled,
                priority = EXCLUDED.priority,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(policy.id.0)
        .bind(policy.organization_id.0)
        .bind(&policy.name)
        .bind(policy.policy_type.as_str())
        .bind(policy.enforcement_action.as_str())
        .bind(policy.severity_threshold.as_str())
        .bind(&policy.rules)
        .bind(to_json(&policy.applies_to)?)
        .bind(policy.is_enabled)
        .bind(policy.priority)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(policy)
    }

    async fn list_enabled_policies(
        &self,
        organization_id: &OrganizationId,
    ) -> StorageResult<Vec<SecurityPolicy>> {
        let rows = sqlx::query(
            "SELECT id, organization_id, name, policy_type, enforcement_action,
                    severity_threshold, rules, applies_to, is_enabled, priority,
                    created_at, updated_at
               FROM aim_policies
              WHERE organization_id = $1 AND is_enabled
              ORDER BY priority ASC",
        )
        .bind(organization_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(policy_row).collect()
    }

    async fn list_policies(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<SecurityPolicy>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, organization_id, name, policy_type, enforcement_action,
                    severity_threshold, rules, applies_to, is_enabled, priority,
                    created_at, updated_at
               FROM aim_policies WHERE organization_id = ",
        );
        builder.push_bind(organization_id.0);
        builder.push(" ORDER BY priority ASC");
        push_window(&mut builder, window);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(policy_row).collect()
    }

    async fn delete_policy(
        &self,
        organization_id: &OrganizationId,
        id: &PolicyId,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "DELETE FROM aim_policies WHERE id = $1 AND organization_id = $2",
        )
        .bind(id.0)
        .bind(organization_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("policy {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl VerificationEventStore for PgStore {
    async fn insert_event(&self, event: VerificationEvent) -> StorageResult<VerificationEvent> {
        sqlx::query(
            r#"
            INSERT INTO aim_verification_events
                (id, organization_id, agent_id, protocol, verification_type, status, result,
                 signature, public_key, confidence, duration_ms, error_code, error_reason,
                 initiator_type, action, resource_type, resource_id, started_at, completed_at,
                 metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20)
            "#,
        )
        .bind(event.id.0)
        .bind(event.organization_id.0)
        .bind(event.agent_id.0)
        .bind(event.protocol.as_str())
        .bind(event.verification_type.as_str())
        .bind(event.status.as_str())
        .bind(event.result.map(|result| result.as_str()))
        .bind(&event.signature)
        .bind(&event.public_key)
        .bind(event.confidence)
        .bind(event.duration_ms)
        .bind(&event.error_code)
        .bind(&event.error_reason)
        .bind(&event.initiator_type)
        .bind(&event.action)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(event.started_at)
        .bind(event.completed_at)
        .bind(&event.metadata)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(event)
    }

    async fn get_event(&self, id: &VerificationId) -> StorageResult<Option<VerificationEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM aim_verification_events WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(event_row).transpose()
    }

    async fn complete_event(
        &self,
        id: &VerificationId,
        status: VerificationStatus,
        result: VerificationOutcome,
        error_code: Option<String>,
        error_reason: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<VerificationEvent> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE aim_verification_events
               SET status = $1,
                   result = $2,
                   error_code = $3,
                   error_reason = $4,
                   completed_at = $5,
                   duration_ms = CAST(EXTRACT(EPOCH FROM ($5 - started_at)) * 1000 AS BIGINT)
             WHERE id = $6
               AND status = 'pending'
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(result.as_str())
        .bind(&error_code)
        .bind(&error_reason)
        .bind(completed_at)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => event_row(row),
            None => {
                if self.get_event(id).await?.is_some() {
                    Err(StorageError::InvariantViolation(format!(
                        "verification event {id} is already terminal"
                    )))
                } else {
                    Err(StorageError::NotFound(format!("verification event {id}")))
                }
            }
        }
    }

    async fn list_events(
        &self,
        filter: &VerificationFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<VerificationEvent>> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT {EVENT_COLUMNS} FROM aim_verification_events WHERE TRUE"
        ));
        apply_event_filter(&mut builder, filter);
        builder.push(" ORDER BY started_at DESC, id DESC");
        push_window(&mut builder, window);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(event_row).collect()
    }

    async fn count_events(&self, filter: &VerificationFilter) -> StorageResult<i64> {
        let mut builder =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM aim_verification_events WHERE TRUE");
        apply_event_filter(&mut builder, filter);
        let row = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        col(&row, "total")
    }

    async fn pending_status_counts(
        &self,
        organization_id: &OrganizationId,
    ) -> StorageResult<PendingStatusCounts> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                   COUNT(*) FILTER (WHERE status = 'success') AS success,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed
              FROM aim_verification_events
             WHERE organization_id = $1
            "#,
        )
        .bind(organization_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(PendingStatusCounts {
            pending: col(&row, "pending")?,
            success: col(&row, "success")?,
            failed: col(&row, "failed")?,
        })
    }

    async fn verification_stats(
        &self,
        organization_id: &OrganizationId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<VerificationStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'success') AS success,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                   COALESCE(AVG(duration_ms), 0)::DOUBLE PRECISION AS avg_duration_ms
              FROM aim_verification_events
             WHERE organization_id = $1 AND started_at >= $2 AND started_at <= $3
            "#,
        )
        .bind(organization_id.0)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut stats = VerificationStats {
            total: col(&row, "total")?,
            success: col(&row, "success")?,
            failed: col(&row, "failed")?,
            pending: col(&row, "pending")?,
            avg_duration_ms: col(&row, "avg_duration_ms")?,
            ..Default::default()
        };

        let by_protocol = sqlx::query(
            "SELECT protocol, COUNT(*) AS total FROM aim_verification_events
              WHERE organization_id = $1 AND started_at >= $2 AND started_at <= $3
              GROUP BY protocol",
        )
        .bind(organization_id.0)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        for row in by_protocol {
            stats
                .by_protocol
                .insert(col(&row, "protocol")?, col(&row, "total")?);
        }

        let by_type = sqlx::query(
            "SELECT verification_type, COUNT(*) AS total FROM aim_verification_events
              WHERE organization_id = $1 AND started_at >= $2 AND started_at <= $3
              GROUP BY verification_type",
        )
        .bind(organization_id.0)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        for row in by_type {
            stats
                .by_type
                .insert(col(&row, "verification_type")?, col(&row, "total")?);
        }

        Ok(stats)
    }

    async fn count_agent_events_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM aim_verification_events
              WHERE agent_id = $1 AND started_at >= $2",
        )
        .bind(agent_id.0)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        col(&row, "total")
    }

    async fn agent_event_stats(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<AgentEventStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS attempts,
                   COUNT(*) FILTER (WHERE status = 'success') AS successes,
                   COUNT(DISTINCT date_trunc('hour', started_at))
                       FILTER (WHERE status = 'success') AS active_hours
              FROM aim_verification_events
             WHERE agent_id = $1 AND started_at >= $2
            "#,
        )
        .bind(agent_id.0)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(AgentEventStats {
            attempts: col(&row, "attempts")?,
            successes: col(&row, "successes")?,
            active_hours: col(&row, "active_hours")?,
        })
    }

    async fn recent_agent_events(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<VerificationEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM aim_verification_events
              WHERE agent_id = $1 AND started_at >= $2
              ORDER BY started_at DESC LIMIT $3"
        ))
        .bind(agent_id.0)
        .bind(since)
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(event_row).collect()
    }
}

fn apply_event_filter(builder: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &VerificationFilter) {
    if let Some(org) = &filter.organization_id {
        builder.push(" AND organization_id = ");
        builder.push_bind(org.0);
    }
    if let Some(agent) = &filter.agent_id {
        builder.push(" AND agent_id = ");
        builder.push_bind(agent.0);
    }
    if let Some(mcp) = &filter.mcp_server_id {
        builder.push(" AND metadata->>'mcp_server_id' = ");
        builder.push_bind(mcp.0.to_string());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(protocol) = filter.protocol {
        builder.push(" AND protocol = ");
        builder.push_bind(protocol.as_str());
    }
    if let Some(action) = &filter.action {
        builder.push(" AND action = ");
        builder.push_bind(action.clone());
    }
    if let Some(from) = filter.from {
        builder.push(" AND started_at >= ");
        builder.push_bind(from);
    }
    if let Some(to) = filter.to {
        builder.push(" AND started_at <= ");
        builder.push_bind(to);
    }
    if filter.pending_approval_only {
        builder.push(" AND status = 'pending' AND result IS NULL");
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", search.to_lowercase());
        builder.push(" AND (LOWER(action) LIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR LOWER(COALESCE(metadata->>'agent_name', '')) LIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditLogEntry> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // The chain head is serialized with an exclusive table lock, as the
        // sequence and previous_hash must be read-then-write consistent.
        sqlx::query("LOCK TABLE aim_audit_log IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let last =
            sqlx::query("SELECT sequence, hash FROM aim_audit_log ORDER BY sequence DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

        let (sequence, previous_hash) = match last {
            Some(row) => (
                col::<i64>(&row, "sequence")? + 1,
                Some(col::<String>(&row, "hash")?),
            ),
            None => (1, None),
        };

        let hash = compute_audit_hash(&event, previous_hash.as_deref(), sequence)?;
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            organization_id: event.organization_id,
            user_id: event.user_id,
            action: event.action,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            ip: event.ip,
            user_agent: event.user_agent,
            metadata: event.metadata,
            timestamp: event.timestamp,
            sequence,
            previous_hash,
            hash,
        };

        sqlx::query(
            r#"
            INSERT INTO aim_audit_log
                (id, sequence, organization_id, user_id, action, entity_type, entity_id,
                 ip, user_agent, metadata, timestamp, previous_hash, hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.sequence)
        .bind(entry.organization_id.0)
        .bind(entry.user_id.map(|id| id.0))
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(&entry.metadata)
        .bind(entry.timestamp)
        .bind(&entry.previous_hash)
        .bind(&entry.hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(entry)
    }

    async fn list_audit(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, sequence, organization_id, user_id, action, entity_type, entity_id,
                    ip, user_agent, metadata, timestamp, previous_hash, hash
               FROM aim_audit_log WHERE organization_id = ",
        );
        builder.push_bind(organization_id.0);
        builder.push(" ORDER BY sequence DESC");
        push_window(&mut builder, window);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(audit_row).collect()
    }

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>> {
        let row = sqlx::query("SELECT hash FROM aim_audit_log ORDER BY sequence DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(|row| col(&row, "hash")).transpose()
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert(&self, alert: Alert) -> StorageResult<Alert> {
        sqlx::query(
            r#"
            INSERT INTO aim_alerts
                (id, organization_id, alert_type, severity, title, description,
                 resource_type, resource_id, is_acknowledged, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $9)
            "#,
        )
        .bind(alert.id.0)
        .bind(alert.organization_id.0)
        .bind(&alert.alert_type)
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(&alert.resource_type)
        .bind(&alert.resource_id)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(alert)
    }

    async fn get_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
    ) -> StorageResult<Option<Alert>> {
        let row = sqlx::query(
            "SELECT id, organization_id, alert_type, severity, title, description,
                    resource_type, resource_id, is_acknowledged, acknowledged_by,
                    acknowledged_at, resolved_at, resolution, created_at
               FROM aim_alerts WHERE id = $1 AND organization_id = $2",
        )
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(alert_row).transpose()
    }

    async fn list_alerts(
        &self,
        organization_id: &OrganizationId,
        filter: &AlertFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<Alert>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, organization_id, alert_type, severity, title, description,
                    resource_type, resource_id, is_acknowledged, acknowledged_by,
                    acknowledged_at, resolved_at, resolution, created_at
               FROM aim_alerts WHERE organization_id = ",
        );
        builder.push_bind(organization_id.0);
        if let Some(severity) = filter.severity {
            builder.push(" AND severity = ");
            builder.push_bind(severity.as_str());
        }
        if let Some(acknowledged) = filter.is_acknowledged {
            builder.push(" AND is_acknowledged = ");
            builder.push_bind(acknowledged);
        }
        if filter.unresolved_only {
            builder.push(" AND resolved_at IS NULL");
        }
        builder.push(" ORDER BY created_at DESC");
        push_window(&mut builder, window);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(alert_row).collect()
    }

    async fn acknowledge_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
        acknowledged_by: UserId,
        now: DateTime<Utc>,
    ) -> StorageResult<Alert> {
        let row = sqlx::query(
            r#"
            UPDATE aim_alerts
               SET is_acknowledged = TRUE, acknowledged_by = $1, acknowledged_at = $2
             WHERE id = $3 AND organization_id = $4 AND NOT is_acknowledged
            RETURNING id, organization_id, alert_type, severity, title, description,
                      resource_type, resource_id, is_acknowledged, acknowledged_by,
                      acknowledged_at, resolved_at, resolution, created_at
            "#,
        )
        .bind(acknowledged_by.0)
        .bind(now)
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => alert_row(row),
            None => {
                if self.get_alert(organization_id, id).await?.is_some() {
                    Err(StorageError::InvariantViolation(format!(
                        "alert {id} is already acknowledged"
                    )))
                } else {
                    Err(StorageError::NotFound(format!("alert {id}")))
                }
            }
        }
    }

    async fn resolve_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
        resolution: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Alert> {
        let row = sqlx::query(
            r#"
            UPDATE aim_alerts
               SET resolved_at = $1, resolution = $2
             WHERE id = $3 AND organization_id = $4 AND resolved_at IS NULL
            RETURNING id, organization_id, alert_type, severity, title, description,
                      resource_type, resource_id, is_acknowledged, acknowledged_by,
                      acknowledged_at, resolved_at, resolution, created_at
            "#,
        )
        .bind(now)
        .bind(resolution)
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => alert_row(row),
            None => {
                if self.get_alert(organization_id, id).await?.is_some() {
                    Err(StorageError::InvariantViolation(format!(
                        "alert {id} is already resolved"
                    )))
                } else {
                    Err(StorageError::NotFound(format!("alert {id}")))
                }
            }
        }
    }

    async fn count_agent_alerts_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM aim_alerts
              WHERE resource_type = 'agent' AND resource_id = $1 AND created_at >= $2",
        )
        .bind(agent_id.0.to_string())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        col(&row, "total")
    }

    async fn count_agent_alerts_by_type_since(
        &self,
        agent_id: &AgentId,
        alert_type: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM aim_alerts
              WHERE alert_type = $1 AND resource_type = 'agent' AND resource_id = $2
                AND created_at >= $3",
        )
        .bind(alert_type)
        .bind(agent_id.0.to_string())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        col(&row, "total")
    }

    async fn insert_violation(&self, violation: CapabilityViolation) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aim_capability_violations
                (id, organization_id, agent_id, action, resource, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(violation.id)
        .bind(violation.organization_id.0)
        .bind(violation.agent_id.0)
        .bind(&violation.action)
        .bind(&violation.resource)
        .bind(violation.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn count_agent_violations_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM aim_capability_violations
              WHERE agent_id = $1 AND created_at >= $2",
        )
        .bind(agent_id.0)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        col(&row, "total")
    }
}

#[async_trait]
impl AttestationStore for PgStore {
    async fn create_mcp_server(&self, new: NewMcpServer) -> StorageResult<McpServer> {
        let row = sqlx::query(
            r#"
            INSERT INTO aim_mcp_servers
                (id, organization_id, name, url, capabilities, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, organization_id, name, url, confidence_score, attestation_count,
                      last_attested_at, verification_status, capabilities, created_by, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.organization_id.0)
        .bind(&new.name)
        .bind(&new.url)
        .bind(to_json(&new.capabilities)?)
        .bind(new.created_by.map(|id| id.0))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        mcp_row(row)
    }

    async fn get_mcp_server(&self, id: &McpServerId) -> StorageResult<Option<McpServer>> {
        let row = sqlx::query(
            "SELECT id, organization_id, name, url, confidence_score, attestation_count,
                    last_attested_at, verification_status, capabilities, created_by, created_at
               FROM aim_mcp_servers WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(mcp_row).transpose()
    }

    async fn get_mcp_server_scoped(
        &self,
        organization_id: &OrganizationId,
        id: &McpServerId,
    ) -> StorageResult<Option<McpServer>> {
        let row = sqlx::query(
            "SELECT id, organization_id, name, url, confidence_score, attestation_count,
                    last_attested_at, verification_status, capabilities, created_by, created_at
               FROM aim_mcp_servers WHERE id = $1 AND organization_id = $2",
        )
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(mcp_row).transpose()
    }

    async fn list_mcp_servers(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<McpServer>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, organization_id, name, url, confidence_score, attestation_count,
                    last_attested_at, verification_status, capabilities, created_by, created_at
               FROM aim_mcp_servers WHERE organization_id = ",
        );
        builder.push_bind(organization_id.0);
        builder.push(" ORDER BY created_at DESC");
        push_window(&mut builder, window);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(mcp_row).collect()
    }

    async fn apply_attestation(
        &self,
        attestation: McpAttestation,
        sample: f64,
        penalty: f64,
        alpha: f64,
        status: McpVerificationStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<(f64, i64)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO aim_attestations
                (id, mcp_server_id, agent_id, capabilities_found, connection_latency_ms,
                 signed_at, signature, verified, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attestation.id.0)
        .bind(attestation.mcp_server_id.0)
        .bind(attestation.agent_id.0)
        .bind(to_json(&attestation.capabilities_found)?)
        .bind(attestation.connection_latency_ms)
        .bind(attestation.signed_at)
        .bind(&attestation.signature)
        .bind(attestation.verified)
        .bind(attestation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        sqlx::query(
            r#"
            INSERT INTO aim_agent_mcp_connections
                (agent_id, mcp_server_id, attestation_count, last_attested_at, created_at)
            VALUES ($1, $2, 1, $3, $3)
            ON CONFLICT (agent_id, mcp_server_id) DO UPDATE SET
                attestation_count = aim_agent_mcp_connections.attestation_count + 1,
                last_attested_at = EXCLUDED.last_attested_at
            "#,
        )
        .bind(attestation.agent_id.0)
        .bind(attestation.mcp_server_id.0)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        // The confidence fold happens inside one statement: concurrent
        // attestations each read the value their UPDATE sees under row lock.
        let row = sqlx::query(
            r#"
            UPDATE aim_mcp_servers
               SET confidence_score = LEAST(1.0, GREATEST(0.0,
                       confidence_score * (1.0 - $1) + $2 * $1 - $3)),
                   attestation_count = attestation_count + 1,
                   last_attested_at = $4,
                   verification_status = $5
             WHERE id = $6
            RETURNING confidence_score, attestation_count
            "#,
        )
        .bind(alpha)
        .bind(sample)
        .bind(penalty)
        .bind(now)
        .bind(status.as_str())
        .bind(attestation.mcp_server_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?
        .ok_or_else(|| {
            StorageError::NotFound(format!("mcp server {}", attestation.mcp_server_id))
        })?;

        let confidence: f64 = col(&row, "confidence_score")?;
        let count: i64 = col(&row, "attestation_count")?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok((confidence, count))
    }

    async fn list_attestations(
        &self,
        mcp_server_id: &McpServerId,
        window: QueryWindow,
    ) -> StorageResult<Vec<McpAttestation>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, mcp_server_id, agent_id, capabilities_found, connection_latency_ms,
                    signed_at, signature, verified, created_at
               FROM aim_attestations WHERE mcp_server_id = ",
        );
        builder.push_bind(mcp_server_id.0);
        builder.push(" ORDER BY created_at DESC");
        push_window(&mut builder, window);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(attestation_row).collect()
    }

    async fn connected_agents(
        &self,
        mcp_server_id: &McpServerId,
    ) -> StorageResult<Vec<AgentMcpConnection>> {
        let rows = sqlx::query(
            "SELECT agent_id, mcp_server_id, attestation_count, last_attested_at, created_at
               FROM aim_agent_mcp_connections
              WHERE mcp_server_id = $1
              ORDER BY last_attested_at DESC",
        )
        .bind(mcp_server_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(connection_row).collect()
    }
}

#[async_trait]
impl TrustStore for PgStore {
    async fn record_trust_score(&self, history: TrustScoreHistory) -> StorageResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO aim_trust_history
                (id, agent_id, organization_id, score, factors, weights, contributions,
                 confidence, recorded_at, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(history.agent_id.0)
        .bind(history.organization_id.0)
        .bind(history.score)
        .bind(to_json(&history.factors)?)
        .bind(to_json(&history.weights)?)
        .bind(to_json(&history.contributions)?)
        .bind(history.confidence)
        .bind(history.recorded_at)
        .bind(&history.reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let result = sqlx::query("UPDATE aim_agents SET trust_score = $1 WHERE id = $2")
            .bind(history.score)
            .bind(history.agent_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "agent {}",
                history.agent_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn latest_trust(&self, agent_id: &AgentId) -> StorageResult<Option<TrustScoreHistory>> {
        let row = sqlx::query(
            "SELECT agent_id, organization_id, score, factors, weights, contributions,
                    confidence, recorded_at, reason
               FROM aim_trust_history
              WHERE agent_id = $1
              ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(agent_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(trust_row).transpose()
    }

    async fn trust_history(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> StorageResult<Vec<TrustScoreHistory>> {
        let rows = sqlx::query(
            "SELECT agent_id, organization_id, score, factors, weights, contributions,
                    confidence, recorded_at, reason
               FROM aim_trust_history
              WHERE agent_id = $1
              ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(agent_id.0)
        .bind(to_i64(if limit == 0 { 100 } else { limit })?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(trust_row).collect()
    }
}

#[async_trait]
impl WebhookStore for PgStore {
    async fn create_webhook(&self, webhook: Webhook) -> StorageResult<Webhook> {
        sqlx::query(
            r#"
            INSERT INTO aim_webhooks
                (id, organization_id, url, secret, event_types, is_enabled, max_attempts,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(webhook.id.0)
        .bind(webhook.organization_id.0)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(to_json(&webhook.event_types)?)
        .bind(webhook.is_enabled)
        .bind(webhook.max_attempts)
        .bind(webhook.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(webhook)
    }

    async fn get_webhook(
        &self,
        organization_id: &OrganizationId,
        id: &WebhookId,
    ) -> StorageResult<Option<Webhook>> {
        let row = sqlx::query(
            "SELECT id, organization_id, url, secret, event_types, is_enabled, max_attempts,
                    created_at
               FROM aim_webhooks WHERE id = $1 AND organization_id = $2",
        )
        .bind(id.0)
        .bind(organization_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(webhook_row).transpose()
    }

    async fn list_webhooks(&self, organization_id: &OrganizationId) -> StorageResult<Vec<Webhook>> {
        let rows = sqlx::query(
            "SELECT id, organization_id, url, secret, event_types, is_enabled, max_attempts,
                    created_at
               FROM aim_webhooks WHERE organization_id = $1 ORDER BY created_at DESC",
        )
        .bind(organization_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(webhook_row).collect()
    }

    async fn update_webhook(&self, webhook: Webhook) -> StorageResult<Webhook> {
        let result = sqlx::query(
            r#"
            UPDATE aim_webhooks
               SET url = $1, secret = $2, event_types = $3, is_enabled = $4, max_attempts = $5
             WHERE id = $6 AND organization_id = $7
            "#,
        )
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(to_json(&webhook.event_types)?)
        .bind(webhook.is_enabled)
        .bind(webhook.max_attempts)
        .bind(webhook.id.0)
        .bind(webhook.organization_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("webhook {}", webhook.id)));
        }
        Ok(webhook)
    }

    async fn delete_webhook(
        &self,
        organization_id: &OrganizationId,
        id: &WebhookId,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "DELETE FROM aim_webhooks WHERE id = $1 AND organization_id = $2",
        )
        .bind(id.0)
        .bind(organization_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("webhook {id}")));
        }
        Ok(())
    }

    async fn enabled_webhooks_for_event(
        &self,
        organization_id: &OrganizationId,
        event_type: &str,
    ) -> StorageResult<Vec<Webhook>> {
        let rows = sqlx::query(
            r#"
            SELECT id, organization_id, url, secret, event_types, is_enabled, max_attempts,
                   created_at
              FROM aim_webhooks
             WHERE organization_id = $1
               AND is_enabled
               AND (event_types ? $2 OR event_types ? '*')
            "#,
        )
        .bind(organization_id.0)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(webhook_row).collect()
    }

    async fn insert_delivery(&self, delivery: WebhookDelivery) -> StorageResult<WebhookDelivery> {
        sqlx::query(
            r#"
            INSERT INTO aim_webhook_deliveries
                (id, webhook_id, organization_id, event_id, event_type, payload, attempt_count,
                 last_status_code, last_error, status, next_retry_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(delivery.id.0)
        .bind(delivery.webhook_id.0)
        .bind(delivery.organization_id.0)
        .bind(delivery.event_id)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(delivery.attempt_count)
        .bind(delivery.last_status_code)
        .bind(&delivery.last_error)
        .bind(delivery.status.as_str())
        .bind(delivery.next_retry_at)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(delivery)
    }

    async fn record_delivery_attempt(
        &self,
        id: &DeliveryId,
        status: WebhookDeliveryStatus,
        status_code: Option<i32>,
        error: Option<String>,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StorageResult<WebhookDelivery> {
        let row = sqlx::query(
            r#"
            UPDATE aim_webhook_deliveries
               SET attempt_count = attempt_count + 1,
                   status = $1,
                   last_status_code = $2,
                   last_error = $3,
                   next_retry_at = $4,
                   updated_at = $5
             WHERE id = $6
            RETURNING id, webhook_id, organization_id, event_id, event_type, payload,
                      attempt_count, last_status_code, last_error, status, next_retry_at,
                      created_at, updated_at
            "#,
        )
        .bind(status.as_str())
        .bind(status_code)
        .bind(&error)
        .bind(next_retry_at)
        .bind(now)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(delivery_row)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound(format!("delivery {id}")))
    }

    async fn list_deliveries(
        &self,
        webhook_id: &WebhookId,
        window: QueryWindow,
    ) -> StorageResult<Vec<WebhookDelivery>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, webhook_id, organization_id, event_id, event_type, payload,
                    attempt_count, last_status_code, last_error, status, next_retry_at,
                    created_at, updated_at
               FROM aim_webhook_deliveries WHERE webhook_id = ",
        );
        builder.push_bind(webhook_id.0);
        builder.push(" ORDER BY created_at DESC");
        push_window(&mut builder, window);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(delivery_row).collect()
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query(
            "SELECT id, webhook_id, organization_id, event_id, event_type, payload,
                    attempt_count, last_status_code, last_error, status, next_retry_at,
                    created_at, updated_at
               FROM aim_webhook_deliveries
              WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)
              ORDER BY created_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(to_i64(if limit == 0 { 100 } else { limit })?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(delivery_row).collect()
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_token(&self, token: SdkToken) -> StorageResult<SdkToken> {
        sqlx::query(
            r#"
            INSERT INTO aim_sdk_tokens
                (id, user_id, organization_id, token_hash, token_id, device_name,
                 device_fingerprint, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(token.id.0)
        .bind(token.user_id.0)
        .bind(token.organization_id.0)
        .bind(&token.token_hash)
        .bind(&token.token_id)
        .bind(&token.device_name)
        .bind(&token.device_fingerprint)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(token)
    }

    async fn get_token(&self, id: &SdkTokenId) -> StorageResult<Option<SdkToken>> {
        let row = sqlx::query(
            "SELECT id, user_id, organization_id, token_hash, token_id, device_name,
                    device_fingerprint, created_at, expires_at, revoked_at, revoke_reason
               FROM aim_sdk_tokens WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(token_row).transpose()
    }

    async fn find_token_by_hash(&self, token_hash: &str) -> StorageResult<Option<SdkToken>> {
        let row = sqlx::query(
            "SELECT id, user_id, organization_id, token_hash, token_id, device_name,
                    device_fingerprint, created_at, expires_at, revoked_at, revoke_reason
               FROM aim_sdk_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(token_row).transpose()
    }

    async fn revoke_token(
        &self,
        id: &SdkTokenId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<SdkToken> {
        let row = sqlx::query(
            r#"
            UPDATE aim_sdk_tokens
               SET revoked_at = $1, revoke_reason = $2
             WHERE id = $3 AND revoked_at IS NULL
            RETURNING id, user_id, organization_id, token_hash, token_id, device_name,
                      device_fingerprint, created_at, expires_at, revoked_at, revoke_reason
            "#,
        )
        .bind(now)
        .bind(reason)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => token_row(row),
            None => {
                if self.get_token(id).await?.is_some() {
                    Err(StorageError::InvariantViolation(format!(
                        "token {id} is already revoked"
                    )))
                } else {
                    Err(StorageError::NotFound(format!("token {id}")))
                }
            }
        }
    }

    async fn rotate_token(
        &self,
        new_token: SdkToken,
        old_id: &SdkTokenId,
        now: DateTime<Utc>,
    ) -> StorageResult<SdkToken> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // New token first: a crash before the revoke leaves both usable,
        // which rotation semantics allow; "both revoked" cannot happen.
        sqlx::query(
            r#"
            INSERT INTO aim_sdk_tokens
                (id, user_id, organization_id, token_hash, token_id, device_name,
                 device_fingerprint, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(new_token.id.0)
        .bind(new_token.user_id.0)
        .bind(new_token.organization_id.0)
        .bind(&new_token.token_hash)
        .bind(&new_token.token_id)
        .bind(&new_token.device_name)
        .bind(&new_token.device_fingerprint)
        .bind(new_token.created_at)
        .bind(new_token.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        let revoked = sqlx::query(
            "UPDATE aim_sdk_tokens SET revoked_at = $1, revoke_reason = 'rotated'
              WHERE id = $2 AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(old_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if revoked.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "token {old_id} was rotated concurrently"
            )));
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(new_token)
    }
}
