//! In-memory storage backend.
//!
//! Used by tests and the development profile. Mirrors the PostgreSQL
//! backend's semantics exactly, including conflict detection, conditional
//! transitions, and the audit hash chain.

use crate::model::{
    AgentEventStats, AlertFilter, NewAgent, NewMcpServer, PendingStatusCounts, QueryWindow,
    VerificationFilter, VerificationStats,
};
use crate::traits::{
    AgentStore, AlertStore, AttestationStore, AuditStore, CapabilityStore, PolicyStore, TokenStore,
    TrustStore, VerificationEventStore, WebhookStore,
};
use crate::{StorageError, StorageResult};
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
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    agents: HashMap<AgentId, Agent>,
    grants: Vec<AgentCapability>,
    capability_requests: Vec<CapabilityRequest>,
    policies: Vec<SecurityPolicy>,
    events: Vec<VerificationEvent>,
    audit: Vec<AuditLogEntry>,
    alerts: Vec<Alert>,
    violations: Vec<CapabilityViolation>,
    mcp_servers: HashMap<McpServerId, McpServer>,
    attestations: Vec<McpAttestation>,
    connections: HashMap<(AgentId, McpServerId), AgentMcpConnection>,
    trust_history: Vec<TrustScoreHistory>,
    webhooks: HashMap<WebhookId, Webhook>,
    deliveries: HashMap<DeliveryId, WebhookDelivery>,
    tokens: HashMap<SdkTokenId, SdkToken>,
}

/// In-memory control-plane store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T: Clone>(items: &[T], window: QueryWindow) -> Vec<T> {
    let iter = items.iter().skip(window.offset);
    if window.limit == 0 {
        iter.cloned().collect()
    } else {
        iter.take(window.limit).cloned().collect()
    }
}

fn event_matches(event: &VerificationEvent, filter: &VerificationFilter) -> bool {
    if let Some(org) = &filter.organization_id {
        if &event.organization_id != org {
            return false;
        }
    }
    if let Some(agent) = &filter.agent_id {
        if &event.agent_id != agent {
            return false;
        }
    }
    if let Some(mcp) = &filter.mcp_server_id {
        let recorded = event
            .metadata
            .get("mcp_server_id")
            .and_then(|value| value.as_str());
        if recorded != Some(mcp.to_string().as_str()) {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if event.status != status {
            return false;
        }
    }
    if let Some(protocol) = filter.protocol {
        if event.protocol != protocol {
            return false;
        }
    }
    if let Some(action) = &filter.action {
        if &event.action != action {
            return false;
        }
    }
    if let Some(from) = filter.from {
        if event.started_at < from {
            return false;
        }
    }
    if let Some(to) = filter.to {
        if event.started_at > to {
            return false;
        }
    }
    if filter.pending_approval_only
        && (event.status != VerificationStatus::Pending || event.result.is_some())
    {
        return false;
    }
    if let Some(search) = &filter.search {
        let needle = search.to_lowercase();
        let name = event
            .metadata
            .get("agent_name")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_lowercase();
        if !event.action.to_lowercase().contains(&needle) && !name.contains(&needle) {
            return false;
        }
    }
    true
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn create_agent(&self, new: NewAgent) -> StorageResult<Agent> {
        let mut state = self.inner.write().await;
        if state
            .agents
            .values()
            .any(|agent| agent.organization_id == new.organization_id && agent.name == new.name)
        {
            return Err(StorageError::Conflict(format!(
                "agent name `{}` already exists in organization",
                new.name
            )));
        }
        let now = Utc::now();
        let agent = Agent {
            id: AgentId::generate(),
            organization_id: new.organization_id,
            name: new.name,
            display_name: new.display_name,
            status: AgentStatus::Pending,
            public_key: new.public_key,
            api_key_hash: new.api_key_hash,
            previous_public_key: None,
            key_created_at: now,
            key_expires_at: None,
            key_rotation_grace_until: None,
            rotation_count: 0,
            trust_score: 0.5,
            capability_violation_count: 0,
            is_compromised: false,
            talks_to: new.talks_to,
            last_active: None,
            created_by: new.created_by,
            created_at: now,
            version: 0,
        };
        state.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: &AgentId) -> StorageResult<Option<Agent>> {
        Ok(self.inner.read().await.agents.get(id).cloned())
    }

    async fn get_agent_scoped(
        &self,
        organization_id: &OrganizationId,
        id: &AgentId,
    ) -> StorageResult<Option<Agent>> {
        Ok(self
            .inner
            .read()
            .await
            .agents
            .get(id)
            .filter(|agent| &agent.organization_id == organization_id)
            .cloned())
    }

    async fn find_agent_by_api_key_hash(&self, hash: &str) -> StorageResult<Option<Agent>> {
        Ok(self
            .inner
            .read()
            .await
            .agents
            .values()
            .find(|agent| agent.api_key_hash.as_deref() == Some(hash))
            .cloned())
    }

    async fn list_agents(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Agent>> {
        let state = self.inner.read().await;
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|agent| &agent.organization_id == organization_id)
            .cloned()
            .collect();
        agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(&agents, window))
    }

    async fn update_agent_status(&self, id: &AgentId, status: AgentStatus) -> StorageResult<()> {
        let mut state = self.inner.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("agent {id}")))?;
        agent.status = status;
        agent.is_compromised = status == AgentStatus::Compromised;
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
        let mut state = self.inner.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("agent {id}")))?;
        if agent.version != expected_version {
            return Err(StorageError::Conflict(format!(
                "agent {id} was modified concurrently"
            )));
        }
        agent.previous_public_key = Some(std::mem::replace(
            &mut agent.public_key,
            new_public_key.to_string(),
        ));
        agent.key_created_at = now;
        agent.key_rotation_grace_until = Some(grace_until);
        agent.rotation_count += 1;
        agent.version += 1;
        Ok(agent.clone())
    }

    async fn register_public_key(
        &self,
        id: &AgentId,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Agent> {
        let mut state = self.inner.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("agent {id}")))?;
        agent.public_key = public_key.to_string();
        agent.key_created_at = now;
        agent.version += 1;
        Ok(agent.clone())
    }

    async fn touch_last_active(&self, id: &AgentId, now: DateTime<Utc>) -> StorageResult<()> {
        let mut state = self.inner.write().await;
        if let Some(agent) = state.agents.get_mut(id) {
            agent.last_active = Some(now);
        }
        Ok(())
    }

    async fn increment_violation_count(&self, id: &AgentId) -> StorageResult<()> {
        let mut state = self.inner.write().await;
        if let Some(agent) = state.agents.get_mut(id) {
            agent.capability_violation_count += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl CapabilityStore for MemoryStore {
    async fn insert_grant(&self, grant: AgentCapability) -> StorageResult<AgentCapability> {
        let mut state = self.inner.write().await;
        if state.grants.iter().any(|existing| {
            existing.agent_id == grant.agent_id
                && existing.capability_type == grant.capability_type
                && existing.is_active()
        }) {
            return Err(StorageError::Conflict(format!(
                "active grant for `{}` already exists",
                grant.capability_type
            )));
        }
        state.grants.push(grant.clone());
        Ok(grant)
    }

    async fn revoke_grant(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityId,
        revoked_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<AgentCapability> {
        let mut state = self.inner.write().await;
        let grant = state
            .grants
            .iter_mut()
            .find(|grant| &grant.id == id && &grant.organization_id == organization_id)
            .ok_or_else(|| StorageError::NotFound(format!("capability {id}")))?;
        if !grant.is_active() {
            return Err(StorageError::InvariantViolation(format!(
                "capability {id} is already revoked"
            )));
        }
        grant.revoked_at = Some(now);
        grant.revoked_by = revoked_by;
        Ok(grant.clone())
    }

    async fn get_grant(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityId,
    ) -> StorageResult<Option<AgentCapability>> {
        Ok(self
            .inner
            .read()
            .await
            .grants
            .iter()
            .find(|grant| &grant.id == id && &grant.organization_id == organization_id)
            .cloned())
    }

    async fn list_grants(
        &self,
        agent_id: &AgentId,
        active_only: bool,
    ) -> StorageResult<Vec<AgentCapability>> {
        Ok(self
            .inner
            .read()
            .await
            .grants
            .iter()
            .filter(|grant| &grant.agent_id == agent_id && (!active_only || grant.is_active()))
            .cloned()
            .collect())
    }

    async fn create_capability_request(
        &self,
        request: CapabilityRequest,
    ) -> StorageResult<CapabilityRequest> {
        let mut state = self.inner.write().await;
        if state.capability_requests.iter().any(|existing| {
            existing.agent_id == request.agent_id
                && existing.capability_type == request.capability_type
                && existing.status == CapabilityRequestStatus::Pending
        }) {
            return Err(StorageError::Conflict(format!(
                "pending request for `{}` already exists",
                request.capability_type
            )));
        }
        state.capability_requests.push(request.clone());
        Ok(request)
    }

    async fn get_capability_request(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityRequestId,
    ) -> StorageResult<Option<CapabilityRequest>> {
        Ok(self
            .inner
            .read()
            .await
            .capability_requests
            .iter()
            .find(|request| &request.id == id && &request.organization_id == organization_id)
            .cloned())
    }

    async fn list_capability_requests(
        &self,
        organization_id: &OrganizationId,
        status: Option<CapabilityRequestStatus>,
        window: QueryWindow,
    ) -> StorageResult<Vec<CapabilityRequest>> {
        let state = self.inner.read().await;
        let mut requests: Vec<CapabilityRequest> = state
            .capability_requests
            .iter()
            .filter(|request| {
                &request.organization_id == organization_id
                    && status.map_or(true, |status| request.status == status)
            })
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(page(&requests, window))
    }

    async fn decide_capability_request(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityRequestId,
        approve: bool,
        decided_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<(CapabilityRequest, Option<AgentCapability>)> {
        let mut state = self.inner.write().await;
        let request = state
            .capability_requests
            .iter_mut()
            .find(|request| &request.id == id && &request.organization_id == organization_id)
            .ok_or_else(|| StorageError::NotFound(format!("capability request {id}")))?;
        if request.status != CapabilityRequestStatus::Pending {
            return Err(StorageError::InvariantViolation(format!(
                "capability request {id} is already decided"
            )));
        }
        request.status = if approve {
            CapabilityRequestStatus::Approved
        } else {
            CapabilityRequestStatus::Rejected
        };
        request.decided_by = decided_by;
        request.decided_at = Some(now);
        let request = request.clone();

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
            state.grants.push(grant.clone());
            Some(grant)
        } else {
            None
        };
        Ok((request, grant))
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn upsert_policy(&self, policy: SecurityPolicy) -> StorageResult<SecurityPolicy> {
        let mut state = self.inner.write().await;
        state.policies.retain(|existing| existing.id != policy.id);
        state.policies.push(policy.clone());
        Ok(policy)
    }

    async fn list_enabled_policies(
        &self,
        organization_id: &OrganizationId,
    ) -> StorageResult<Vec<SecurityPolicy>> {
        let state = self.inner.read().await;
        let mut policies: Vec<SecurityPolicy> = state
            .policies
            .iter()
            .filter(|policy| &policy.organization_id == organization_id && policy.is_enabled)
            .cloned()
            .collect();
        policies.sort_by_key(|policy| policy.priority);
        Ok(policies)
    }

    async fn list_policies(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<SecurityPolicy>> {
        let state = self.inner.read().await;
        let mut policies: Vec<SecurityPolicy> = state
            .policies
            .iter()
            .filter(|policy| &policy.organization_id == organization_id)
            .cloned()
            .collect();
        policies.sort_by_key(|policy| policy.priority);
        Ok(page(&policies, window))
    }

    async fn delete_policy(
        &self,
        organization_id: &OrganizationId,
        id: &PolicyId,
    ) -> StorageResult<()> {
        let mut state = self.inner.write().await;
        let before = state.policies.len();
        state
            .policies
            .retain(|policy| !(&policy.id == id && &policy.organization_id == organization_id));
        if state.policies.len() == before {
            return Err(StorageError::NotFound(format!("policy {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl VerificationEventStore for MemoryStore {
    async fn insert_event(&self, event: VerificationEvent) -> StorageResult<VerificationEvent> {
        let mut state = self.inner.write().await;
        state.events.push(event.clone());
        Ok(event)
    }

    async fn get_event(&self, id: &VerificationId) -> StorageResult<Option<VerificationEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .iter()
            .find(|event| &event.id == id)
            .cloned())
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
        let mut state = self.inner.write().await;
        let event = state
            .events
            .iter_mut()
            .find(|event| &event.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("verification event {id}")))?;
        if event.status.is_terminal() {
            return Err(StorageError::InvariantViolation(format!(
                "verification event {id} is already terminal"
            )));
        }
        event.status = status;
        event.result = Some(result);
        event.error_code = error_code;
        event.error_reason = error_reason;
        event.completed_at = Some(completed_at);
        event.duration_ms = Some((completed_at - event.started_at).num_milliseconds());
        Ok(event.clone())
    }

    async fn list_events(
        &self,
        filter: &VerificationFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<VerificationEvent>> {
        let state = self.inner.read().await;
        let mut events: Vec<VerificationEvent> = state
            .events
            .iter()
            .filter(|event| event_matches(event, filter))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(page(&events, window))
    }

    async fn count_events(&self, filter: &VerificationFilter) -> StorageResult<i64> {
        let state = self.inner.read().await;
        Ok(state
            .events
            .iter()
            .filter(|event| event_matches(event, filter))
            .count() as i64)
    }

    async fn pending_status_counts(
        &self,
        organization_id: &OrganizationId,
    ) -> StorageResult<PendingStatusCounts> {
        let state = self.inner.read().await;
        let mut counts = PendingStatusCounts::default();
        for event in state
            .events
            .iter()
            .filter(|event| &event.organization_id == organization_id)
        {
            match event.status {
                VerificationStatus::Pending => counts.pending += 1,
                VerificationStatus::Success => counts.success += 1,
                VerificationStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn verification_stats(
        &self,
        organization_id: &OrganizationId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<VerificationStats> {
        let state = self.inner.read().await;
        let mut stats = VerificationStats::default();
        let mut duration_total = 0i64;
        let mut duration_count = 0i64;
        for event in state.events.iter().filter(|event| {
            &event.organization_id == organization_id
                && event.started_at >= from
                && event.started_at <= to
        }) {
            stats.total += 1;
            match event.status {
                VerificationStatus::Pending => stats.pending += 1,
                VerificationStatus::Success => stats.success += 1,
                VerificationStatus::Failed => stats.failed += 1,
            }
            if let Some(duration) = event.duration_ms {
                duration_total += duration;
                duration_count += 1;
            }
            *stats
                .by_protocol
                .entry(event.protocol.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_type
                .entry(event.verification_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        if duration_count > 0 {
            stats.avg_duration_ms = duration_total as f64 / duration_count as f64;
        }
        Ok(stats)
    }

    async fn count_agent_events_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let state = self.inner.read().await;
        Ok(state
            .events
            .iter()
            .filter(|event| &event.agent_id == agent_id && event.started_at >= since)
            .count() as i64)
    }

    async fn agent_event_stats(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<AgentEventStats> {
        let state = self.inner.read().await;
        let mut stats = AgentEventStats::default();
        let mut hours: BTreeSet<String> = BTreeSet::new();
        for event in state
            .events
            .iter()
            .filter(|event| &event.agent_id == agent_id && event.started_at >= since)
        {
            stats.attempts += 1;
            if event.status == VerificationStatus::Success {
                stats.successes += 1;
                hours.insert(event.started_at.format("%Y-%m-%dT%H").to_string());
            }
        }
        stats.active_hours = hours.len() as i64;
        Ok(stats)
    }

    async fn recent_agent_events(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<VerificationEvent>> {
        let state = self.inner.read().await;
        let mut events: Vec<VerificationEvent> = state
            .events
            .iter()
            .filter(|event| &event.agent_id == agent_id && event.started_at >= since)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        events.truncate(limit);
        Ok(events)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditLogEntry> {
        let mut state = self.inner.write().await;
        let sequence = state.audit.last().map_or(1, |last| last.sequence + 1);
        let previous_hash = state.audit.last().map(|last| last.hash.clone());
        let hash = crate::model::compute_audit_hash(&event, previous_hash.as_deref(), sequence)?;
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
        state.audit.push(entry.clone());
        Ok(entry)
    }

    async fn list_audit(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        let state = self.inner.read().await;
        let mut entries: Vec<AuditLogEntry> = state
            .audit
            .iter()
            .filter(|entry| &entry.organization_id == organization_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(page(&entries, window))
    }

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>> {
        Ok(self.inner.read().await.audit.last().map(|entry| entry.hash.clone()))
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: Alert) -> StorageResult<Alert> {
        let mut state = self.inner.write().await;
        state.alerts.push(alert.clone());
        Ok(alert)
    }

    async fn get_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
    ) -> StorageResult<Option<Alert>> {
        Ok(self
            .inner
            .read()
            .await
            .alerts
            .iter()
            .find(|alert| &alert.id == id && &alert.organization_id == organization_id)
            .cloned())
    }

    async fn list_alerts(
        &self,
        organization_id: &OrganizationId,
        filter: &AlertFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<Alert>> {
        let state = self.inner.read().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|alert| {
                &alert.organization_id == organization_id
                    && filter.severity.map_or(true, |severity| alert.severity == severity)
                    && filter
                        .is_acknowledged
                        .map_or(true, |acknowledged| alert.is_acknowledged == acknowledged)
                    && (!filter.unresolved_only || alert.resolved_at.is_none())
            })
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(&alerts, window))
    }

    async fn acknowledge_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
        acknowledged_by: UserId,
        now: DateTime<Utc>,
    ) -> StorageResult<Alert> {
        let mut state = self.inner.write().await;
        let alert = state
            .alerts
            .iter_mut()
            .find(|alert| &alert.id == id && &alert.organization_id == organization_id)
            .ok_or_else(|| StorageError::NotFound(format!("alert {id}")))?;
        if alert.is_acknowledged {
            return Err(StorageError::InvariantViolation(format!(
                "alert {id} is already acknowledged"
            )));
        }
        alert.is_acknowledged = true;
        alert.acknowledged_by = Some(acknowledged_by);
        alert.acknowledged_at = Some(now);
        Ok(alert.clone())
    }

    async fn resolve_alert(
        &self,
        organization_id: &OrganizationId,
        id: &AlertId,
        resolution: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Alert> {
        let mut state = self.inner.write().await;
        let alert = state
            .alerts
            .iter_mut()
            .find(|alert| &alert.id == id && &alert.organization_id == organization_id)
            .ok_or_else(|| StorageError::NotFound(format!("alert {id}")))?;
        if alert.resolved_at.is_some() {
            return Err(StorageError::InvariantViolation(format!(
                "alert {id} is already resolved"
            )));
        }
        alert.resolved_at = Some(now);
        alert.resolution = Some(resolution.to_string());
        Ok(alert.clone())
    }

    async fn count_agent_alerts_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let agent_id = agent_id.to_string();
        let state = self.inner.read().await;
        Ok(state
            .alerts
            .iter()
            .filter(|alert| {
                alert.resource_type.as_deref() == Some("agent")
                    && alert.resource_id.as_deref() == Some(agent_id.as_str())
                    && alert.created_at >= since
            })
            .count() as i64)
    }

    async fn count_agent_alerts_by_type_since(
        &self,
        agent_id: &AgentId,
        alert_type: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let agent_id = agent_id.to_string();
        let state = self.inner.read().await;
        Ok(state
            .alerts
            .iter()
            .filter(|alert| {
                alert.alert_type == alert_type
                    && alert.resource_type.as_deref() == Some("agent")
                    && alert.resource_id.as_deref() == Some(agent_id.as_str())
                    && alert.created_at >= since
            })
            .count() as i64)
    }

    async fn insert_violation(&self, violation: CapabilityViolation) -> StorageResult<()> {
        let mut state = self.inner.write().await;
        state.violations.push(violation);
        Ok(())
    }

    async fn count_agent_violations_since(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let state = self.inner.read().await;
        Ok(state
            .violations
            .iter()
            .filter(|violation| &violation.agent_id == agent_id && violation.created_at >= since)
            .count() as i64)
    }
}

#[async_trait]
impl AttestationStore for MemoryStore {
    async fn create_mcp_server(&self, new: NewMcpServer) -> StorageResult<McpServer> {
        let mut state = self.inner.write().await;
        if state.mcp_servers.values().any(|server| {
            server.organization_id == new.organization_id
                && (server.url == new.url || server.name == new.name)
        }) {
            return Err(StorageError::Conflict(format!(
                "MCP server `{}` already registered",
                new.url
            )));
        }
        let server = McpServer {
            id: McpServerId::generate(),
            organization_id: new.organization_id,
            name: new.name,
            url: new.url,
            confidence_score: 0.5,
            attestation_count: 0,
            last_attested_at: None,
            verification_status: McpVerificationStatus::Unverified,
            capabilities: new.capabilities,
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        state.mcp_servers.insert(server.id, server.clone());
        Ok(server)
    }

    async fn get_mcp_server(&self, id: &McpServerId) -> StorageResult<Option<McpServer>> {
        Ok(self.inner.read().await.mcp_servers.get(id).cloned())
    }

    async fn get_mcp_server_scoped(
        &self,
        organization_id: &OrganizationId,
        id: &McpServerId,
    ) -> StorageResult<Option<McpServer>> {
        Ok(self
            .inner
            .read()
            .await
            .mcp_servers
            .get(id)
            .filter(|server| &server.organization_id == organization_id)
            .cloned())
    }

    async fn list_mcp_servers(
        &self,
        organization_id: &OrganizationId,
        window: QueryWindow,
    ) -> StorageResult<Vec<McpServer>> {
        let state = self.inner.read().await;
        let mut servers: Vec<McpServer> = state
            .mcp_servers
            .values()
            .filter(|server| &server.organization_id == organization_id)
            .cloned()
            .collect();
        servers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(&servers, window))
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
        let mut state = self.inner.write().await;
        let server = state
            .mcp_servers
            .get_mut(&attestation.mcp_server_id)
            .ok_or_else(|| {
                StorageError::NotFound(format!("mcp server {}", attestation.mcp_server_id))
            })?;
        let blended = (1.0 - alpha) * server.confidence_score + alpha * sample - penalty;
        server.confidence_score = blended.clamp(0.0, 1.0);
        server.attestation_count += 1;
        server.last_attested_at = Some(now);
        server.verification_status = status;
        let confidence = server.confidence_score;
        let count = server.attestation_count;

        let key = (attestation.agent_id, attestation.mcp_server_id);
        state
            .connections
            .entry(key)
            .and_modify(|connection| {
                connection.attestation_count += 1;
                connection.last_attested_at = now;
            })
            .or_insert_with(|| AgentMcpConnection {
                agent_id: attestation.agent_id,
                mcp_server_id: attestation.mcp_server_id,
                attestation_count: 1,
                last_attested_at: now,
                created_at: now,
            });
        state.attestations.push(attestation);
        Ok((confidence, count))
    }

    async fn list_attestations(
        &self,
        mcp_server_id: &McpServerId,
        window: QueryWindow,
    ) -> StorageResult<Vec<McpAttestation>> {
        let state = self.inner.read().await;
        let mut attestations: Vec<McpAttestation> = state
            .attestations
            .iter()
            .filter(|attestation| &attestation.mcp_server_id == mcp_server_id)
            .cloned()
            .collect();
        attestations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(&attestations, window))
    }

    async fn connected_agents(
        &self,
        mcp_server_id: &McpServerId,
    ) -> StorageResult<Vec<AgentMcpConnection>> {
        let state = self.inner.read().await;
        let mut connections: Vec<AgentMcpConnection> = state
            .connections
            .values()
            .filter(|connection| &connection.mcp_server_id == mcp_server_id)
            .cloned()
            .collect();
        connections.sort_by(|a, b| b.last_attested_at.cmp(&a.last_attested_at));
        Ok(connections)
    }
}

#[async_trait]
impl TrustStore for MemoryStore {
    async fn record_trust_score(&self, history: TrustScoreHistory) -> StorageResult<()> {
        let mut state = self.inner.write().await;
        let agent = state
            .agents
            .get_mut(&history.agent_id)
            .ok_or_else(|| StorageError::NotFound(format!("agent {}", history.agent_id)))?;
        agent.trust_score = history.score;
        state.trust_history.push(history);
        Ok(())
    }

    async fn latest_trust(&self, agent_id: &AgentId) -> StorageResult<Option<TrustScoreHistory>> {
        let state = self.inner.read().await;
        Ok(state
            .trust_history
            .iter()
            .filter(|row| &row.agent_id == agent_id)
            .max_by_key(|row| row.recorded_at)
            .cloned())
    }

    async fn trust_history(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> StorageResult<Vec<TrustScoreHistory>> {
        let state = self.inner.read().await;
        let mut rows: Vec<TrustScoreHistory> = state
            .trust_history
            .iter()
            .filter(|row| &row.agent_id == agent_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        if limit > 0 {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn create_webhook(&self, webhook: Webhook) -> StorageResult<Webhook> {
        let mut state = self.inner.write().await;
        state.webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    async fn get_webhook(
        &self,
        organization_id: &OrganizationId,
        id: &WebhookId,
    ) -> StorageResult<Option<Webhook>> {
        Ok(self
            .inner
            .read()
            .await
            .webhooks
            .get(id)
            .filter(|webhook| &webhook.organization_id == organization_id)
            .cloned())
    }

    async fn list_webhooks(&self, organization_id: &OrganizationId) -> StorageResult<Vec<Webhook>> {
        let state = self.inner.read().await;
        let mut webhooks: Vec<Webhook> = state
            .webhooks
            .values()
            .filter(|webhook| &webhook.organization_id == organization_id)
            .cloned()
            .collect();
        webhooks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(webhooks)
    }

    async fn update_webhook(&self, webhook: Webhook) -> StorageResult<Webhook> {
        let mut state = self.inner.write().await;
        if !state.webhooks.contains_key(&webhook.id) {
            return Err(StorageError::NotFound(format!("webhook {}", webhook.id)));
        }
        state.webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    async fn delete_webhook(
        &self,
        organization_id: &OrganizationId,
        id: &WebhookId,
    ) -> StorageResult<()> {
        let mut state = self.inner.write().await;
        match state.webhooks.get(id) {
            Some(webhook) if &webhook.organization_id == organization_id => {
                state.webhooks.remove(id);
                Ok(())
            }
            _ => Err(StorageError::NotFound(format!("webhook {id}"))),
        }
    }

    async fn enabled_webhooks_for_event(
        &self,
        organization_id: &OrganizationId,
        event_type: &str,
    ) -> StorageResult<Vec<Webhook>> {
        let state = self.inner.read().await;
        Ok(state
            .webhooks
            .values()
            .filter(|webhook| {
                &webhook.organization_id == organization_id
                    && webhook.is_enabled
                    && webhook.subscribes_to(event_type)
            })
            .cloned()
            .collect())
    }

    async fn insert_delivery(&self, delivery: WebhookDelivery) -> StorageResult<WebhookDelivery> {
        let mut state = self.inner.write().await;
        state.deliveries.insert(delivery.id, delivery.clone());
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
        let mut state = self.inner.write().await;
        let delivery = state
            .deliveries
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("delivery {id}")))?;
        delivery.attempt_count += 1;
        delivery.status = status;
        delivery.last_status_code = status_code;
        delivery.last_error = error;
        delivery.next_retry_at = next_retry_at;
        delivery.updated_at = now;
        Ok(delivery.clone())
    }

    async fn list_deliveries(
        &self,
        webhook_id: &WebhookId,
        window: QueryWindow,
    ) -> StorageResult<Vec<WebhookDelivery>> {
        let state = self.inner.read().await;
        let mut deliveries: Vec<WebhookDelivery> = state
            .deliveries
            .values()
            .filter(|delivery| &delivery.webhook_id == webhook_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(&deliveries, window))
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<WebhookDelivery>> {
        let state = self.inner.read().await;
        let mut due: Vec<WebhookDelivery> = state
            .deliveries
            .values()
            .filter(|delivery| {
                delivery.status == WebhookDeliveryStatus::Pending
                    && delivery.next_retry_at.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if limit > 0 {
            due.truncate(limit);
        }
        Ok(due)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: SdkToken) -> StorageResult<SdkToken> {
        let mut state = self.inner.write().await;
        state.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn get_token(&self, id: &SdkTokenId) -> StorageResult<Option<SdkToken>> {
        Ok(self.inner.read().await.tokens.get(id).cloned())
    }

    async fn find_token_by_hash(&self, token_hash: &str) -> StorageResult<Option<SdkToken>> {
        Ok(self
            .inner
            .read()
            .await
            .tokens
            .values()
            .find(|token| token.token_hash == token_hash)
            .cloned())
    }

    async fn revoke_token(
        &self,
        id: &SdkTokenId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<SdkToken> {
        let mut state = self.inner.write().await;
        let token = state
            .tokens
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("token {id}")))?;
        if token.is_revoked() {
            return Err(StorageError::InvariantViolation(format!(
                "token {id} is already revoked"
            )));
        }
        token.revoked_at = Some(now);
        token.revoke_reason = Some(reason.to_string());
        Ok(token.clone())
    }

    async fn rotate_token(
        &self,
        new_token: SdkToken,
        old_id: &SdkTokenId,
        now: DateTime<Utc>,
    ) -> StorageResult<SdkToken> {
        let mut state = self.inner.write().await;
        match state.tokens.get(old_id) {
            None => return Err(StorageError::NotFound(format!("token {old_id}"))),
            Some(old) if old.revoked_at.is_some() => {
                return Err(StorageError::Conflict(format!(
                    "token {old_id} was rotated concurrently"
                )));
            }
            Some(_) => {}
        }
        state.tokens.insert(new_token.id, new_token.clone());
        if let Some(old) = state.tokens.get_mut(old_id) {
            old.revoked_at = Some(now);
            old.revoke_reason = Some("rotated".to_string());
        }
        Ok(new_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_types::{Protocol, VerificationType};

    fn new_agent(org: OrganizationId) -> NewAgent {
        NewAgent {
            organization_id: org,
            name: "worker".to_string(),
            display_name: "Worker".to_string(),
            public_key: "pk".to_string(),
            api_key_hash: None,
            talks_to: vec![],
            created_by: None,
        }
    }

    fn pending_event(org: OrganizationId, agent: AgentId) -> VerificationEvent {
        VerificationEvent {
            id: VerificationId::generate(),
            organization_id: org,
            agent_id: agent,
            protocol: Protocol::Mcp,
            verification_type: VerificationType::Capability,
            status: VerificationStatus::Pending,
            result: None,
            signature: None,
            public_key: None,
            confidence: 0.8,
            duration_ms: None,
            error_code: None,
            error_reason: None,
            initiator_type: "agent".to_string(),
            action: "read_database".to_string(),
            resource_type: None,
            resource_id: None,
            started_at: Utc::now(),
            completed_at: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn duplicate_agent_name_conflicts() {
        let store = MemoryStore::new();
        let org = OrganizationId::generate();
        store.create_agent(new_agent(org)).await.unwrap();
        let result = store.create_agent(new_agent(org)).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn event_transition_is_single_shot() {
        let store = MemoryStore::new();
        let org = OrganizationId::generate();
        let agent = store.create_agent(new_agent(org)).await.unwrap();
        let event = store.insert_event(pending_event(org, agent.id)).await.unwrap();

        store
            .complete_event(
                &event.id,
                VerificationStatus::Success,
                VerificationOutcome::Verified,
                None,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        let again = store
            .complete_event(
                &event.id,
                VerificationStatus::Failed,
                VerificationOutcome::Denied,
                None,
                None,
                Utc::now(),
            )
            .await;
        assert!(matches!(again, Err(StorageError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn rotation_is_version_checked() {
        let store = MemoryStore::new();
        let org = OrganizationId::generate();
        let agent = store.create_agent(new_agent(org)).await.unwrap();
        let grace = Utc::now() + chrono::Duration::hours(24);

        store
            .rotate_agent_keys(&agent.id, agent.version, "new-key", grace, Utc::now())
            .await
            .unwrap();

        // Re-running with the stale version must conflict.
        let stale = store
            .rotate_agent_keys(&agent.id, agent.version, "another-key", grace, Utc::now())
            .await;
        assert!(matches!(stale, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn trust_record_updates_agent_and_history_together() {
        let store = MemoryStore::new();
        let org = OrganizationId::generate();
        let agent = store.create_agent(new_agent(org)).await.unwrap();

        let history = TrustScoreHistory {
            agent_id: agent.id,
            organization_id: org,
            score: 0.73,
            factors: Default::default(),
            weights: Default::default(),
            contributions: Default::default(),
            confidence: 0.6,
            recorded_at: Utc::now(),
            reason: "recalculated".to_string(),
        };
        store.record_trust_score(history).await.unwrap();

        let agent = store.get_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(agent.trust_score, 0.73);
        assert_eq!(store.trust_history(&agent.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_attestations_all_count() {
        let store = MemoryStore::new();
        let org = OrganizationId::generate();
        let agent = store.create_agent(new_agent(org)).await.unwrap();
        let server = store
            .create_mcp_server(NewMcpServer {
                organization_id: org,
                name: "files".to_string(),
                url: "https://mcp.example.com".to_string(),
                capabilities: vec!["read_files".to_string()],
                created_by: None,
            })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let agent_id = agent.id;
            let server_id = server.id;
            handles.push(tokio::spawn(async move {
                let attestation = McpAttestation {
                    id: aim_types::AttestationId::generate(),
                    mcp_server_id: server_id,
                    agent_id,
                    capabilities_found: vec!["read_files".to_string()],
                    connection_latency_ms: 5,
                    signed_at: Utc::now(),
                    signature: "sig".to_string(),
                    verified: true,
                    created_at: Utc::now(),
                };
                store
                    .apply_attestation(
                        attestation,
                        1.0,
                        0.0,
                        0.2,
                        McpVerificationStatus::Attested,
                        Utc::now(),
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let server = store.get_mcp_server(&server.id).await.unwrap().unwrap();
        assert_eq!(server.attestation_count, 8);
        let rows = store
            .list_attestations(&server.id, QueryWindow { limit: 0, offset: 0 })
            .await
            .unwrap();
        assert_eq!(rows.len() as i64, server.attestation_count);
        let connections = store.connected_agents(&server.id).await.unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].attestation_count, 8);
    }

    #[tokio::test]
    async fn audit_chain_links_hashes() {
        let store = MemoryStore::new();
        let org = OrganizationId::generate();
        let first = store
            .append_audit(AuditAppend {
                organization_id: org,
                user_id: None,
                action: "agent.created".to_string(),
                entity_type: "agent".to_string(),
                entity_id: "a1".to_string(),
                ip: None,
                user_agent: None,
                metadata: serde_json::json!({}),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        let second = store
            .append_audit(AuditAppend {
                organization_id: org,
                user_id: None,
                action: "agent.suspended".to_string(),
                entity_type: "agent".to_string(),
                entity_id: "a1".to_string(),
                ip: None,
                user_agent: None,
                metadata: serde_json::json!({}),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(second.previous_hash.as_deref(), Some(first.hash.as_str()));
        assert_eq!(second.sequence, first.sequence + 1);
    }
}
