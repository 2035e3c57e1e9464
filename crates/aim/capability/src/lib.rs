//! AIM Capability - grant management and scope matching (C2).
//!
//! `has_capability` is true iff an active grant exists whose
//! `capability_type` equals the action type and whose scope predicate
//! matches the requested resource. An empty scope matches everything.

#![deny(unsafe_code)]

pub mod scope;

pub use scope::{glob_matches, scope_matches};

use aim_storage::{CapabilityStore, ControlPlaneStore, StorageResult};
use aim_types::{
    AgentCapability, AgentId, CapabilityId, OrganizationId, UserId,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Capability store front-end used by the decision pipeline and the HTTP
/// surface.
#[derive(Clone)]
pub struct CapabilityService {
    store: Arc<dyn ControlPlaneStore>,
}

impl CapabilityService {
    pub fn new(store: Arc<dyn ControlPlaneStore>) -> Self {
        Self { store }
    }

    /// Grant a capability to an agent. Duplicate active grants for the same
    /// (agent, type) conflict at the storage layer.
    pub async fn grant(
        &self,
        organization_id: OrganizationId,
        agent_id: AgentId,
        capability_type: impl Into<String>,
        scope: Value,
        granted_by: Option<UserId>,
    ) -> StorageResult<AgentCapability> {
        let capability_type = capability_type.into();
        let grant = AgentCapability {
            id: CapabilityId::generate(),
            organization_id,
            agent_id,
            capability_type: capability_type.clone(),
            scope,
            granted_by,
            granted_at: Utc::now(),
            revoked_at: None,
            revoked_by: None,
        };
        let grant = self.store.insert_grant(grant).await?;
        tracing::info!(agent_id = %agent_id, capability = %capability_type, "granted capability");
        Ok(grant)
    }

    pub async fn revoke(
        &self,
        organization_id: &OrganizationId,
        id: &CapabilityId,
        revoked_by: Option<UserId>,
    ) -> StorageResult<AgentCapability> {
        let grant = self
            .store
            .revoke_grant(organization_id, id, revoked_by, Utc::now())
            .await?;
        tracing::info!(
            agent_id = %grant.agent_id,
            capability = %grant.capability_type,
            "revoked capability"
        );
        Ok(grant)
    }

    pub async fn list(
        &self,
        agent_id: &AgentId,
        active_only: bool,
    ) -> StorageResult<Vec<AgentCapability>> {
        self.store.list_grants(agent_id, active_only).await
    }

    /// Whether the agent currently holds a grant covering this action and
    /// resource.
    pub async fn has_capability(
        &self,
        agent_id: &AgentId,
        action_type: &str,
        resource: Option<&str>,
        context: &BTreeMap<String, Value>,
    ) -> StorageResult<bool> {
        let grants = self.store.list_grants(agent_id, true).await?;
        Ok(grants.iter().any(|grant| {
            grant.capability_type == action_type
                && scope_matches(&grant.scope, resource, context)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_storage::{AgentStore, MemoryStore, NewAgent, StorageError};
    use serde_json::json;

    async fn setup() -> (CapabilityService, OrganizationId, AgentId) {
        let store = Arc::new(MemoryStore::new());
        let org = OrganizationId::generate();
        let agent = store
            .create_agent(NewAgent {
                organization_id: org,
                name: "worker".to_string(),
                display_name: "Worker".to_string(),
                public_key: "pk".to_string(),
                api_key_hash: None,
                talks_to: vec![],
                created_by: None,
            })
            .await
            .unwrap();
        (CapabilityService::new(store), org, agent.id)
    }

    #[tokio::test]
    async fn grant_then_revoke_round_trip() {
        let (service, org, agent) = setup().await;
        let grant = service
            .grant(org, agent, "read_database", json!({}), None)
            .await
            .unwrap();
        assert!(service
            .has_capability(&agent, "read_database", Some("db://x"), &BTreeMap::new())
            .await
            .unwrap());

        service.revoke(&org, &grant.id, None).await.unwrap();
        assert!(!service
            .has_capability(&agent, "read_database", Some("db://x"), &BTreeMap::new())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn duplicate_active_grant_conflicts() {
        let (service, org, agent) = setup().await;
        service
            .grant(org, agent, "send_email", json!({}), None)
            .await
            .unwrap();
        let duplicate = service.grant(org, agent, "send_email", json!({}), None).await;
        assert!(matches!(duplicate, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn scoped_grant_only_matches_inside_scope() {
        let (service, org, agent) = setup().await;
        service
            .grant(
                org,
                agent,
                "read_database",
                json!({"resource_prefix": "db://reporting"}),
                None,
            )
            .await
            .unwrap();

        assert!(service
            .has_capability(
                &agent,
                "read_database",
                Some("db://reporting/daily"),
                &BTreeMap::new()
            )
            .await
            .unwrap());
        assert!(!service
            .has_capability(
                &agent,
                "read_database",
                Some("db://billing/cards"),
                &BTreeMap::new()
            )
            .await
            .unwrap());
    }
}
