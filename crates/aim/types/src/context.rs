//! Request and task contexts.
//!
//! `RequestContext` is a small immutable struct passed explicitly through
//! the request path. Background tasks receive a `TaskContext` built from
//! copied values only; they must never hold a reference to request state.

use crate::ids::{AgentId, OrganizationId, UserId};
use serde::{Deserialize, Serialize};

/// How the caller authenticated. Classified once, by the auth middleware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Bearer JWT issued to a human user.
    UserJwt,
    /// `X-AIM-API-Key` header resolved to an agent.
    ApiKey,
    /// Ed25519-signed request body (public agent endpoints).
    AgentSignature,
}

/// Role claimed by a user JWT.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Manager,
    Member,
    Viewer,
}

impl UserRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "admin" => Some(Self::Admin),
            "manager" => Some(Self::Manager),
            "member" => Some(Self::Member),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Member => "member",
            Self::Viewer => "viewer",
        }
    }

    /// Admin-only surfaces: pending adjudication, trust overrides,
    /// capability-request decisions.
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    pub fn can_mutate(&self) -> bool {
        matches!(self, Self::Admin | Self::Manager | Self::Member)
    }
}

/// Per-request identity, set by the auth middleware.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub organization_id: OrganizationId,
    pub user_id: Option<UserId>,
    pub role: Option<UserRole>,
    pub agent_id: Option<AgentId>,
    pub auth_method: AuthMethod,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Tenant check: entities from another organization are invisible.
    pub fn owns(&self, organization_id: &OrganizationId) -> bool {
        &self.organization_id == organization_id
    }
}

/// Inputs copied out of a request for a background task. Holds values only.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub organization_id: OrganizationId,
    pub agent_id: Option<AgentId>,
    pub trigger: String,
}

impl TaskContext {
    pub fn from_request(ctx: &RequestContext, trigger: impl Into<String>) -> Self {
        Self {
            organization_id: ctx.organization_id,
            agent_id: ctx.agent_id,
            trigger: trigger.into(),
        }
    }
}
