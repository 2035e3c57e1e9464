//! AIM Types - domain model for the identity & action-verification control plane
//!
//! Every entity is tenant-scoped: it carries an `OrganizationId` and all
//! queries must filter by it. Identifiers are opaque 128-bit values.

#![deny(unsafe_code)]

pub mod action;
pub mod agent;
pub mod alert;
pub mod audit;
pub mod capability;
pub mod context;
pub mod ids;
pub mod mcp;
pub mod policy;
pub mod token;
pub mod trust;
pub mod verification;
pub mod webhook;

pub use action::{is_critical_action, ActionRiskClass, RiskLevel, CRITICAL_ACTIONS};
pub use agent::{Agent, AgentStatus};
pub use alert::{Alert, AlertSeverity, CapabilityViolation};
pub use audit::{AuditAppend, AuditLogEntry};
pub use capability::{AgentCapability, CapabilityRequest, CapabilityRequestStatus};
pub use context::{AuthMethod, RequestContext, TaskContext, UserRole};
pub use ids::*;
pub use mcp::{AgentMcpConnection, McpAttestation, McpServer, McpVerificationStatus};
pub use policy::{AgentSelector, EnforcementAction, PolicyType, SecurityPolicy};
pub use token::SdkToken;
pub use trust::{TrustFactors, TrustScore, TrustScoreHistory, TrustWeights};
pub use verification::{
    Protocol, SignedActionRequest, VerificationEvent, VerificationEventMeta, VerificationOutcome,
    VerificationStatus, VerificationType,
};
pub use webhook::{EventEnvelope, Webhook, WebhookDelivery, WebhookDeliveryStatus};
