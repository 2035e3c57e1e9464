//! AIM Storage - persistence for the control plane.
//!
//! One trait per store, a blanket [`ControlPlaneStore`] bundle, and two
//! backends: [`MemoryStore`] for tests and the development profile, and
//! [`PgStore`] as the transactional source of truth.

#![deny(unsafe_code)]

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use model::{
    AgentEventStats, AlertFilter, NewAgent, NewMcpServer, PendingStatusCounts, QueryWindow,
    VerificationFilter, VerificationStats,
};
pub use postgres::PgStore;
pub use traits::{
    AgentStore, AlertStore, AttestationStore, AuditStore, CapabilityStore, ControlPlaneStore,
    PolicyStore, TokenStore, TrustStore, VerificationEventStore, WebhookStore,
};
