//! Opaque 128-bit identifiers for every entity in the control plane.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn parse(raw: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(raw).map(Self)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

entity_id!(
    /// Tenant boundary; scopes every other entity.
    OrganizationId
);
entity_id!(
    /// Cryptographic principal performing actions.
    AgentId
);
entity_id!(
    /// Registered MCP tool endpoint.
    McpServerId
);
entity_id!(
    /// A capability grant row.
    CapabilityId
);
entity_id!(
    /// A pending capability request.
    CapabilityRequestId
);
entity_id!(
    /// A security policy row.
    PolicyId
);
entity_id!(
    /// One verification decision record.
    VerificationId
);
entity_id!(
    /// An operator-facing alert.
    AlertId
);
entity_id!(
    /// A recorded MCP attestation.
    AttestationId
);
entity_id!(
    /// A webhook subscription.
    WebhookId
);
entity_id!(
    /// One webhook delivery attempt chain.
    DeliveryId
);
entity_id!(
    /// A tracked SDK refresh token.
    SdkTokenId
);
entity_id!(
    /// A human user (JWT subject).
    UserId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrips_through_display_and_parse() {
        let id = AgentId::generate();
        let parsed = AgentId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn id_serializes_as_bare_uuid_string() {
        let id = OrganizationId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }
}
