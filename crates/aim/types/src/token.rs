//! Tracked SDK refresh tokens.

use crate::ids::{OrganizationId, SdkTokenId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One issued refresh token. The token itself is a signed JWT and is never
/// stored; only its SHA-256 hash and `jti` are persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SdkToken {
    pub id: SdkTokenId,
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    /// SHA-256 of the raw JWT, hex.
    pub token_hash: String,
    /// The JWT `jti` claim.
    pub token_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_reason: Option<String>,
}

impl SdkToken {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
