//! AIM Tokens - SDK refresh tokens and agent credentials (C11).
//!
//! Refresh tokens are HS256 JWTs; only their SHA-256 hash and `jti` are
//! persisted. Rotation is atomic: the new token is persisted before the old
//! one is revoked with reason "rotated", so a crash leaves the old token
//! revoked or both usable, never both revoked.

#![deny(unsafe_code)]

pub mod jwt;

pub use jwt::{Claims, TokenKind};

use aim_crypto::{generate_keypair, sha256_hex, Keypair};
use aim_storage::{AgentStore, ControlPlaneStore, StorageError, StorageResult, TokenStore};
use aim_types::{
    Agent, OrganizationId, SdkToken, SdkTokenId, UserId, UserRole,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// SDK refresh tokens live for 90 days.
pub const REFRESH_TTL_DAYS: i64 = 90;

/// Default grace window after an agent key rotation.
pub const DEFAULT_ROTATION_GRACE_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("token_revoked")]
    Revoked,

    #[error("token_expired")]
    Expired,

    #[error("token not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A freshly issued refresh token. The raw JWT leaves the process exactly
/// once, in this struct.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    pub token: String,
    pub record: SdkToken,
    pub expires_at: DateTime<Utc>,
}

/// Identity attached to a refresh token.
#[derive(Clone, Debug)]
pub struct TokenSubject {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub email: String,
    pub role: UserRole,
}

/// Token and credential manager.
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn ControlPlaneStore>,
    jwt: jwt::JwtCodec,
    rotation_grace: Duration,
}

impl TokenManager {
    pub fn new(store: Arc<dyn ControlPlaneStore>, jwt_secret: &str) -> Self {
        Self::with_grace_window(store, jwt_secret, DEFAULT_ROTATION_GRACE_HOURS)
    }

    pub fn with_grace_window(
        store: Arc<dyn ControlPlaneStore>,
        jwt_secret: &str,
        rotation_grace_hours: i64,
    ) -> Self {
        Self {
            store,
            jwt: jwt::JwtCodec::new(jwt_secret),
            rotation_grace: Duration::hours(rotation_grace_hours),
        }
    }

    /// Verify a user access token (middleware entry point).
    pub fn verify_access_token(&self, raw: &str) -> Result<Claims, TokenError> {
        let claims = self.jwt.decode(raw, true)?;
        if claims.kind() != TokenKind::Access {
            return Err(TokenError::Invalid("expected an access token".to_string()));
        }
        Ok(claims)
    }

    /// Issue a user access token.
    pub fn issue_access_token(
        &self,
        subject: &TokenSubject,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let claims = Claims::new(subject, TokenKind::Access, Utc::now() + ttl);
        self.jwt.encode(&claims)
    }

    /// Issue and persist a new SDK refresh token.
    pub async fn issue_refresh_token(
        &self,
        subject: &TokenSubject,
        device_name: Option<String>,
        device_fingerprint: Option<String>,
    ) -> Result<IssuedToken, TokenError> {
        let expires_at = Utc::now() + Duration::days(REFRESH_TTL_DAYS);
        let claims = Claims::new(subject, TokenKind::Refresh, expires_at);
        let token = self.jwt.encode(&claims)?;

        let record = SdkToken {
            id: SdkTokenId::generate(),
            user_id: subject.user_id,
            organization_id: subject.organization_id,
            token_hash: sha256_hex(token.as_bytes()),
            token_id: claims.jti.clone(),
            device_name,
            device_fingerprint,
            created_at: Utc::now(),
            expires_at,
            revoked_at: None,
            revoke_reason: None,
        };
        let record = self.store.insert_token(record).await?;
        Ok(IssuedToken {
            token,
            record,
            expires_at,
        })
    }

    /// Validate a refresh token: signature, persisted hash, revocation,
    /// expiry.
    pub async fn validate_refresh_token(
        &self,
        raw: &str,
    ) -> Result<(Claims, SdkToken), TokenError> {
        let claims = self.jwt.decode(raw, true)?;
        if claims.kind() != TokenKind::Refresh {
            return Err(TokenError::Invalid("expected a refresh token".to_string()));
        }
        let record = self
            .store
            .find_token_by_hash(&sha256_hex(raw.as_bytes()))
            .await?
            .ok_or(TokenError::NotFound)?;
        if record.is_revoked() {
            return Err(TokenError::Revoked);
        }
        if record.is_expired(Utc::now()) {
            return Err(TokenError::Expired);
        }
        if record.token_id != claims.jti {
            return Err(TokenError::Invalid("jti mismatch".to_string()));
        }
        Ok((claims, record))
    }

    /// Rotate a refresh token: validate the old one, mint a new one, persist
    /// it and revoke the old one as a single storage transaction.
    pub async fn rotate_refresh_token(&self, raw: &str) -> Result<IssuedToken, TokenError> {
        let (claims, old_record) = self.validate_refresh_token(raw).await?;
        let subject = claims.subject()?;

        let expires_at = Utc::now() + Duration::days(REFRESH_TTL_DAYS);
        let new_claims = Claims::new(&subject, TokenKind::Refresh, expires_at);
        let token = self.jwt.encode(&new_claims)?;
        let record = SdkToken {
            id: SdkTokenId::generate(),
            user_id: old_record.user_id,
            organization_id: old_record.organization_id,
            token_hash: sha256_hex(token.as_bytes()),
            token_id: new_claims.jti.clone(),
            device_name: old_record.device_name.clone(),
            device_fingerprint: old_record.device_fingerprint.clone(),
            created_at: Utc::now(),
            expires_at,
            revoked_at: None,
            revoke_reason: None,
        };

        let record = self
            .store
            .rotate_token(record, &old_record.id, Utc::now())
            .await?;
        tracing::info!(user_id = %record.user_id, "refresh token rotated");
        Ok(IssuedToken {
            token,
            record,
            expires_at,
        })
    }

    /// Revoke a refresh token explicitly.
    pub async fn revoke_refresh_token(
        &self,
        id: &SdkTokenId,
        reason: &str,
    ) -> Result<SdkToken, TokenError> {
        Ok(self.store.revoke_token(id, reason, Utc::now()).await?)
    }

    /// Recover from an already-revoked refresh token: the signature and the
    /// database record must both check out, then a new token is minted with
    /// the old token's device metadata. Saves the SDK a full re-download.
    pub async fn recover_revoked_token(
        &self,
        id: &SdkTokenId,
        raw: &str,
    ) -> Result<IssuedToken, TokenError> {
        // The revoked token may also have aged past its exp claim.
        let claims = self.jwt.decode(raw, false)?;
        if claims.kind() != TokenKind::Refresh {
            return Err(TokenError::Invalid("expected a refresh token".to_string()));
        }
        let record = self.store.get_token(id).await?.ok_or(TokenError::NotFound)?;
        if record.token_hash != sha256_hex(raw.as_bytes()) || record.token_id != claims.jti {
            return Err(TokenError::Invalid(
                "token does not match the stored record".to_string(),
            ));
        }
        if !record.is_revoked() {
            return Err(TokenError::Invalid(
                "token is not revoked; use /auth/refresh".to_string(),
            ));
        }

        let subject = claims.subject()?;
        let issued = self
            .issue_refresh_token(
                &subject,
                record.device_name.clone(),
                record.device_fingerprint.clone(),
            )
            .await?;
        tracing::info!(user_id = %record.user_id, "revoked token recovered");
        Ok(issued)
    }

    /// Rotate an agent's Ed25519 keypair. The previous key stays valid for
    /// the grace window; the private key is returned exactly once.
    pub async fn rotate_agent_credentials(
        &self,
        agent: &Agent,
    ) -> StorageResult<(Keypair, Agent)> {
        let keypair = generate_keypair();
        let now = Utc::now();
        let updated = self
            .store
            .rotate_agent_keys(
                &agent.id,
                agent.version,
                &keypair.public_key,
                now + self.rotation_grace,
                now,
            )
            .await?;
        tracing::info!(
            agent_id = %agent.id,
            rotation_count = updated.rotation_count,
            "agent credentials rotated"
        );
        Ok((keypair, updated))
    }

    /// Issue a fresh API key for an agent, returning the plaintext once.
    pub fn generate_api_key() -> (String, String) {
        let raw = format!("aim_{}", Uuid::new_v4().simple());
        let hash = sha256_hex(raw.as_bytes());
        (raw, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_storage::MemoryStore;

    fn subject() -> TokenSubject {
        TokenSubject {
            user_id: UserId::generate(),
            organization_id: OrganizationId::generate(),
            email: "dev@example.com".to_string(),
            role: UserRole::Member,
        }
    }

    fn manager(store: Arc<MemoryStore>) -> TokenManager {
        TokenManager::new(store, "test-secret")
    }

    #[tokio::test]
    async fn issue_and_validate_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);
        let issued = manager
            .issue_refresh_token(&subject(), Some("laptop".to_string()), None)
            .await
            .unwrap();
        let (claims, record) = manager.validate_refresh_token(&issued.token).await.unwrap();
        assert_eq!(claims.jti, record.token_id);
        assert_eq!(record.device_name.as_deref(), Some("laptop"));
    }

    #[tokio::test]
    async fn rotation_revokes_the_old_token() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());
        let issued = manager.issue_refresh_token(&subject(), None, None).await.unwrap();

        let rotated = manager.rotate_refresh_token(&issued.token).await.unwrap();
        assert_ne!(rotated.record.id, issued.record.id);

        // The old token is now revoked with the rotation reason.
        let result = manager.validate_refresh_token(&issued.token).await;
        assert!(matches!(result, Err(TokenError::Revoked)));
        let old = store.get_token(&issued.record.id).await.unwrap().unwrap();
        assert_eq!(old.revoke_reason.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn recovery_requires_a_revoked_matching_token() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);
        let issued = manager
            .issue_refresh_token(&subject(), Some("ci-box".to_string()), None)
            .await
            .unwrap();

        // Not yet revoked: recovery refuses.
        let early = manager
            .recover_revoked_token(&issued.record.id, &issued.token)
            .await;
        assert!(matches!(early, Err(TokenError::Invalid(_))));

        manager
            .revoke_refresh_token(&issued.record.id, "suspected leak")
            .await
            .unwrap();
        let recovered = manager
            .recover_revoked_token(&issued.record.id, &issued.token)
            .await
            .unwrap();
        assert_eq!(recovered.record.device_name.as_deref(), Some("ci-box"));
        assert_ne!(recovered.record.id, issued.record.id);
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);
        let issued = manager.issue_refresh_token(&subject(), None, None).await.unwrap();
        let mut tampered = issued.token.clone();
        tampered.push('x');
        let result = manager.validate_refresh_token(&tampered).await;
        assert!(matches!(result, Err(TokenError::Invalid(_))));
    }
}
