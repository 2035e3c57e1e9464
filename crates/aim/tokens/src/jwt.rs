//! HS256 JWT encoding and the claim set.

use crate::{TokenError, TokenSubject};
use aim_types::{OrganizationId, UserId, UserRole};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

/// JWT claims: `{sub, org, email, role, jti, exp}`, plus `typ` so refresh
/// tokens cannot be replayed as access tokens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub org: String,
    pub email: String,
    pub role: String,
    pub jti: String,
    pub exp: i64,
    #[serde(default)]
    pub typ: String,
}

impl Claims {
    pub fn new(subject: &TokenSubject, kind: TokenKind, expires_at: DateTime<Utc>) -> Self {
        Self {
            sub: subject.user_id.to_string(),
            org: subject.organization_id.to_string(),
            email: subject.email.clone(),
            role: subject.role.as_str().to_string(),
            jti: Uuid::new_v4().to_string(),
            exp: expires_at.timestamp(),
            typ: match kind {
                TokenKind::Access => "access".to_string(),
                TokenKind::Refresh => "refresh".to_string(),
            },
        }
    }

    pub fn kind(&self) -> TokenKind {
        if self.typ == "refresh" {
            TokenKind::Refresh
        } else {
            TokenKind::Access
        }
    }

    /// Parse the identity claims back into a typed subject.
    pub fn subject(&self) -> Result<TokenSubject, TokenError> {
        Ok(TokenSubject {
            user_id: UserId::parse(&self.sub)
                .map_err(|_| TokenError::Invalid("malformed sub claim".to_string()))?,
            organization_id: OrganizationId::parse(&self.org)
                .map_err(|_| TokenError::Invalid("malformed org claim".to_string()))?,
            email: self.email.clone(),
            role: UserRole::parse(&self.role)
                .ok_or_else(|| TokenError::Invalid("unknown role claim".to_string()))?,
        })
    }
}

/// HS256 encoder/decoder around the shared secret.
#[derive(Clone)]
pub struct JwtCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn encode(&self, claims: &Claims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Invalid(e.to_string()))
    }

    /// Decode and verify. `check_expiry` is disabled only for the recovery
    /// flow, which must accept aged tokens whose record is still on file.
    pub fn decode(&self, raw: &str, check_expiry: bool) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = check_expiry;
        validation.required_spec_claims.clear();
        jsonwebtoken::decode::<Claims>(raw, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subject() -> TokenSubject {
        TokenSubject {
            user_id: UserId::generate(),
            organization_id: OrganizationId::generate(),
            email: "dev@example.com".to_string(),
            role: UserRole::Admin,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let codec = JwtCodec::new("secret");
        let claims = Claims::new(&subject(), TokenKind::Refresh, Utc::now() + Duration::days(1));
        let token = codec.encode(&claims).unwrap();
        let decoded = codec.decode(&token, true).unwrap();
        assert_eq!(decoded.jti, claims.jti);
        assert_eq!(decoded.kind(), TokenKind::Refresh);
        assert_eq!(decoded.subject().unwrap().email, "dev@example.com");
    }

    #[test]
    fn expired_token_fails_unless_expiry_is_waived() {
        let codec = JwtCodec::new("secret");
        let claims = Claims::new(&subject(), TokenKind::Refresh, Utc::now() - Duration::days(1));
        let token = codec.encode(&claims).unwrap();
        assert!(matches!(codec.decode(&token, true), Err(TokenError::Expired)));
        assert!(codec.decode(&token, false).is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let codec = JwtCodec::new("secret");
        let other = JwtCodec::new("different");
        let claims = Claims::new(&subject(), TokenKind::Access, Utc::now() + Duration::days(1));
        let token = codec.encode(&claims).unwrap();
        assert!(other.decode(&token, true).is_err());
    }
}
