//! Error types for the daemon and the single HTTP flattening point.

use aim_attestation::AttestationError;
use aim_crypto::SignatureError;
use aim_decider::DecisionError;
use aim_storage::StorageError;
use aim_tokens::TokenError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Daemon-level errors (startup and wiring).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("server error: {0}")]
    Server(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DaemonResult<T> = Result<T, DaemonError>;

/// API errors, one variant per §taxonomy row.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Denied by the decision pipeline; carries the audit handle.
    #[error("denied")]
    Denied {
        reason: String,
        audit_id: Uuid,
        verification_id: Uuid,
    },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audit_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification_id: Option<Uuid>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::Denied { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match self {
            ApiError::Denied {
                reason,
                audit_id,
                verification_id,
            } => ErrorBody {
                error: "denied".to_string(),
                reason: Some(reason),
                audit_id: Some(audit_id),
                verification_id: Some(verification_id),
            },
            other => ErrorBody {
                error: other.to_string(),
                reason: None,
                audit_id: None,
                verification_id: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound(message) => ApiError::NotFound(message),
            StorageError::Conflict(message) => ApiError::Conflict(message),
            StorageError::InvariantViolation(message) => ApiError::Conflict(message),
            StorageError::InvalidInput(message) => ApiError::Validation(message),
            StorageError::Serialization(message) => ApiError::Internal(message),
            StorageError::Backend(message) => ApiError::Internal(message),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::Revoked => ApiError::Unauthorized("token_revoked".to_string()),
            TokenError::Expired => ApiError::Unauthorized("token_expired".to_string()),
            TokenError::NotFound => ApiError::Unauthorized("unknown token".to_string()),
            TokenError::Invalid(message) => ApiError::Unauthorized(message),
            TokenError::Storage(error) => error.into(),
        }
    }
}

impl From<AttestationError> for ApiError {
    fn from(error: AttestationError) -> Self {
        match error {
            AttestationError::McpNotFound | AttestationError::AgentNotFound => {
                ApiError::NotFound(error.to_string())
            }
            AttestationError::AgentNotEligible(message) => ApiError::Forbidden(message),
            AttestationError::Signature(error) => signature_error(error),
            AttestationError::Storage(error) => error.into(),
        }
    }
}

impl From<DecisionError> for ApiError {
    fn from(error: DecisionError) -> Self {
        match error {
            DecisionError::AgentNotFound => ApiError::NotFound("agent not found".to_string()),
            DecisionError::AgentInactive(status) => {
                ApiError::Forbidden(format!("agent_{status}"))
            }
            DecisionError::Signature { source, .. } => signature_error(source),
            DecisionError::EventNotFound => {
                ApiError::NotFound("verification event not found".to_string())
            }
            DecisionError::AuditMismatch => {
                ApiError::Validation("audit_id does not match".to_string())
            }
            DecisionError::AlreadyDecided => {
                ApiError::Conflict("event is already terminal".to_string())
            }
            DecisionError::Storage(error) => error.into(),
        }
    }
}

fn signature_error(error: SignatureError) -> ApiError {
    match error {
        SignatureError::StaleTimestamp => {
            ApiError::Unauthorized("stale_timestamp".to_string())
        }
        SignatureError::KeyMismatch => ApiError::Unauthorized("key_mismatch".to_string()),
        _ => ApiError::Unauthorized("signature_verification_failed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Validation("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unauthorized("x".into()).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict("x".into()).into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::RateLimited.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Denied {
                reason: "capability_not_granted".into(),
                audit_id: Uuid::new_v4(),
                verification_id: Uuid::new_v4(),
            }
            .into_response()
            .status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn revoked_token_maps_to_401_token_revoked() {
        let error: ApiError = TokenError::Revoked.into();
        assert!(matches!(error, ApiError::Unauthorized(ref m) if m == "token_revoked"));
    }
}
