//! AIM Crypto - canonical payloads and signature primitives.
//!
//! Agents sign the canonical JSON form of their requests; any
//! implementation that produces different bytes cannot interoperate, so the
//! canonical form is pinned down here and property-tested for stability.

#![deny(unsafe_code)]

pub mod canonical;
pub mod digest;
pub mod keys;
pub mod verify;

pub use canonical::{canonical_attestation_payload, canonical_json, canonical_request_payload};
pub use digest::{sha256_hex, webhook_signature_header, webhook_signature_valid};
pub use keys::{decode_public_key, decode_signature, generate_keypair, sign_payload, Keypair};
pub use verify::{verify_attestation_signature, verify_signed_request, SignatureError};

use thiserror::Error;

/// Crypto-layer errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
