//! Ed25519 key handling.

use crate::CryptoError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// A freshly generated agent keypair, both halves base64-encoded.
/// The private key is returned to the caller exactly once and never stored.
#[derive(Clone, Debug)]
pub struct Keypair {
    pub public_key: String,
    pub private_key: String,
}

/// Generate a new Ed25519 keypair.
pub fn generate_keypair() -> Keypair {
    let signing_key = SigningKey::generate(&mut OsRng);
    Keypair {
        public_key: STANDARD.encode(signing_key.verifying_key().as_bytes()),
        private_key: STANDARD.encode(signing_key.to_bytes()),
    }
}

/// Decode a base64 public key into a verifying key; must be 32 bytes.
pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Decode a base64 signature; must be 64 bytes.
pub fn decode_signature(encoded: &str) -> Result<Signature, CryptoError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let bytes: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidSignature(format!("expected 64 bytes, got {}", bytes.len()))
    })?;
    Ok(Signature::from_bytes(&bytes))
}

/// Sign a payload with a base64-encoded private key; returns base64.
pub fn sign_payload(private_key: &str, payload: &[u8]) -> Result<String, CryptoError> {
    let bytes = STANDARD
        .decode(private_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    let signing_key = SigningKey::from_bytes(&bytes);
    Ok(STANDARD.encode(signing_key.sign(payload).to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn generated_keypair_signs_and_verifies() {
        let keypair = generate_keypair();
        let signature = sign_payload(&keypair.private_key, b"hello").unwrap();
        let verifying_key = decode_public_key(&keypair.public_key).unwrap();
        let signature = decode_signature(&signature).unwrap();
        assert!(verifying_key.verify(b"hello", &signature).is_ok());
    }

    #[test]
    fn short_key_is_rejected() {
        let encoded = STANDARD.encode([0u8; 16]);
        assert!(matches!(
            decode_public_key(&encoded),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn short_signature_is_rejected() {
        let encoded = STANDARD.encode([0u8; 32]);
        assert!(matches!(
            decode_signature(&encoded),
            Err(CryptoError::InvalidSignature(_))
        ));
    }
}
