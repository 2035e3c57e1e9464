//! Digests and webhook signatures.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of the input, lowercase hex. Used for API keys and token hashes
/// so plaintext credentials are never persisted.
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Value for the `X-AIM-Signature` header: `sha256=<hex HMAC over body>`.
pub fn webhook_signature_header(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received webhook signature header.
pub fn webhook_signature_valid(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(received) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(received) = hex::decode(received) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&received).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"aim"),
            "a27f98238d2c1c02f2a131d894d29410f0915d9f930bff80389e5fe0b55e243c"
        );
    }

    #[test]
    fn webhook_signature_round_trips() {
        let header = webhook_signature_header("secret", b"{\"event\":1}");
        assert!(header.starts_with("sha256="));
        assert!(webhook_signature_valid("secret", b"{\"event\":1}", &header));
        assert!(!webhook_signature_valid("other", b"{\"event\":1}", &header));
        assert!(!webhook_signature_valid("secret", b"{\"event\":2}", &header));
    }
}
