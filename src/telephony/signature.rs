//! Webhook signature verification.
//!
//! Every telephony callback is authenticated before any field is trusted:
//! the provider signs the raw body with the shared secret, and we compare
//! in constant time.

use base64::Engine;
use sha2::{Digest, Sha256};

pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub fn verify_signature(secret: &str, body: &[u8], provided: &str) -> bool {
    let expected = compute_signature(secret, body);
    expected.len() == provided.len()
        && expected
            .bytes()
            .zip(provided.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
