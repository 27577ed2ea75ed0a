//! Short-lived signed room join credentials.
//!
//! A token is `base64(payload).base64(sha256(secret || payload))` where the
//! payload carries room, identity, capabilities and expiry. Scoped to one
//! room/identity pair; verification rejects tampering and expiry.

use anyhow::{bail, Context, Result};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenClaims {
    pub room: String,
    pub identity: String,
    pub capabilities: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RoomToken {
    pub token: String,
    pub claims: TokenClaims,
}

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
}

fn signature(secret: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(payload);
    b64().encode(hasher.finalize())
}

/// Issue a credential scoped to one room and identity.
pub fn issue(
    secret: &str,
    room: &str,
    identity: &str,
    capabilities: &[String],
    ttl_secs: i64,
) -> Result<RoomToken> {
    let claims = TokenClaims {
        room: room.to_string(),
        identity: identity.to_string(),
        capabilities: capabilities.to_vec(),
        expires_at: Utc::now() + Duration::seconds(ttl_secs),
    };

    let payload = serde_json::to_vec(&claims).context("failed to encode token claims")?;
    let token = format!("{}.{}", b64().encode(&payload), signature(secret, &payload));

    Ok(RoomToken { token, claims })
}

/// Verify a credential and return its claims.
pub fn verify(secret: &str, token: &str) -> Result<TokenClaims> {
    let Some((payload_b64, sig)) = token.split_once('.') else {
        bail!("malformed room token");
    };

    let payload = b64()
        .decode(payload_b64)
        .context("malformed room token payload")?;

    let expected = signature(secret, &payload);
    // Constant-time comparison.
    if expected.len() != sig.len()
        || expected
            .bytes()
            .zip(sig.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            != 0
    {
        bail!("room token signature mismatch");
    }

    let claims: TokenClaims =
        serde_json::from_slice(&payload).context("malformed token claims")?;
    if claims.expires_at < Utc::now() {
        bail!("room token expired");
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let token = issue("secret", "room-1", "caller-9", &["publish".into()], 60).unwrap();
        let claims = verify("secret", &token.token).unwrap();
        assert_eq!(claims.room, "room-1");
        assert_eq!(claims.identity, "caller-9");
        assert_eq!(claims.capabilities, vec!["publish".to_string()]);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue("secret", "room-1", "caller-9", &[], 60).unwrap();
        assert!(verify("other", &token.token).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let token = issue("secret", "room-1", "caller-9", &[], 60).unwrap();
        let (payload, sig) = token.token.split_once('.').unwrap();
        let mut bytes = b64().decode(payload).unwrap();
        bytes[0] ^= 1;
        let forged = format!("{}.{}", b64().encode(&bytes), sig);
        assert!(verify("secret", &forged).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue("secret", "room-1", "caller-9", &[], -1).unwrap();
        assert!(verify("secret", &token.token).is_err());
    }

    #[test]
    fn test_malformed_token_rejected() {
        assert!(verify("secret", "garbage").is_err());
        assert!(verify("secret", "a.b.c").is_err());
    }
}
