//! Self-verifying purchase tokens.
//!
//! Format: `{shortId}.{base36 expiry}.{truncated HMAC}`. The signature
//! binds (drop, user, shortId, expiry) under the process HMAC secret,
//! so verification needs no stored state and survives loss of the drop
//! object entirely.

use thiserror::Error;

use crate::crypto::{base64url, hmac_sha256, random_bytes, timing_safe_eq};
use crate::types::{Millis, TOKEN_SHORT_ID_BYTES, TOKEN_SIG_CHARS};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Base36 of a non-negative integer, lowercase.
fn base36_encode(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ascii")
}

fn base36_decode(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let mut n: u64 = 0;
    for c in s.bytes() {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'z' => c - b'a' + 10,
            _ => return None,
        };
        n = n.checked_mul(36)?.checked_add(digit as u64)?;
    }
    Some(n)
}

/// Token mint + verify bound to one HMAC secret.
#[derive(Clone)]
pub struct PurchaseTokens {
    secret: Vec<u8>,
}

impl PurchaseTokens {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    fn signature(&self, drop_id: &str, user_id: &str, short_id: &str, expiry_b36: &str) -> String {
        let message = format!("{drop_id}:{user_id}:{short_id}:{expiry_b36}");
        let tag = hmac_sha256(&self.secret, message.as_bytes());
        let mut sig = base64url(&tag);
        sig.truncate(TOKEN_SIG_CHARS);
        sig
    }

    /// Mint a token expiring at `expires_at_secs` (Unix seconds).
    pub fn generate(&self, drop_id: &str, user_id: &str, expires_at_secs: i64) -> String {
        let short_id = base64url(&random_bytes(TOKEN_SHORT_ID_BYTES));
        let expiry_b36 = base36_encode(expires_at_secs.max(0) as u64);
        let sig = self.signature(drop_id, user_id, &short_id, &expiry_b36);
        format!("{short_id}.{expiry_b36}.{sig}")
    }

    /// Verify a token for (drop, user) at wall time `now_ms`.
    /// Returns the expiry in Unix seconds.
    pub fn verify(
        &self,
        drop_id: &str,
        user_id: &str,
        token: &str,
        now_ms: Millis,
    ) -> Result<i64, TokenError> {
        let mut parts = token.split('.');
        let (Some(short_id), Some(expiry_b36), Some(sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let expected = self.signature(drop_id, user_id, short_id, expiry_b36);
        if !timing_safe_eq(expected.as_bytes(), sig.as_bytes()) {
            return Err(TokenError::BadSignature);
        }

        let expires_at_secs = base36_decode(expiry_b36).ok_or(TokenError::Malformed)? as i64;
        if now_ms > expires_at_secs * 1000 {
            return Err(TokenError::Expired);
        }
        Ok(expires_at_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> PurchaseTokens {
        PurchaseTokens::new(b"test-secret".to_vec())
    }

    #[test]
    fn test_base36_round_trip() {
        for n in [0u64, 1, 35, 36, 1234567890, u32::MAX as u64] {
            assert_eq!(base36_decode(&base36_encode(n)), Some(n));
        }
        assert_eq!(base36_decode(""), None);
        assert_eq!(base36_decode("nope!"), None);
    }

    #[test]
    fn test_round_trip() {
        let t = tokens();
        let token = t.generate("d1", "alice", 2_000_000_000);
        let expiry = t.verify("d1", "alice", &token, 1_000_000_000_000).unwrap();
        assert_eq!(expiry, 2_000_000_000);
    }

    #[test]
    fn test_token_shape() {
        let token = tokens().generate("d1", "alice", 2_000_000_000);
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), TOKEN_SIG_CHARS);
    }

    #[test]
    fn test_expired() {
        let t = tokens();
        let token = t.generate("d1", "alice", 1_000);
        assert_eq!(
            t.verify("d1", "alice", &token, 1_001 * 1000),
            Err(TokenError::Expired)
        );
        // exactly at expiry is still valid
        assert!(t.verify("d1", "alice", &token, 1_000 * 1000).is_ok());
    }

    #[test]
    fn test_wrong_binding_rejected() {
        let t = tokens();
        let token = t.generate("d1", "alice", 2_000_000_000);
        let now = 0;
        assert_eq!(t.verify("d2", "alice", &token, now), Err(TokenError::BadSignature));
        assert_eq!(t.verify("d1", "bob", &token, now), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_one_bit_flip_invalidates() {
        let t = tokens();
        let token = t.generate("d1", "alice", 2_000_000_000);
        // flip one character of the signature
        let mut bytes = token.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert_eq!(
            t.verify("d1", "alice", &tampered, 0),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_expiry_rejected() {
        let t = tokens();
        let token = t.generate("d1", "alice", 1_000);
        let parts: Vec<&str> = token.split('.').collect();
        // extend expiry without re-signing
        let tampered = format!("{}.{}.{}", parts[0], "zzzzzz", parts[2]);
        assert_eq!(
            t.verify("d1", "alice", &tampered, 0),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_different_secret_rejects() {
        let token = tokens().generate("d1", "alice", 2_000_000_000);
        let other = PurchaseTokens::new(b"other-secret".to_vec());
        assert_eq!(
            other.verify("d1", "alice", &token, 0),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_malformed() {
        let t = tokens();
        for bad in ["", "a", "a.b", "a.b.c.d"] {
            assert_eq!(t.verify("d1", "alice", bad, 0), Err(TokenError::Malformed));
        }
    }
}
