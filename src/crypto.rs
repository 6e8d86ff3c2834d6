//! Hash, MAC, and encoding primitives.
//!
//! All commitments in the system are SHA-256 over UTF-8 strings, hex
//! encoded, so proofs can be recomputed from any language with a shell
//! and `sha256sum`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type Hash = [u8; 32];

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid encoding")]
    InvalidEncoding,
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// SHA-256 digest, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// HMAC-SHA256 tag.
pub fn hmac_sha256(secret: &[u8], message: &[u8]) -> Hash {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Constant-time equality. Both inputs are attacker-visible lengths
/// (truncated signatures), so only the content comparison must not leak.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Base64url without padding.
pub fn base64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn base64url_decode(data: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|_| CryptoError::InvalidEncoding)
}

/// CSPRNG bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// CSPRNG bytes, lowercase hex.
pub fn random_hex(n: usize) -> String {
    hex::encode(random_bytes(n))
}

/// Salted IP hash used for queue caps and rate limiting.
/// The raw address never reaches the store.
pub fn ip_hash(ip: &str, salt: &str) -> String {
    sha256_hex(format!("{ip}{salt}").as_bytes())
}
