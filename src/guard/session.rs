//! Stateless HMAC session tokens.
//!
//! Wire format: `<base64url(JSON {"exp": <unix ms>})>.<base64url(HMAC-SHA256)>`,
//! both parts unpadded. The MAC covers the encoded payload part. Nothing is
//! stored server-side; a token is valid while its signature checks out under
//! the current secret and `exp` is in the future. There is no revocation.

use crate::error::TokenError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Request header carrying the session token.
pub const SESSION_HEADER: &str = "x-session-token";

/// Tokens longer than this are rejected before any decoding.
const MAX_TOKEN_LEN: usize = 512;

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    exp: u64,
}

/// A freshly minted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    /// Expiry in unix milliseconds.
    pub expires_at: u64,
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn mac(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length")
}

/// Mint a token that expires `ttl_secs` after `now_ms`.
pub fn create_session_token_at(secret: &[u8], ttl_secs: u64, now_ms: u64) -> IssuedToken {
    let exp = now_ms + ttl_secs * 1000;
    let payload = serde_json::to_vec(&Payload { exp }).unwrap_or_default();
    let payload_part = URL_SAFE_NO_PAD.encode(payload);
    let mut m = mac(secret);
    m.update(payload_part.as_bytes());
    let sig_part = URL_SAFE_NO_PAD.encode(m.finalize().into_bytes());
    IssuedToken {
        token: format!("{payload_part}.{sig_part}"),
        expires_at: exp,
    }
}

/// Check signature (constant time) and expiry at `now_ms`.
pub fn verify_session_token_at(secret: &[u8], token: &str, now_ms: u64) -> Result<(), TokenError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Missing);
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(TokenError::Malformed);
    }
    let (payload_part, sig_part) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let sig = URL_SAFE_NO_PAD
        .decode(sig_part)
        .map_err(|_| TokenError::Malformed)?;

    let mut m = mac(secret);
    m.update(payload_part.as_bytes());
    m.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_part)
        .map_err(|_| TokenError::Malformed)?;
    let payload: Payload =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)?;
    if payload.exp <= now_ms {
        return Err(TokenError::Expired);
    }
    Ok(())
}

/// Mints and verifies tokens under one secret.
#[derive(Clone)]
pub struct SessionSigner {
    secret: Vec<u8>,
    ttl_secs: u64,
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl SessionSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl_secs: u64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl_secs,
        }
    }

    /// Signer with a random 32-byte secret. Tokens die with the process.
    pub fn random(ttl_secs: u64) -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret, ttl_secs }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn issue(&self) -> IssuedToken {
        self.issue_at(now_ms())
    }

    pub fn issue_at(&self, now_ms: u64) -> IssuedToken {
        create_session_token_at(&self.secret, self.ttl_secs, now_ms)
    }

    pub fn verify(&self, token: &str) -> Result<(), TokenError> {
        self.verify_at(token, now_ms())
    }

    pub fn verify_at(&self, token: &str, now_ms: u64) -> Result<(), TokenError> {
        verify_session_token_at(&self.secret, token, now_ms)
    }
}
