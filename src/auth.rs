//! Signed upload ids and bearer-token authorization.

use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::constants::{API_TOKENS_VAR, SIGNING_SECRET_VAR};

type HmacSha256 = Hmac<Sha256>;

/// Tampered or malformed signed id; rendered as HTTP 400 upstream.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Bad ID")]
pub struct BadId;

fn signature(secret: &str, unsigned_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(unsigned_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Append an HMAC to an upload id: `{unsigned_id}.{hmac}`.
pub fn sign_id(secret: &str, unsigned_id: &str) -> String {
    format!("{unsigned_id}.{}", signature(secret, unsigned_id))
}

/// Recover the unsigned id, rejecting tampered tokens.
pub fn verify_id(secret: &str, signed_id: &str) -> Result<String, BadId> {
    let (unsigned_id, provided) = signed_id.rsplit_once('.').ok_or(BadId)?;

    let expected = signature(secret, unsigned_id);
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    // compare every byte so timing does not leak the match prefix
    if provided.len() != expected.len() {
        return Err(BadId);
    }
    let mismatch = provided.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if mismatch != 0 {
        return Err(BadId);
    }
    Ok(unsigned_id.to_string())
}

/// Process-wide signing secret; absent in local runs.
pub fn signing_secret() -> Option<String> {
    std::env::var(SIGNING_SECRET_VAR).ok().filter(|s| !s.is_empty())
}

/// Check a bearer token against the comma-separated `API_TOKENS` env list.
/// An empty or unset list disables the check.
pub fn token_authorized(bearer: Option<&str>) -> bool {
    authorized_against(&std::env::var(API_TOKENS_VAR).unwrap_or_default(), bearer)
}

fn authorized_against(list: &str, bearer: Option<&str>) -> bool {
    let tokens: Vec<&str> = list.split(',').map(str::trim).filter(|t| !t.is_empty()).collect();
    if tokens.is_empty() {
        return true;
    }
    bearer.is_some_and(|bearer| tokens.contains(&bearer))
}
