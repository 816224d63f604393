//! HMAC device enrollment tokens.
//!
//! A token binds a device ID to an expiry time and lets an agent prove its
//! identity without holding a key pair.
//! Format: `[8-byte expiry][32-byte HMAC-SHA256]`

use crate::error::{HatchError, HatchResult};
use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

const TOKEN_LEN: usize = 8 + 32;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn signed_data(expiry: u64, device_id: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + device_id.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(device_id.as_bytes());
    data
}

/// Create an enrollment token for `device_id` valid for `ttl_secs`.
pub fn create_device_token(secret: &[u8], device_id: &str, ttl_secs: u64) -> Vec<u8> {
    let expiry = unix_now().saturating_add(ttl_secs);
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(expiry, device_id));

    let mut token = Vec::with_capacity(TOKEN_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    token
}

/// Verify an enrollment token: HMAC signature first, then expiry.
pub fn verify_device_token(secret: &[u8], device_id: &str, token: &[u8]) -> HatchResult<()> {
    if token.len() != TOKEN_LEN {
        return Err(HatchError::Token(format!(
            "invalid token length: expected {TOKEN_LEN}, got {}",
            token.len()
        )));
    }

    let mut expiry_bytes = [0u8; 8];
    expiry_bytes.copy_from_slice(&token[..8]);
    let expiry = u64::from_be_bytes(expiry_bytes);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(expiry, device_id), &token[8..])
        .map_err(|_| HatchError::Token("invalid token signature".into()))?;

    if unix_now() > expiry {
        return Err(HatchError::Token("token expired".into()));
    }
    Ok(())
}

/// Generate a random 32-byte secret.
pub fn generate_secret() -> HatchResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| HatchError::Other("system RNG failure".into()))?;
    Ok(secret)
}
