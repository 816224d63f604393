//! Key fingerprints and signed-auth transcripts.
//!
//! fingerprint = SHA-256(raw_pubkey), hex encoded. Short forms are used in
//! log lines only.

use crate::messages::{CLIENT_PROTOCOL_VERSION, TUNNEL_PROTOCOL_VERSION};
use sha2::{Digest, Sha256};

/// Compute the full hex-encoded SHA-256 fingerprint of a raw public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode(hash)
}

/// Find the shortest unique prefix for a fingerprint within a set.
///
/// Returns a prefix of at least `min_len` characters that uniquely identifies
/// `fp` among all `fingerprints`.
pub fn short_fingerprint(fp: &str, fingerprints: &[&str], min_len: usize) -> String {
    let min_len = min_len.max(4).min(fp.len());
    let others: Vec<&str> = fingerprints.iter().filter(|&&f| f != fp).copied().collect();

    for len in min_len..=fp.len() {
        let prefix = &fp[..len];
        if !others.iter().any(|f| f.starts_with(prefix)) {
            return prefix.to_string();
        }
    }
    fp.to_string()
}

/// Transcript an agent signs to prove possession of its device key.
///
/// Format: `SHA-256("hatch-agent-v1\0" || device_id || timestamp_be)`
pub fn agent_transcript(device_id: &str, timestamp: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(TUNNEL_PROTOCOL_VERSION.as_bytes());
    hasher.update(b"\0");
    hasher.update(device_id.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.finalize().to_vec()
}

/// Transcript a user signs during the client challenge.
///
/// Format: `SHA-256("hatch-v1\0" || session_id || nonce)`
pub fn client_transcript(session_id: &str, nonce: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(CLIENT_PROTOCOL_VERSION.as_bytes());
    hasher.update(b"\0");
    hasher.update(session_id.as_bytes());
    hasher.update(nonce);
    hasher.finalize().to_vec()
}
