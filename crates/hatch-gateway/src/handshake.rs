//! Handshake helpers shared by the agent and client listeners.
//!
//! Agents open with a `Handshake` frame proving their device identity.
//! Clients go through hello → challenge → auth; the challenge nonce and
//! session ID generated here are part of the transcript the user signs.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hatch_core::codec::cbor_encode;
use hatch_core::messages::Handshake;
use hatch_core::transport::{BoxedReader, BoxedWriter};
use hatch_core::{
    cbor_decode, HatchError, HatchResult, ReasonCode, TunnelFrame, TUNNEL_PROTOCOL_VERSION,
};
use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Largest accepted distance between a signed timestamp and our clock.
pub const MAX_CLOCK_SKEW_SECS: u64 = 300;

/// Random 128-bit ID, hex encoded. Used for session and relay request IDs.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

pub fn generate_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 32];
    rand::thread_rng().fill(&mut nonce[..]);
    nonce
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Reject timestamps more than [`MAX_CLOCK_SKEW_SECS`] away from `now`.
pub fn check_freshness(timestamp: u64, now: u64) -> HatchResult<()> {
    if timestamp.abs_diff(now) > MAX_CLOCK_SKEW_SECS {
        return Err(HatchError::AuthFailure(format!(
            "timestamp {timestamp} outside the allowed skew"
        )));
    }
    Ok(())
}

/// Verify an Ed25519 signature over `message`.
pub fn verify_ed25519(public_key: &[u8], message: &[u8], signature: &[u8]) -> HatchResult<()> {
    let vk_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| HatchError::AuthFailure("invalid public key length".into()))?;
    let verifying_key = VerifyingKey::from_bytes(&vk_bytes)
        .map_err(|e| HatchError::AuthFailure(format!("invalid public key: {e}")))?;
    let sig = Signature::from_slice(signature)
        .map_err(|e| HatchError::AuthFailure(format!("invalid signature: {e}")))?;
    verifying_key
        .verify(message, &sig)
        .map_err(|_| HatchError::AuthFailure("signature verification failed".into()))
}

/// Read the agent's opening frame.
pub async fn read_agent_handshake(
    reader: &mut BoxedReader,
    timeout: Duration,
) -> HatchResult<Handshake> {
    let bytes = tokio::time::timeout(timeout, reader.read_frame())
        .await
        .map_err(|_| HatchError::ProtocolViolation("handshake timed out".into()))??
        .ok_or_else(|| HatchError::TunnelLost("agent closed before handshake".into()))?;
    match cbor_decode::<TunnelFrame>(&bytes)? {
        TunnelFrame::Handshake(hs) => {
            if hs.version != TUNNEL_PROTOCOL_VERSION {
                return Err(HatchError::InvalidMessage(format!(
                    "unsupported tunnel version: {} (expected {})",
                    hs.version, TUNNEL_PROTOCOL_VERSION
                )));
            }
            debug!(device_id = %hs.device_id, "agent handshake received");
            Ok(hs)
        }
        other => Err(HatchError::ProtocolViolation(format!(
            "expected handshake, got {}",
            other.name()
        ))),
    }
}

/// Send a `HandshakeReject` and close the write side.
pub async fn reject_agent(writer: &mut BoxedWriter, code: ReasonCode, message: &str) {
    let frame = TunnelFrame::HandshakeReject {
        code,
        message: message.to_string(),
    };
    if let Ok(payload) = cbor_encode(&frame) {
        let _ = writer.write_frame(&payload).await;
    }
    let _ = writer.shutdown().await;
}

pub async fn send_tunnel_frame(writer: &mut BoxedWriter, frame: &TunnelFrame) -> HatchResult<()> {
    let payload = cbor_encode(frame)?;
    writer.write_frame(&payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use hatch_core::messages::DeviceProof;
    use hatch_core::transport::split_stream;

    #[test]
    fn ids_are_unique_hex() {
        let a = generate_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, generate_id());
        assert_eq!(generate_nonce().len(), 32);
    }

    #[test]
    fn freshness_window_is_symmetric() {
        assert!(check_freshness(1_000, 1_300).is_ok());
        assert!(check_freshness(1_300, 1_000).is_ok());
        assert!(check_freshness(1_000, 1_301).is_err());
        assert!(check_freshness(1_301, 1_000).is_err());
    }

    #[test]
    fn ed25519_signatures_verify() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let public = key.verifying_key().to_bytes();
        let sig = key.sign(b"transcript").to_bytes();
        assert!(verify_ed25519(&public, b"transcript", &sig).is_ok());
        assert!(matches!(
            verify_ed25519(&public, b"tampered", &sig),
            Err(HatchError::AuthFailure(_))
        ));
        assert!(verify_ed25519(&public[..31], b"transcript", &sig).is_err());
    }

    #[tokio::test]
    async fn handshake_is_read_and_version_checked() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut reader, _w) = split_stream(a);
        let (_r, mut writer) = split_stream(b);

        let mut hs = Handshake {
            version: TUNNEL_PROTOCOL_VERSION.into(),
            device_id: "d1".into(),
            timestamp: unix_now(),
            proof: DeviceProof::Token { token: vec![0; 40] },
        };
        send_tunnel_frame(&mut writer, &TunnelFrame::Handshake(hs.clone()))
            .await
            .unwrap();
        let got = read_agent_handshake(&mut reader, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, hs);

        hs.version = "hatch-agent-v0".into();
        send_tunnel_frame(&mut writer, &TunnelFrame::Handshake(hs))
            .await
            .unwrap();
        assert!(matches!(
            read_agent_handshake(&mut reader, Duration::from_secs(1)).await,
            Err(HatchError::InvalidMessage(_))
        ));
    }
}
