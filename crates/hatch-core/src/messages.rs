//! Wire messages for the agent tunnel and the client-facing protocol.
//!
//! Both protocols use the framing in [`crate::codec`]. Every message is a
//! CBOR map with a `type` tag.

use crate::error::ReasonCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Version string sent by agents in the tunnel handshake.
pub const TUNNEL_PROTOCOL_VERSION: &str = "hatch-agent-v1";

/// Version string sent by clients in `hello`.
pub const CLIENT_PROTOCOL_VERSION: &str = "hatch-v1";

/// What a channel is for. Dispatch on this happens once, at channel open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Purpose {
    Shell,
    Exec,
    PortForward,
    Sftp,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Exec => "exec",
            Self::PortForward => "port-forward",
            Self::Sftp => "sftp",
        }
    }

    /// Parse the config/CLI spelling of a purpose.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "shell" => Some(Self::Shell),
            "exec" => Some(Self::Exec),
            "port-forward" | "forward" => Some(Self::PortForward),
            "sftp" => Some(Self::Sftp),
            _ => None,
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Destination of a port-forward channel, as seen from the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
}

/// Target parameters of a channel-open request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParams {
    /// Command for `exec` (or a forced command for `shell`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// PTY request; absent for non-interactive channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pty: Option<PtySize>,
    /// Forward target for `port-forward`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardTarget>,
    /// Extra environment for the spawned process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    ClientClose,
    AgentClose,
    Superseded,
    Timeout,
    PolicyRevoked,
    TunnelLost,
    RelayLost,
    BackpressureExceeded,
    /// The gateway instance is shutting down.
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClose => "client-close",
            Self::AgentClose => "agent-close",
            Self::Superseded => "superseded",
            Self::Timeout => "timeout",
            Self::PolicyRevoked => "policy-revoked",
            Self::TunnelLost => "tunnel-lost",
            Self::RelayLost => "relay-lost",
            Self::BackpressureExceeded => "backpressure-exceeded",
            Self::Shutdown => "shutdown",
        }
    }

    /// Map a channel failure code to the session end reason it implies.
    pub fn from_failure(code: ReasonCode) -> Self {
        match code {
            ReasonCode::Superseded => Self::Superseded,
            ReasonCode::RelayLost | ReasonCode::RelayTimeout => Self::RelayLost,
            ReasonCode::BackpressureExceeded => Self::BackpressureExceeded,
            ReasonCode::PolicyDenied => Self::PolicyRevoked,
            _ => Self::TunnelLost,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Agent tunnel ──────────────────────────────────────────────────────

/// Proof of device identity presented in the tunnel handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceProof {
    /// HMAC enrollment token issued for this device.
    Token {
        #[serde(with = "serde_bytes")]
        token: Vec<u8>,
    },
    /// Ed25519 signature over [`crate::identity::agent_transcript`].
    Signature {
        #[serde(with = "serde_bytes")]
        public_key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        signature: Vec<u8>,
    },
}

/// First frame an agent sends after dialing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: String,
    pub device_id: String,
    /// UNIX seconds; part of the signed transcript.
    pub timestamp: u64,
    pub proof: DeviceProof,
}

/// Every frame on an agent tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelFrame {
    Handshake(Handshake),
    HandshakeAck {
        instance_id: String,
        heartbeat_interval_ms: u64,
        window: u32,
    },
    HandshakeReject {
        code: ReasonCode,
        message: String,
    },
    Open {
        channel_id: u32,
        purpose: Purpose,
        params: ChannelParams,
        window: u32,
    },
    OpenOk {
        channel_id: u32,
        window: u32,
    },
    OpenFail {
        channel_id: u32,
        code: ReasonCode,
        message: String,
    },
    Data {
        channel_id: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    WindowAdjust {
        channel_id: u32,
        bytes: u32,
    },
    Resize {
        channel_id: u32,
        cols: u16,
        rows: u16,
    },
    Eof {
        channel_id: u32,
    },
    Close {
        channel_id: u32,
        exit_status: Option<i32>,
    },
    Error {
        channel_id: u32,
        code: ReasonCode,
        message: String,
    },
    Ping {
        seq: u64,
    },
    Pong {
        seq: u64,
    },
    /// Sent to a tunnel that is being replaced or shut down.
    Evict {
        code: ReasonCode,
        message: String,
    },
}

impl TunnelFrame {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::HandshakeReject { .. } => "handshake_reject",
            Self::Open { .. } => "open",
            Self::OpenOk { .. } => "open_ok",
            Self::OpenFail { .. } => "open_fail",
            Self::Data { .. } => "data",
            Self::WindowAdjust { .. } => "window_adjust",
            Self::Resize { .. } => "resize",
            Self::Eof { .. } => "eof",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Evict { .. } => "evict",
        }
    }
}

// ── Client-facing protocol ────────────────────────────────────────────

/// Client authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Pubkey,
    Password,
}

/// Credentials presented by a client after the challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub method: AuthMethod,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Every frame on a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        version: String,
        username: String,
    },
    Challenge {
        session_id: String,
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
    },
    Auth(AuthRequest),
    AuthOk {
        user_id: String,
    },
    AuthFail {
        code: ReasonCode,
        message: String,
    },
    Open {
        device: String,
        purpose: Purpose,
        params: ChannelParams,
    },
    OpenOk {
        session_id: String,
    },
    OpenFail {
        code: ReasonCode,
        message: String,
    },
    Data {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Eof,
    Exit {
        status: i32,
    },
    Close {
        reason: EndReason,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, cbor_encode};

    #[test]
    fn tunnel_frames_decode_to_the_same_variant() {
        let frames = vec![
            TunnelFrame::Open {
                channel_id: 3,
                purpose: Purpose::PortForward,
                params: ChannelParams {
                    forward: Some(ForwardTarget {
                        host: "127.0.0.1".into(),
                        port: 5432,
                    }),
                    ..Default::default()
                },
                window: 65536,
            },
            TunnelFrame::Data {
                channel_id: 3,
                data: b"\x00\x01binary\xff".to_vec(),
            },
            TunnelFrame::Close {
                channel_id: 3,
                exit_status: Some(127),
            },
            TunnelFrame::Handshake(Handshake {
                version: TUNNEL_PROTOCOL_VERSION.into(),
                device_id: "dev-1".into(),
                timestamp: 1_700_000_000,
                proof: DeviceProof::Token {
                    token: vec![1, 2, 3],
                },
            }),
        ];
        for frame in frames {
            let bytes = cbor_encode(&frame).unwrap();
            let decoded: TunnelFrame = cbor_decode(&bytes).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn unknown_tunnel_frame_type_is_rejected() {
        #[derive(Serialize)]
        struct Bogus {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        let bytes = cbor_encode(&Bogus { kind: "teleport" }).unwrap();
        assert!(cbor_decode::<TunnelFrame>(&bytes).is_err());
    }

    #[test]
    fn auth_request_omits_absent_fields() {
        let msg = ClientMessage::Auth(AuthRequest {
            method: AuthMethod::Password,
            public_key: None,
            signature: None,
            password: Some("hunter2".into()),
        });
        let bytes = cbor_encode(&msg).unwrap();
        assert_eq!(cbor_decode::<ClientMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn purpose_parses_config_spelling() {
        assert_eq!(Purpose::parse("port-forward"), Some(Purpose::PortForward));
        assert_eq!(Purpose::parse(" exec "), Some(Purpose::Exec));
        assert_eq!(Purpose::parse("x11"), None);
        assert_eq!(Purpose::Sftp.to_string(), "sftp");
    }

    #[test]
    fn failure_codes_map_to_end_reasons() {
        assert_eq!(
            EndReason::from_failure(ReasonCode::Superseded),
            EndReason::Superseded
        );
        assert_eq!(
            EndReason::from_failure(ReasonCode::TunnelLost),
            EndReason::TunnelLost
        );
        assert_eq!(EndReason::ClientClose.to_string(), "client-close");
    }
}
