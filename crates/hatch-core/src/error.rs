use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable reason codes carried on the wire next to a human message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    AuthFailure,
    DeviceOffline,
    Conflict,
    NotOwner,
    Expired,
    NotFound,
    BackpressureExceeded,
    TunnelLost,
    RelayLost,
    RelayTimeout,
    OpenTimeout,
    Superseded,
    PolicyDenied,
    Unsupported,
    ProtocolViolation,
    RateLimited,
    Internal,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailure => "auth-failure",
            Self::DeviceOffline => "device-offline",
            Self::Conflict => "conflict",
            Self::NotOwner => "not-owner",
            Self::Expired => "expired",
            Self::NotFound => "not-found",
            Self::BackpressureExceeded => "backpressure-exceeded",
            Self::TunnelLost => "tunnel-lost",
            Self::RelayLost => "relay-lost",
            Self::RelayTimeout => "relay-timeout",
            Self::OpenTimeout => "open-timeout",
            Self::Superseded => "superseded",
            Self::PolicyDenied => "policy-denied",
            Self::Unsupported => "unsupported",
            Self::ProtocolViolation => "protocol-violation",
            Self::RateLimited => "rate-limited",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the hatch protocol and gateway layers.
#[derive(Debug, Error)]
pub enum HatchError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("device offline: {0}")]
    DeviceOffline(String),

    #[error("registry conflict: device {device_id} is owned by {owner}")]
    Conflict { device_id: String, owner: String },

    #[error("instance does not own device {0}")]
    NotOwner(String),

    #[error("tunnel record expired for device {0}")]
    Expired(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("channel {0} exceeded its send buffer cap")]
    BackpressureExceeded(u32),

    #[error("tunnel lost: {0}")]
    TunnelLost(String),

    #[error("relay lost: {0}")]
    RelayLost(String),

    #[error("relay open timed out after {0:?}")]
    RelayTimeout(Duration),

    #[error("device did not answer channel open within {0:?}")]
    OpenTimeout(Duration),

    #[error("superseded by a newer agent connection")]
    Superseded,

    #[error("permission denied: {0}")]
    PolicyDenied(String),

    #[error("channel rejected ({code}): {message}")]
    ChannelRejected { code: ReasonCode, message: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("recorder bug: {0}")]
    RecorderBug(String),

    #[error("rate limited")]
    RateLimited,

    #[error("token error: {0}")]
    Token(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl HatchError {
    /// The reason code reported to peers and clients for this error.
    pub fn code(&self) -> ReasonCode {
        match self {
            Self::AuthFailure(_) | Self::Token(_) => ReasonCode::AuthFailure,
            Self::DeviceOffline(_) => ReasonCode::DeviceOffline,
            Self::Conflict { .. } => ReasonCode::Conflict,
            Self::NotOwner(_) => ReasonCode::NotOwner,
            Self::Expired(_) => ReasonCode::Expired,
            Self::NotFound(_) => ReasonCode::NotFound,
            Self::BackpressureExceeded(_) => ReasonCode::BackpressureExceeded,
            Self::TunnelLost(_) => ReasonCode::TunnelLost,
            Self::RelayLost(_) => ReasonCode::RelayLost,
            Self::RelayTimeout(_) => ReasonCode::RelayTimeout,
            Self::OpenTimeout(_) => ReasonCode::OpenTimeout,
            Self::Superseded => ReasonCode::Superseded,
            Self::PolicyDenied(_) => ReasonCode::PolicyDenied,
            Self::ChannelRejected { code, .. } => *code,
            Self::ProtocolViolation(_) | Self::Codec(_) | Self::InvalidMessage(_) => {
                ReasonCode::ProtocolViolation
            }
            Self::RateLimited => ReasonCode::RateLimited,
            Self::Store(_)
            | Self::Transport(_)
            | Self::RecorderBug(_)
            | Self::Io(_)
            | Self::Other(_) => ReasonCode::Internal,
        }
    }

    /// Rebuild an error from a code and message received from a peer.
    pub fn from_code(code: ReasonCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ReasonCode::AuthFailure => Self::AuthFailure(message),
            ReasonCode::DeviceOffline => Self::DeviceOffline(message),
            ReasonCode::NotFound => Self::NotFound(message),
            ReasonCode::TunnelLost => Self::TunnelLost(message),
            ReasonCode::RelayLost => Self::RelayLost(message),
            ReasonCode::Superseded => Self::Superseded,
            ReasonCode::PolicyDenied => Self::PolicyDenied(message),
            ReasonCode::ProtocolViolation => Self::ProtocolViolation(message),
            ReasonCode::RateLimited => Self::RateLimited,
            code => Self::ChannelRejected { code, message },
        }
    }

    /// Whether a bounded retry is worthwhile (shared store or bus hiccups).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Transport(_))
    }
}

impl From<ciborium::de::Error<std::io::Error>> for HatchError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        HatchError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for HatchError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        HatchError::Codec(e.to_string())
    }
}

pub type HatchResult<T> = Result<T, HatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_peers() {
        let err = HatchError::from_code(ReasonCode::DeviceOffline, "d1");
        assert_eq!(err.code(), ReasonCode::DeviceOffline);

        let err = HatchError::from_code(ReasonCode::Unsupported, "sftp");
        assert!(matches!(
            err,
            HatchError::ChannelRejected { code: ReasonCode::Unsupported, .. }
        ));
    }

    #[test]
    fn reason_code_serializes_kebab_case() {
        let json = serde_json::to_string(&ReasonCode::BackpressureExceeded).unwrap();
        assert_eq!(json, "\"backpressure-exceeded\"");
        assert_eq!(ReasonCode::RelayTimeout.to_string(), "relay-timeout");
    }

    #[test]
    fn only_store_and_transport_are_transient() {
        assert!(HatchError::Store("redis down".into()).is_transient());
        assert!(!HatchError::Superseded.is_transient());
    }
}
