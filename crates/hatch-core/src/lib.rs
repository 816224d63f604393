//! hatch-core: Shared protocol library for the hatch reverse-tunnel gateway.
//!
//! Provides the tunnel and client wire messages, length-prefixed CBOR framing,
//! the channel multiplexer used on both ends of an agent tunnel, identity
//! fingerprints, authorized_keys parsing, and HMAC device tokens.

pub mod codec;
pub mod error;
pub mod identity;
pub mod keys;
pub mod messages;
pub mod mux;
pub mod token;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, MAX_FRAME_LEN};
pub use error::{HatchError, HatchResult, ReasonCode};
pub use identity::{fingerprint, short_fingerprint};
pub use messages::{
    ChannelParams, ClientMessage, EndReason, ForwardTarget, Purpose, PtySize, TunnelFrame,
    CLIENT_PROTOCOL_VERSION, TUNNEL_PROTOCOL_VERSION,
};
pub use mux::{
    Channel, ChannelEvent, ChannelReceiver, ChannelSender, CloseReason, Incoming, MuxConfig,
    PendingChannel, Role, TunnelConnection,
};
pub use token::{create_device_token, generate_secret, verify_device_token};
