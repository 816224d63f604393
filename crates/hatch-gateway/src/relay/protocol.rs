//! Inter-instance relay messages and bus topic names.
//!
//! Control messages are CBOR encoded like every other hatch frame. Relay
//! stream traffic itself is plain [`hatch_core::TunnelFrame`]s on the
//! `up`/`down` topics.

use hatch_core::{ChannelParams, Purpose, ReasonCode};
use serde::{Deserialize, Serialize};

/// Device online/offline notices.
pub const DEVICE_STATUS_TOPIC: &str = "hatch:device-status";

/// Requests and eviction notices addressed to one instance.
pub fn instance_topic(instance_id: &str) -> String {
    format!("hatch:instance:{instance_id}")
}

pub fn reply_topic(instance_id: &str, request_id: &str) -> String {
    format!("hatch:reply:{instance_id}:{request_id}")
}

/// Origin to owner.
pub fn relay_up(relay_id: &str) -> String {
    format!("hatch:relay:{relay_id}:up")
}

/// Owner to origin.
pub fn relay_down(relay_id: &str) -> String {
    format!("hatch:relay:{relay_id}:down")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpenRequest {
    /// Also names the relay stream's topics.
    pub request_id: String,
    pub reply_to: String,
    pub device_id: String,
    pub purpose: Purpose,
    pub params: ChannelParams,
    /// Credit the origin grants the owner on the relay stream.
    pub window: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceMessage {
    OpenRequest(ChannelOpenRequest),
    /// The device's tunnel now lives on `new_owner`.
    Evict { device_id: String, new_owner: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyMessage {
    ChannelOpenAck {
        request_id: String,
        relay_channel_id: u32,
        window: u32,
    },
    ChannelOpenError {
        request_id: String,
        code: ReasonCode,
        message: String,
    },
}
