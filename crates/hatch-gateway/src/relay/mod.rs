//! Cross-instance relay.
//!
//! When a client lands on an instance that does not hold the device's
//! tunnel, that instance (the origin) asks the owner over the bus to open a
//! channel, and the owner splices the device channel onto a relay link.

pub mod bus;
pub mod client;
pub mod link;
pub mod protocol;
pub mod redis;
pub mod service;

pub use bus::{BusMessage, LocalBus, MessageBus, Subscription};
pub use client::{RelayClient, RelayStream};
pub use self::redis::RedisBus;
pub use service::RelayService;

use hatch_core::mux::{DEFAULT_MAX_BUFFER, DEFAULT_WINDOW};
use hatch_core::{Channel, ChannelEvent, ChannelReceiver, ChannelSender};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub open_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_missed_keepalives: u32,
    pub window: u32,
    pub max_buffer: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            max_missed_keepalives: 3,
            window: DEFAULT_WINDOW,
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

/// Copy events both ways between two channels until both have ended.
///
/// Writes wait for the target's buffer to drain, so a slow reader on one
/// side holds back credit on the other.
pub async fn splice(a: Channel, b: Channel) {
    let (a_tx, a_rx) = a.split();
    let (b_tx, b_rx) = b.split();
    tokio::join!(forward(a_rx, b_tx), forward(b_rx, a_tx));
}

async fn forward(mut from: ChannelReceiver, to: ChannelSender) {
    while let Some(event) = from.recv().await {
        trace!(from = from.id(), to = to.id(), "splice event");
        match event {
            ChannelEvent::Data(data) => {
                if to.write(&data).await.is_err() {
                    return;
                }
            }
            ChannelEvent::Resize { cols, rows } => {
                let _ = to.resize(cols, rows);
            }
            ChannelEvent::Eof => to.eof(),
            ChannelEvent::Closed { exit_status } => {
                to.close(exit_status);
                return;
            }
            ChannelEvent::Failed { code, message } => {
                to.fail(code, message);
                return;
            }
        }
    }
    to.close(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_core::transport::split_stream;
    use hatch_core::{MuxConfig, Purpose, ReasonCode, Role, TunnelConnection};

    fn tunnel_pair() -> (TunnelConnection, TunnelConnection) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (ar, aw) = split_stream(a);
        let (br, bw) = split_stream(b);
        let quiet = |role| MuxConfig {
            heartbeat_interval: None,
            ..MuxConfig::new(role)
        };
        let (gw, _) = TunnelConnection::spawn(ar, aw, quiet(Role::Gateway), "gw");
        let (agent, _) = TunnelConnection::spawn(br, bw, quiet(Role::Agent), "agent");
        (gw, agent)
    }

    #[tokio::test]
    async fn splice_forwards_data_and_close() {
        let (left_gw, left_agent) = tunnel_pair();
        let (right_gw, right_agent) = tunnel_pair();
        let mut outer = left_gw.adopt_channel(1, Purpose::Shell, DEFAULT_WINDOW).unwrap();
        let inner_a = left_agent.adopt_channel(1, Purpose::Shell, DEFAULT_WINDOW).unwrap();
        let inner_b = right_gw.adopt_channel(1, Purpose::Shell, DEFAULT_WINDOW).unwrap();
        let mut device = right_agent.adopt_channel(1, Purpose::Shell, DEFAULT_WINDOW).unwrap();

        let spliced = tokio::spawn(splice(inner_a, inner_b));

        outer.send(b"echo hi\n").unwrap();
        assert_eq!(device.recv().await, Some(ChannelEvent::Data(b"echo hi\n".to_vec())));
        device.send(b"hi\n").unwrap();
        assert_eq!(outer.recv().await, Some(ChannelEvent::Data(b"hi\n".to_vec())));

        device.close(Some(3));
        assert_eq!(
            outer.recv().await,
            Some(ChannelEvent::Closed {
                exit_status: Some(3)
            })
        );
        spliced.await.unwrap();
    }

    #[tokio::test]
    async fn splice_propagates_failures() {
        let (left_gw, left_agent) = tunnel_pair();
        let (right_gw, right_agent) = tunnel_pair();
        let mut outer = left_gw.adopt_channel(1, Purpose::Exec, DEFAULT_WINDOW).unwrap();
        let inner_a = left_agent.adopt_channel(1, Purpose::Exec, DEFAULT_WINDOW).unwrap();
        let inner_b = right_gw.adopt_channel(1, Purpose::Exec, DEFAULT_WINDOW).unwrap();
        let _device = right_agent.adopt_channel(1, Purpose::Exec, DEFAULT_WINDOW).unwrap();

        let spliced = tokio::spawn(splice(inner_a, inner_b));
        right_gw.close(ReasonCode::TunnelLost, "agent went away");

        match outer.recv().await {
            Some(ChannelEvent::Failed { code, .. }) => assert_eq!(code, ReasonCode::TunnelLost),
            other => panic!("expected failure, got {other:?}"),
        }
        spliced.await.unwrap();
    }
}
