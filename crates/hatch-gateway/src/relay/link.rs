//! Relay streams as tunnel connections over bus topics.
//!
//! Each side of a relay runs a [`TunnelConnection`] whose transport is a
//! pair of bus topics, so the credit window, buffer cap and heartbeat of the
//! agent tunnel apply unchanged. A publish nobody receives fails the link
//! with `RelayLost`, as does a missed keep-alive.

use super::bus::{MessageBus, Subscription};
use super::RelaySettings;
use bytes::Bytes;
use hatch_core::transport::{FrameReader, FrameWriter};
use hatch_core::{
    Channel, HatchError, HatchResult, MuxConfig, Purpose, ReasonCode, Role, TunnelConnection,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The only channel a relay link carries.
pub const RELAY_CHANNEL_ID: u32 = 1;

pub struct BusReader {
    sub: Subscription,
}

impl BusReader {
    pub fn new(sub: Subscription) -> Self {
        Self { sub }
    }
}

impl FrameReader for BusReader {
    fn read_frame(&mut self) -> Pin<Box<dyn Future<Output = HatchResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(async move { Ok(self.sub.recv().await.map(|m| m.payload.to_vec())) })
    }
}

pub struct BusWriter {
    bus: Arc<dyn MessageBus>,
    topic: String,
}

impl BusWriter {
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }
}

impl FrameWriter for BusWriter {
    fn write_frame<'a>(
        &'a mut self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = HatchResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let delivered = self
                .bus
                .publish(&self.topic, Bytes::copy_from_slice(payload))
                .await
                .map_err(|e| HatchError::RelayLost(e.to_string()))?;
            if delivered == 0 {
                return Err(HatchError::RelayLost(format!(
                    "no subscriber on {}",
                    self.topic
                )));
            }
            Ok(())
        })
    }

    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = HatchResult<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Start one side of a relay link with its single channel already in place.
#[allow(clippy::too_many_arguments)]
pub fn spawn_link(
    bus: Arc<dyn MessageBus>,
    inbound: Subscription,
    outbound_topic: String,
    role: Role,
    settings: &RelaySettings,
    relay_id: &str,
    purpose: Purpose,
    peer_window: u32,
) -> HatchResult<(TunnelConnection, Channel)> {
    let config = MuxConfig {
        window: settings.window,
        max_buffer: settings.max_buffer,
        heartbeat_interval: Some(settings.keepalive_interval),
        max_missed_heartbeats: settings.max_missed_keepalives,
        lost_code: ReasonCode::RelayLost,
        ..MuxConfig::new(role)
    };
    TunnelConnection::spawn_adopted(
        Box::new(BusReader::new(inbound)),
        Box::new(BusWriter::new(bus, outbound_topic)),
        config,
        format!("relay:{relay_id}"),
        RELAY_CHANNEL_ID,
        purpose,
        peer_window,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::bus::LocalBus;
    use hatch_core::ChannelEvent;

    async fn link_pair(
        bus: Arc<LocalBus>,
        settings: &RelaySettings,
    ) -> ((TunnelConnection, Channel), (TunnelConnection, Channel)) {
        let up = bus.subscribe("up").await.unwrap();
        let down = bus.subscribe("down").await.unwrap();
        let owner = spawn_link(
            bus.clone(),
            up,
            "down".into(),
            Role::Agent,
            settings,
            "t",
            Purpose::Shell,
            settings.window,
        )
        .unwrap();
        let origin = spawn_link(
            bus,
            down,
            "up".into(),
            Role::Gateway,
            settings,
            "t",
            Purpose::Shell,
            settings.window,
        )
        .unwrap();
        (origin, owner)
    }

    #[tokio::test]
    async fn links_carry_channel_traffic_both_ways() {
        let bus = Arc::new(LocalBus::new());
        let settings = RelaySettings::default();
        let ((_ol, mut origin), (_wl, mut owner)) = link_pair(bus, &settings).await;

        origin.send(b"whoami\n").unwrap();
        assert_eq!(owner.recv().await, Some(ChannelEvent::Data(b"whoami\n".to_vec())));
        owner.sender().resize(100, 30).unwrap();
        owner.send(b"root\n").unwrap();
        assert_eq!(
            origin.recv().await,
            Some(ChannelEvent::Resize { cols: 100, rows: 30 })
        );
        assert_eq!(origin.recv().await, Some(ChannelEvent::Data(b"root\n".to_vec())));

        owner.close(Some(0));
        assert_eq!(
            origin.recv().await,
            Some(ChannelEvent::Closed {
                exit_status: Some(0)
            })
        );
    }

    #[tokio::test]
    async fn vanished_peer_fails_the_link_with_relay_lost() {
        let bus = Arc::new(LocalBus::new());
        let settings = RelaySettings::default();
        let ((origin_link, mut origin), (owner_link, owner)) =
            link_pair(bus.clone(), &settings).await;

        // The owner's process goes away: its link and subscription vanish.
        owner_link.close(ReasonCode::RelayLost, "owner gone");
        drop(owner);
        drop(owner_link);
        while bus.subscriber_count("up") > 0 {
            tokio::task::yield_now().await;
        }

        let _ = origin.send(b"anyone there?");
        match origin.recv().await {
            Some(ChannelEvent::Failed { code, .. }) => assert_eq!(code, ReasonCode::RelayLost),
            other => panic!("expected relay failure, got {other:?}"),
        }
        assert_eq!(origin_link.closed().await.code, ReasonCode::RelayLost);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_misses_keepalives() {
        let bus = Arc::new(LocalBus::new());
        let settings = RelaySettings::default();
        // Someone holds the up topic but never answers.
        let _mute = bus.subscribe("up").await.unwrap();
        let down = bus.subscribe("down").await.unwrap();
        let (link, _ch) = spawn_link(
            bus.clone(),
            down,
            "up".into(),
            Role::Gateway,
            &settings,
            "t",
            Purpose::Exec,
            settings.window,
        )
        .unwrap();

        let reason = link.closed().await;
        assert_eq!(reason.code, ReasonCode::RelayLost);
        assert!(reason.message.contains("heartbeats unanswered"));
    }
}
