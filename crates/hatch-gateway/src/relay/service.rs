//! Owner side of the relay: serves requests addressed to this instance.

use super::bus::MessageBus;
use super::link::{spawn_link, RELAY_CHANNEL_ID};
use super::protocol::{
    instance_topic, relay_down, relay_up, ChannelOpenRequest, InstanceMessage, ReplyMessage,
};
use super::{splice, RelaySettings};
use crate::tunnel::TunnelManager;
use bytes::Bytes;
use hatch_core::codec::cbor_encode;
use hatch_core::{cbor_decode, HatchResult, ReasonCode, Role};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct RelayService {
    tunnels: TunnelManager,
    bus: Arc<dyn MessageBus>,
    settings: RelaySettings,
}

impl RelayService {
    pub fn new(tunnels: TunnelManager, bus: Arc<dyn MessageBus>, settings: RelaySettings) -> Self {
        Self {
            tunnels,
            bus,
            settings,
        }
    }

    /// Subscribe to this instance's topic and serve it in the background.
    ///
    /// Returns once the subscription is live.
    pub async fn start(self) -> HatchResult<JoinHandle<()>> {
        let topic = instance_topic(self.tunnels.instance_id());
        let mut sub = self.bus.subscribe(&topic).await?;
        info!(topic = %topic, "relay service listening");
        let service = Arc::new(self);
        Ok(tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                match cbor_decode::<InstanceMessage>(&msg.payload) {
                    Ok(InstanceMessage::OpenRequest(req)) => {
                        let service = service.clone();
                        tokio::spawn(async move { service.serve_open(req).await });
                    }
                    Ok(InstanceMessage::Evict {
                        device_id,
                        new_owner,
                    }) => {
                        service.tunnels.supersede(&device_id, &new_owner).await;
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "undecodable instance message"),
                }
            }
            debug!(topic = %topic, "relay service stopped");
        }))
    }

    async fn serve_open(&self, req: ChannelOpenRequest) {
        let request_id = req.request_id.clone();
        debug!(request_id = %request_id, device_id = %req.device_id, purpose = %req.purpose, "relay open requested");

        let local = match self
            .tunnels
            .open_local(&req.device_id, req.purpose, req.params.clone())
            .await
        {
            Ok(ch) => ch,
            Err(e) => {
                debug!(request_id = %request_id, error = %e, "relay open failed");
                self.reply(
                    &req.reply_to,
                    ReplyMessage::ChannelOpenError {
                        request_id,
                        code: e.code(),
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let linked = async {
            let inbound = self.bus.subscribe(&relay_up(&request_id)).await?;
            spawn_link(
                self.bus.clone(),
                inbound,
                relay_down(&request_id),
                Role::Agent,
                &self.settings,
                &request_id,
                req.purpose,
                req.window,
            )
        }
        .await;
        let (link, relay) = match linked {
            Ok(pair) => pair,
            Err(e) => {
                local.close(None);
                self.reply(
                    &req.reply_to,
                    ReplyMessage::ChannelOpenError {
                        request_id,
                        code: ReasonCode::Internal,
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let acked = self
            .reply(
                &req.reply_to,
                ReplyMessage::ChannelOpenAck {
                    request_id: request_id.clone(),
                    relay_channel_id: RELAY_CHANNEL_ID,
                    window: self.settings.window,
                },
            )
            .await;
        if !acked {
            // The origin stopped waiting (open timeout).
            local.close(None);
            link.close(ReasonCode::RelayTimeout, "origin stopped waiting");
            return;
        }

        info!(request_id = %request_id, device_id = %req.device_id, "relay stream open");
        splice(local, relay).await;
        link.close(ReasonCode::RelayLost, "relay stream finished");
        debug!(request_id = %request_id, "relay stream closed");
    }

    /// Publish a reply. Returns whether anyone received it.
    async fn reply(&self, topic: &str, msg: ReplyMessage) -> bool {
        let payload = match cbor_encode(&msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode relay reply");
                return false;
            }
        };
        match self.bus.publish(topic, Bytes::from(payload)).await {
            Ok(n) => n > 0,
            Err(e) => {
                warn!(topic = %topic, error = %e, "failed to publish relay reply");
                false
            }
        }
    }
}
