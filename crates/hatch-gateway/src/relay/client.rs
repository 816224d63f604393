//! Origin side of the relay: asks the owning instance to open a channel.

use super::bus::MessageBus;
use super::link::spawn_link;
use super::protocol::{
    instance_topic, relay_down, relay_up, reply_topic, ChannelOpenRequest, InstanceMessage,
    ReplyMessage,
};
use super::RelaySettings;
use crate::handshake::generate_id;
use bytes::Bytes;
use hatch_core::codec::cbor_encode;
use hatch_core::{
    cbor_decode, Channel, ChannelParams, HatchError, HatchResult, Purpose, Role, TunnelConnection,
};
use std::sync::Arc;
use tracing::{debug, info};

/// A channel to a device whose tunnel lives on another instance.
pub struct RelayStream {
    pub channel: Channel,
    /// Close once the channel has ended.
    pub link: TunnelConnection,
}

#[derive(Clone)]
pub struct RelayClient {
    bus: Arc<dyn MessageBus>,
    instance_id: String,
    settings: RelaySettings,
}

impl RelayClient {
    pub fn new(bus: Arc<dyn MessageBus>, instance_id: impl Into<String>, settings: RelaySettings) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Open `purpose` on `device_id` through `owner`.
    ///
    /// `RelayLost` if the owner is not listening, `RelayTimeout` if it does
    /// not answer in time, otherwise whatever the owner's open failed with.
    pub async fn open(
        &self,
        owner: &str,
        device_id: &str,
        purpose: Purpose,
        params: ChannelParams,
    ) -> HatchResult<RelayStream> {
        let request_id = generate_id();
        let reply_to = reply_topic(&self.instance_id, &request_id);

        // Both subscriptions must exist before the owner can answer.
        let mut replies = self.bus.subscribe(&reply_to).await?;
        let inbound = self.bus.subscribe(&relay_down(&request_id)).await?;

        let request = InstanceMessage::OpenRequest(ChannelOpenRequest {
            request_id: request_id.clone(),
            reply_to,
            device_id: device_id.to_string(),
            purpose,
            params,
            window: self.settings.window,
        });
        let delivered = self
            .bus
            .publish(&instance_topic(owner), Bytes::from(cbor_encode(&request)?))
            .await?;
        if delivered == 0 {
            return Err(HatchError::RelayLost(format!(
                "instance {owner} is not listening"
            )));
        }
        debug!(request_id = %request_id, owner = %owner, device_id = %device_id, "relay open sent");

        let reply = tokio::time::timeout(self.settings.open_timeout, replies.recv())
            .await
            .map_err(|_| HatchError::RelayTimeout(self.settings.open_timeout))?
            .ok_or_else(|| HatchError::RelayLost("reply subscription closed".into()))?;

        match cbor_decode::<ReplyMessage>(&reply.payload)? {
            ReplyMessage::ChannelOpenAck {
                relay_channel_id,
                window,
                ..
            } => {
                let (link, channel) = spawn_link(
                    self.bus.clone(),
                    inbound,
                    relay_up(&request_id),
                    Role::Gateway,
                    &self.settings,
                    &request_id,
                    purpose,
                    window,
                )?;
                info!(request_id = %request_id, owner = %owner, channel_id = relay_channel_id, "relay established");
                Ok(RelayStream { channel, link })
            }
            ReplyMessage::ChannelOpenError { code, message, .. } => {
                Err(HatchError::from_code(code, message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::bus::LocalBus;
    use hatch_core::ReasonCode;
    use std::time::Duration;

    #[tokio::test]
    async fn missing_owner_is_relay_lost() {
        let bus = Arc::new(LocalBus::new());
        let client = RelayClient::new(bus, "gw-b", RelaySettings::default());
        let err = client
            .open("gw-a", "d1", Purpose::Shell, ChannelParams::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ReasonCode::RelayLost);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_owner_times_out() {
        let bus = Arc::new(LocalBus::new());
        let _owner = bus.subscribe(&instance_topic("gw-a")).await.unwrap();
        let settings = RelaySettings {
            open_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let client = RelayClient::new(bus, "gw-b", settings);
        let err = client
            .open("gw-a", "d1", Purpose::Shell, ChannelParams::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HatchError::RelayTimeout(d) if d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn owner_errors_are_passed_through() {
        let bus = Arc::new(LocalBus::new());
        let mut owner = bus.subscribe(&instance_topic("gw-a")).await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            let msg = owner.recv().await.unwrap();
            let InstanceMessage::OpenRequest(req) = cbor_decode(&msg.payload).unwrap() else {
                panic!("expected open request");
            };
            let reply = ReplyMessage::ChannelOpenError {
                request_id: req.request_id,
                code: ReasonCode::DeviceOffline,
                message: "no tunnel for d1".into(),
            };
            responder
                .publish(&req.reply_to, Bytes::from(cbor_encode(&reply).unwrap()))
                .await
                .unwrap();
        });

        let client = RelayClient::new(bus, "gw-b", RelaySettings::default());
        let err = client
            .open("gw-a", "d1", Purpose::Exec, ChannelParams::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HatchError::DeviceOffline(_)));
    }
}
