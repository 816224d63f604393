//! Device status publication.

use crate::auth::DeviceStatus;
use crate::registry::now_ms;
use crate::relay::protocol::DEVICE_STATUS_TOPIC;
use crate::relay::MessageBus;
use async_trait::async_trait;
use bytes::Bytes;
use hatch_core::{HatchError, HatchResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish_status(&self, device_id: &str, status: DeviceStatus) -> HatchResult<()>;
}

/// Writes status changes to the log only.
#[derive(Debug, Default)]
pub struct LogStatusPublisher;

#[async_trait]
impl StatusPublisher for LogStatusPublisher {
    async fn publish_status(&self, device_id: &str, status: DeviceStatus) -> HatchResult<()> {
        info!(device_id, status = status.as_str(), "device status");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusEvent {
    pub device_id: String,
    pub status: DeviceStatus,
    pub instance_id: String,
    /// UNIX epoch milliseconds.
    pub at: u64,
}

/// Publishes JSON status events on the device-status topic.
pub struct BusStatusPublisher {
    bus: Arc<dyn MessageBus>,
    instance_id: String,
}

impl BusStatusPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, instance_id: impl Into<String>) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
        }
    }
}

#[async_trait]
impl StatusPublisher for BusStatusPublisher {
    async fn publish_status(&self, device_id: &str, status: DeviceStatus) -> HatchResult<()> {
        let event = DeviceStatusEvent {
            device_id: device_id.to_string(),
            status,
            instance_id: self.instance_id.clone(),
            at: now_ms(),
        };
        let payload = serde_json::to_vec(&event).map_err(|e| HatchError::Other(e.to_string()))?;
        // Nobody listening is fine.
        self.bus
            .publish(DEVICE_STATUS_TOPIC, Bytes::from(payload))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::LocalBus;

    #[tokio::test]
    async fn bus_publisher_emits_json_events() {
        let bus = Arc::new(LocalBus::new());
        let mut sub = bus.subscribe(DEVICE_STATUS_TOPIC).await.unwrap();
        let publisher = BusStatusPublisher::new(bus, "gw-a");
        publisher
            .publish_status("d1", DeviceStatus::Online)
            .await
            .unwrap();

        let msg = sub.recv().await.unwrap();
        let event: DeviceStatusEvent = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(event.device_id, "d1");
        assert_eq!(event.status, DeviceStatus::Online);
        assert_eq!(event.instance_id, "gw-a");
    }

    #[tokio::test]
    async fn publishing_without_listeners_succeeds() {
        let publisher = BusStatusPublisher::new(Arc::new(LocalBus::new()), "gw-a");
        assert!(publisher
            .publish_status("d1", DeviceStatus::Offline)
            .await
            .is_ok());
    }
}
