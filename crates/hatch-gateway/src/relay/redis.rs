//! Redis pub/sub bus.
//!
//! Publishing goes through one shared connection manager. Each subscription
//! gets its own pub/sub connection, forwarded into a [`Subscription`] by a
//! task that ends when the subscription is dropped.

use super::bus::{BusMessage, MessageBus, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use hatch_core::{HatchError, HatchResult};
use redis::aio::ConnectionManager;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, warn};

pub struct RedisBus {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisBus {
    pub fn connect(url: &str) -> HatchResult<Self> {
        let client = redis::Client::open(url).map_err(bus_err)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> HatchResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async { self.client.get_connection_manager().await.map_err(bus_err) })
            .await?;
        Ok(conn.clone())
    }
}

fn bus_err(e: redis::RedisError) -> HatchError {
    HatchError::Transport(format!("redis bus: {e}"))
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> HatchResult<usize> {
        let mut conn = self.conn().await?;
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload.as_ref())
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(bus_err)
    }

    async fn subscribe(&self, topic: &str) -> HatchResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(bus_err)?;
        pubsub.subscribe(topic).await.map_err(bus_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = topic.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!(topic = %name, "redis subscription ended");
                            break;
                        };
                        let message = BusMessage {
                            topic: name.clone(),
                            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                        };
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            debug!(topic = %name, "redis subscription closed");
        });
        Ok(Subscription::new(topic, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_urls() {
        assert!(matches!(
            RedisBus::connect("not a url"),
            Err(HatchError::Transport(_))
        ));
    }
}
