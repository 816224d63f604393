//! Tunnel registry: which gateway instance owns each device's tunnel.
//!
//! Every write is a conditional (compare-and-set) operation in the backing
//! store, so concurrent registrations for one device have exactly one winner.

pub mod memory;
pub mod redis;

pub use memory::MemoryRegistryStore;
pub use self::redis::RedisRegistryStore;

use async_trait::async_trait;
use hatch_core::{HatchError, HatchResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// One connected device and the instance holding its tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub device_id: String,
    pub owner_instance_id: String,
    /// UNIX epoch milliseconds.
    pub established_at: u64,
    /// UNIX epoch milliseconds.
    pub last_heartbeat: u64,
    pub ttl_ms: u64,
}

impl TunnelRecord {
    pub fn new(device_id: &str, instance_id: &str, ttl: Duration) -> Self {
        let now = now_ms();
        Self {
            device_id: device_id.to_string(),
            owner_instance_id: instance_id.to_string(),
            established_at: now,
            last_heartbeat: now,
            ttl_ms: ttl.as_millis() as u64,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Atomic conditional operations over the shared key/expiry store.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Succeeds when no unexpired record exists or `instance_id` already owns it.
    /// Otherwise `HatchError::Conflict` naming the current owner.
    async fn register(
        &self,
        device_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> HatchResult<TunnelRecord>;

    /// Refresh TTL and `last_heartbeat`. `NotOwner` or `Expired` on failure.
    async fn heartbeat(&self, device_id: &str, instance_id: &str) -> HatchResult<TunnelRecord>;

    /// Expired records are `NotFound`.
    async fn lookup(&self, device_id: &str) -> HatchResult<TunnelRecord>;

    /// Delete only if still owned by `instance_id`. Returns whether it deleted.
    async fn unregister(&self, device_id: &str, instance_id: &str) -> HatchResult<bool>;

    /// Delete only if the owner is still `expected_owner`.
    async fn evict(&self, device_id: &str, expected_owner: &str) -> HatchResult<bool>;
}

/// Store handle with bounded retries on transient store errors.
#[derive(Clone)]
pub struct TunnelRegistry {
    store: Arc<dyn RegistryStore>,
    attempts: u32,
    backoff: Duration,
}

impl TunnelRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub async fn register(
        &self,
        device_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> HatchResult<TunnelRecord> {
        self.retry("register", device_id, || {
            self.store.register(device_id, instance_id, ttl)
        })
        .await
    }

    pub async fn heartbeat(&self, device_id: &str, instance_id: &str) -> HatchResult<TunnelRecord> {
        self.retry("heartbeat", device_id, || {
            self.store.heartbeat(device_id, instance_id)
        })
        .await
    }

    pub async fn lookup(&self, device_id: &str) -> HatchResult<TunnelRecord> {
        self.retry("lookup", device_id, || self.store.lookup(device_id))
            .await
    }

    pub async fn unregister(&self, device_id: &str, instance_id: &str) -> HatchResult<bool> {
        self.retry("unregister", device_id, || {
            self.store.unregister(device_id, instance_id)
        })
        .await
    }

    pub async fn evict(&self, device_id: &str, expected_owner: &str) -> HatchResult<bool> {
        self.retry("evict", device_id, || {
            self.store.evict(device_id, expected_owner)
        })
        .await
    }

    async fn retry<T, F, Fut>(&self, op: &str, device_id: &str, mut f: F) -> HatchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = HatchResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(op, device_id, attempt, error = %e, "registry store error, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Build a `Conflict` error for `device_id`.
pub(crate) fn conflict(device_id: &str, owner: &str) -> HatchError {
    HatchError::Conflict {
        device_id: device_id.to_string(),
        owner: owner.to_string(),
    }
}
