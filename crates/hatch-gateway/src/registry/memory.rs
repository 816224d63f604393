//! In-process registry store for tests and single-node deployments.
//!
//! Expiry runs on the tokio clock so tests can drive it with
//! `tokio::time::pause`/`advance`.

use super::{conflict, now_ms, RegistryStore, TunnelRecord};
use async_trait::async_trait;
use hatch_core::{HatchError, HatchResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Entry {
    record: TunnelRecord,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Registry store backed by a mutex-protected map.
#[derive(Default)]
pub struct MemoryRegistryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn register(
        &self,
        device_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> HatchResult<TunnelRecord> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(device_id) {
            if entry.live(now) && entry.record.owner_instance_id != instance_id {
                return Err(conflict(device_id, &entry.record.owner_instance_id));
            }
        }
        let record = TunnelRecord::new(device_id, instance_id, ttl);
        entries.insert(
            device_id.to_string(),
            Entry {
                record: record.clone(),
                expires_at: now + ttl,
            },
        );
        debug!(device_id, instance_id, "tunnel registered");
        Ok(record)
    }

    async fn heartbeat(&self, device_id: &str, instance_id: &str) -> HatchResult<TunnelRecord> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = match entries.get_mut(device_id) {
            Some(entry) if entry.live(now) => entry,
            _ => return Err(HatchError::Expired(device_id.to_string())),
        };
        if entry.record.owner_instance_id != instance_id {
            return Err(HatchError::NotOwner(device_id.to_string()));
        }
        entry.record.last_heartbeat = now_ms();
        entry.expires_at = now + Duration::from_millis(entry.record.ttl_ms);
        Ok(entry.record.clone())
    }

    async fn lookup(&self, device_id: &str) -> HatchResult<TunnelRecord> {
        let now = Instant::now();
        let entries = self.entries.lock();
        match entries.get(device_id) {
            Some(entry) if entry.live(now) => Ok(entry.record.clone()),
            _ => Err(HatchError::NotFound(format!("no tunnel for device {device_id}"))),
        }
    }

    async fn unregister(&self, device_id: &str, instance_id: &str) -> HatchResult<bool> {
        self.evict(device_id, instance_id).await
    }

    async fn evict(&self, device_id: &str, expected_owner: &str) -> HatchResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get(device_id) {
            Some(entry) if entry.record.owner_instance_id == expected_owner => {
                entries.remove(device_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn concurrent_registers_have_exactly_one_winner() {
        let store = Arc::new(MemoryRegistryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.register("d1", &format!("gw-{i}"), TTL).await
            }));
        }

        let mut winners = Vec::new();
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(record) => winners.push(record.owner_instance_id),
                Err(HatchError::Conflict { owner, .. }) => {
                    conflicts += 1;
                    assert!(owner.starts_with("gw-"));
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, 15);
        assert_eq!(store.lookup("d1").await.unwrap().owner_instance_id, winners[0]);
    }

    #[tokio::test]
    async fn owner_may_re_register() {
        let store = MemoryRegistryStore::new();
        store.register("d1", "a", TTL).await.unwrap();
        store.register("d1", "a", TTL).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn record_without_heartbeat_expires() {
        let store = MemoryRegistryStore::new();
        store.register("d1", "a", TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        store.heartbeat("d1", "a").await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.lookup("d1").await.is_ok());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(
            store.lookup("d1").await,
            Err(HatchError::NotFound(_))
        ));
        assert!(matches!(
            store.heartbeat("d1", "a").await,
            Err(HatchError::Expired(_))
        ));
        // An expired record no longer blocks other instances.
        store.register("d1", "b", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_from_non_owner_is_rejected() {
        let store = MemoryRegistryStore::new();
        store.register("d1", "a", TTL).await.unwrap();
        assert!(matches!(
            store.heartbeat("d1", "b").await,
            Err(HatchError::NotOwner(_))
        ));
    }

    #[tokio::test]
    async fn unregister_and_evict_are_conditional() {
        let store = MemoryRegistryStore::new();
        store.register("d1", "a", TTL).await.unwrap();
        assert!(!store.unregister("d1", "b").await.unwrap());
        assert!(!store.evict("d1", "b").await.unwrap());
        assert!(store.evict("d1", "a").await.unwrap());
        assert!(store.lookup("d1").await.is_err());

        // A stale evictor cannot delete a fresh registration.
        store.register("d1", "c", TTL).await.unwrap();
        assert!(!store.evict("d1", "a").await.unwrap());
        assert_eq!(store.lookup("d1").await.unwrap().owner_instance_id, "c");
    }
}
