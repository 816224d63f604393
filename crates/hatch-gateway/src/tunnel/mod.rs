//! Agent tunnels held by this instance.
//!
//! Attaching a device claims it in the shared registry, answers the agent's
//! handshake and starts the multiplexer. A supervisor task per tunnel keeps
//! the registry record alive and cleans up when the tunnel ends. At most one
//! tunnel per device exists system-wide: a newer dial supersedes the older
//! one, locally or on another instance.

use crate::auth::{DeviceIdentity, DeviceStatus};
use crate::handshake::{reject_agent, send_tunnel_frame};
use crate::registry::{now_ms, TunnelRegistry};
use crate::relay::protocol::{instance_topic, InstanceMessage};
use crate::relay::MessageBus;
use crate::status::StatusPublisher;
use bytes::Bytes;
use hatch_core::codec::cbor_encode;
use hatch_core::mux::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_BUFFER, DEFAULT_WINDOW};
use hatch_core::transport::{BoxedReader, BoxedWriter};
use hatch_core::{
    Channel, ChannelParams, HatchError, HatchResult, MuxConfig, Purpose, ReasonCode, Role,
    TunnelConnection, TunnelFrame,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Mux ping interval; also how often the registry record is refreshed.
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub registry_ttl: Duration,
    /// Register attempts when superseding another instance's tunnel.
    pub register_attempts: u32,
    pub window: u32,
    pub max_buffer: usize,
    pub handshake_timeout: Duration,
    /// Bound on waiting for the agent's answer to a channel open.
    pub open_timeout: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: 3,
            registry_ttl: DEFAULT_HEARTBEAT_INTERVAL * 3,
            register_attempts: 3,
            window: DEFAULT_WINDOW,
            max_buffer: DEFAULT_MAX_BUFFER,
            handshake_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(10),
        }
    }
}

struct Entry {
    conn: TunnelConnection,
    generation: u64,
}

struct Inner {
    instance_id: String,
    registry: TunnelRegistry,
    bus: Arc<dyn MessageBus>,
    status: Arc<dyn StatusPublisher>,
    settings: TunnelSettings,
    tunnels: RwLock<HashMap<String, Entry>>,
    identities: Mutex<HashMap<String, DeviceIdentity>>,
    next_generation: AtomicU64,
}

/// Handle to this instance's tunnels. Cheap to clone.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(
        instance_id: impl Into<String>,
        registry: TunnelRegistry,
        bus: Arc<dyn MessageBus>,
        status: Arc<dyn StatusPublisher>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                instance_id: instance_id.into(),
                registry,
                bus,
                status,
                settings,
                tunnels: RwLock::new(HashMap::new()),
                identities: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.inner.registry
    }

    /// Claim `identity`'s device, acknowledge the agent and start its tunnel.
    ///
    /// If the device cannot be claimed the agent gets a `HandshakeReject`.
    pub async fn attach(
        &self,
        identity: DeviceIdentity,
        reader: BoxedReader,
        mut writer: BoxedWriter,
    ) -> HatchResult<TunnelConnection> {
        let inner = &self.inner;
        let device_id = identity.device_id.clone();
        if let Err(e) = self.claim(&device_id).await {
            warn!(device_id = %device_id, error = %e, "cannot claim device");
            reject_agent(&mut writer, e.code(), &e.to_string()).await;
            return Err(e);
        }

        let ack = TunnelFrame::HandshakeAck {
            instance_id: inner.instance_id.clone(),
            heartbeat_interval_ms: inner.settings.heartbeat_interval.as_millis() as u64,
            window: inner.settings.window,
        };
        if let Err(e) = send_tunnel_frame(&mut writer, &ack).await {
            self.release(&device_id).await;
            return Err(e);
        }

        let config = MuxConfig {
            window: inner.settings.window,
            max_buffer: inner.settings.max_buffer,
            heartbeat_interval: Some(inner.settings.heartbeat_interval),
            max_missed_heartbeats: inner.settings.max_missed_heartbeats,
            lost_code: ReasonCode::TunnelLost,
            ..MuxConfig::new(Role::Gateway)
        };
        // Agent-initiated opens are not served; dropping `Incoming` rejects them.
        let (conn, _incoming) =
            TunnelConnection::spawn(reader, writer, config, format!("device:{device_id}"));

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let prior = inner.tunnels.write().await.insert(
            device_id.clone(),
            Entry {
                conn: conn.clone(),
                generation,
            },
        );
        if let Some(prior) = prior {
            info!(device_id = %device_id, "superseding previous local tunnel");
            prior
                .conn
                .evict(ReasonCode::Superseded, "replaced by a newer agent connection");
        }

        inner.identities.lock().insert(
            device_id.clone(),
            DeviceIdentity {
                status: DeviceStatus::Online,
                last_heartbeat: Some(now_ms()),
                ..identity
            },
        );
        self.publish_status(&device_id, DeviceStatus::Online).await;
        info!(device_id = %device_id, instance_id = %inner.instance_id, generation, "tunnel attached");

        tokio::spawn(self.clone().supervise(device_id, generation, conn.clone()));
        Ok(conn)
    }

    /// Register in the shared registry, superseding another owner if needed.
    async fn claim(&self, device_id: &str) -> HatchResult<()> {
        let inner = &self.inner;
        let mut attempt = 1;
        loop {
            match inner
                .registry
                .register(device_id, &inner.instance_id, inner.settings.registry_ttl)
                .await
            {
                Ok(_) => return Ok(()),
                Err(HatchError::Conflict { owner, .. })
                    if attempt < inner.settings.register_attempts =>
                {
                    info!(device_id, owner = %owner, "device tunneled on another instance, superseding");
                    self.notify_evict(&owner, device_id).await;
                    inner.registry.evict(device_id, &owner).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort notice to the previous owner. Its heartbeat seeing
    /// `NotOwner` cleans up if this is lost.
    async fn notify_evict(&self, owner: &str, device_id: &str) {
        let msg = InstanceMessage::Evict {
            device_id: device_id.to_string(),
            new_owner: self.inner.instance_id.clone(),
        };
        let payload = match cbor_encode(&msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(device_id, error = %e, "failed to encode evict notice");
                return;
            }
        };
        match self
            .inner
            .bus
            .publish(&instance_topic(owner), Bytes::from(payload))
            .await
        {
            Ok(0) => debug!(device_id, owner, "evict notice had no listener"),
            Ok(_) => {}
            Err(e) => warn!(device_id, owner, error = %e, "evict notice failed"),
        }
    }

    async fn supervise(self, device_id: String, generation: u64, conn: TunnelConnection) {
        let inner = &self.inner;
        let mut ticker = tokio::time::interval(inner.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let reason = loop {
            tokio::select! {
                reason = conn.closed() => break reason,
                _ = ticker.tick() => {}
            }
            match inner.registry.heartbeat(&device_id, &inner.instance_id).await {
                Ok(record) => {
                    if let Some(id) = inner.identities.lock().get_mut(&device_id) {
                        id.last_heartbeat = Some(record.last_heartbeat);
                    }
                    self.publish_status(&device_id, DeviceStatus::Online).await;
                }
                Err(HatchError::NotOwner(_)) => {
                    warn!(device_id = %device_id, "registry names another owner");
                    conn.evict(ReasonCode::Superseded, "device registered on another instance");
                }
                Err(HatchError::Expired(_)) => {
                    warn!(device_id = %device_id, "registry record expired, re-registering");
                    if let Err(e) = inner
                        .registry
                        .register(&device_id, &inner.instance_id, inner.settings.registry_ttl)
                        .await
                    {
                        warn!(device_id = %device_id, error = %e, "re-register failed");
                        conn.evict(ReasonCode::Superseded, e.to_string());
                    }
                }
                Err(e) => warn!(device_id = %device_id, error = %e, "registry heartbeat failed"),
            }
        };

        let current = {
            let mut tunnels = inner.tunnels.write().await;
            match tunnels.get(&device_id) {
                Some(entry) if entry.generation == generation => {
                    tunnels.remove(&device_id);
                    true
                }
                _ => false,
            }
        };
        info!(device_id = %device_id, generation, code = %reason.code, "tunnel detached: {}", reason.message);
        if current {
            self.release(&device_id).await;
        }
    }

    /// Drop the registry record (if still ours) and mark the device offline.
    async fn release(&self, device_id: &str) {
        let inner = &self.inner;
        if let Err(e) = inner.registry.unregister(device_id, &inner.instance_id).await {
            warn!(device_id, error = %e, "unregister failed; record will expire");
        }
        if let Some(id) = inner.identities.lock().get_mut(device_id) {
            id.status = DeviceStatus::Offline;
        }
        self.publish_status(device_id, DeviceStatus::Offline).await;
    }

    async fn publish_status(&self, device_id: &str, status: DeviceStatus) {
        if let Err(e) = self.inner.status.publish_status(device_id, status).await {
            debug!(device_id, error = %e, "status publish failed");
        }
    }

    /// Open a channel on the local tunnel for `device_id`.
    ///
    /// `OpenTimeout` if the agent does not answer within the configured bound.
    pub async fn open_local(
        &self,
        device_id: &str,
        purpose: Purpose,
        params: ChannelParams,
    ) -> HatchResult<Channel> {
        let conn = self
            .connection(device_id)
            .await
            .ok_or_else(|| HatchError::DeviceOffline(format!("no local tunnel for {device_id}")))?;
        conn.open_channel_within(purpose, params, self.inner.settings.open_timeout)
            .await
    }

    pub async fn connection(&self, device_id: &str) -> Option<TunnelConnection> {
        self.inner
            .tunnels
            .read()
            .await
            .get(device_id)
            .map(|e| e.conn.clone())
    }

    pub async fn is_local(&self, device_id: &str) -> bool {
        self.inner.tunnels.read().await.contains_key(device_id)
    }

    pub fn device_identity(&self, device_id: &str) -> Option<DeviceIdentity> {
        self.inner.identities.lock().get(device_id).cloned()
    }

    /// Another instance took the device over: drop our tunnel.
    pub async fn supersede(&self, device_id: &str, new_owner: &str) {
        let entry = self.inner.tunnels.write().await.remove(device_id);
        match entry {
            Some(entry) => {
                info!(device_id, new_owner, "tunnel superseded by another instance");
                entry
                    .conn
                    .evict(ReasonCode::Superseded, format!("device moved to {new_owner}"));
                if let Some(id) = self.inner.identities.lock().get_mut(device_id) {
                    id.status = DeviceStatus::Offline;
                }
            }
            None => debug!(device_id, "evict notice for a device we do not hold"),
        }
    }

    /// Evict every tunnel (shutdown).
    pub async fn close_all(&self, message: &str) {
        let conns: Vec<TunnelConnection> = self
            .inner
            .tunnels
            .read()
            .await
            .values()
            .map(|e| e.conn.clone())
            .collect();
        for conn in conns {
            conn.evict(ReasonCode::TunnelLost, message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistryStore, RegistryStore};
    use crate::relay::{LocalBus, RelayService, RelaySettings};
    use crate::status::LogStatusPublisher;
    use crate::testkit::connect_agent;
    use hatch_core::ChannelEvent;

    fn manager(id: &str, store: Arc<MemoryRegistryStore>, bus: Arc<LocalBus>) -> TunnelManager {
        TunnelManager::new(
            id,
            TunnelRegistry::new(store),
            bus,
            Arc::new(LogStatusPublisher),
            TunnelSettings::default(),
        )
    }

    #[tokio::test]
    async fn attach_registers_and_detach_unregisters() {
        let store = Arc::new(MemoryRegistryStore::new());
        let mgr = manager("gw-a", store.clone(), Arc::new(LocalBus::new()));

        let agent = connect_agent(&mgr, "d1").await.unwrap();
        assert_eq!(store.lookup("d1").await.unwrap().owner_instance_id, "gw-a");
        assert_eq!(
            mgr.device_identity("d1").unwrap().status,
            DeviceStatus::Online
        );

        agent.conn.close(ReasonCode::TunnelLost, "agent exiting");
        drop(agent);
        while mgr.is_local("d1").await {
            tokio::task::yield_now().await;
        }
        while store.lookup("d1").await.is_ok() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            mgr.device_identity("d1").unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test]
    async fn second_dial_supersedes_the_first() {
        let store = Arc::new(MemoryRegistryStore::new());
        let mgr = manager("gw-a", store.clone(), Arc::new(LocalBus::new()));

        let first = connect_agent(&mgr, "d1").await.unwrap();
        let mut channel = {
            let conn = mgr.connection("d1").await.unwrap();
            let opening = tokio::spawn(async move {
                conn.open_channel(Purpose::Shell, ChannelParams::default()).await
            });
            let mut incoming = first.incoming;
            let pending = incoming.next().await.unwrap();
            let _agent_side = pending.accept().unwrap();
            let ch = opening.await.unwrap().unwrap();
            tokio::spawn(async move {
                let _keep = (_agent_side, incoming);
                std::future::pending::<()>().await
            });
            ch
        };

        let _second = connect_agent(&mgr, "d1").await.unwrap();
        assert_eq!(first.conn.closed().await.code, ReasonCode::Superseded);
        match channel.recv().await {
            Some(ChannelEvent::Failed { code, .. }) => assert_eq!(code, ReasonCode::Superseded),
            other => panic!("expected superseded, got {other:?}"),
        }

        // The newer tunnel keeps the registry record.
        tokio::task::yield_now().await;
        assert!(mgr.is_local("d1").await);
        assert_eq!(store.lookup("d1").await.unwrap().owner_instance_id, "gw-a");
    }

    #[tokio::test]
    async fn dial_on_another_instance_evicts_the_owner() {
        let store = Arc::new(MemoryRegistryStore::new());
        let bus = Arc::new(LocalBus::new());
        let a = manager("gw-a", store.clone(), bus.clone());
        let b = manager("gw-b", store.clone(), bus.clone());
        RelayService::new(a.clone(), bus.clone(), RelaySettings::default())
            .start()
            .await
            .unwrap();

        let on_a = connect_agent(&a, "d1").await.unwrap();
        let _on_b = connect_agent(&b, "d1").await.unwrap();

        assert_eq!(on_a.conn.closed().await.code, ReasonCode::Superseded);
        assert_eq!(store.lookup("d1").await.unwrap().owner_instance_id, "gw-b");
        while a.is_local("d1").await {
            tokio::task::yield_now().await;
        }
        assert!(b.is_local("d1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_seeing_another_owner_closes_the_tunnel() {
        let store = Arc::new(MemoryRegistryStore::new());
        let mgr = manager("gw-a", store.clone(), Arc::new(LocalBus::new()));
        let agent = connect_agent(&mgr, "d1").await.unwrap();

        // Another instance took over without a notice reaching us.
        assert!(store.evict("d1", "gw-a").await.unwrap());
        store
            .register("d1", "gw-z", Duration::from_secs(30))
            .await
            .unwrap();

        let reason = agent.conn.closed().await;
        assert_eq!(reason.code, ReasonCode::Superseded);
        assert_eq!(store.lookup("d1").await.unwrap().owner_instance_id, "gw-z");
    }

    #[tokio::test(start_paused = true)]
    async fn open_local_gives_up_on_a_silent_agent() {
        let settings = TunnelSettings {
            open_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let mgr = TunnelManager::new(
            "gw-a",
            TunnelRegistry::new(Arc::new(MemoryRegistryStore::new())),
            Arc::new(LocalBus::new()),
            Arc::new(LogStatusPublisher),
            settings,
        );
        let mut agent = connect_agent(&mgr, "d1").await.unwrap();
        let opening = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.open_local("d1", Purpose::Shell, ChannelParams::default())
                    .await
            })
        };
        // Received, never answered; the agent still answers pings.
        let _unanswered = agent.incoming.next().await.unwrap();

        let err = opening.await.unwrap().err().unwrap();
        assert_eq!(err.code(), ReasonCode::OpenTimeout);
        let conn = mgr.connection("d1").await.unwrap();
        assert_eq!(conn.channel_count(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn open_local_without_tunnel_is_device_offline() {
        let mgr = manager(
            "gw-a",
            Arc::new(MemoryRegistryStore::new()),
            Arc::new(LocalBus::new()),
        );
        let err = mgr
            .open_local("d9", Purpose::Exec, ChannelParams::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HatchError::DeviceOffline(_)));
        assert!(mgr.device_identity("d9").is_none());
    }
}
