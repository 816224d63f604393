//! Gateway instance: wires the registry, tunnels, relay and broker together
//! and accepts agent and client connections.

use crate::auth::{CredentialProvider, GatewayRateLimits};
use crate::broker::{BrokerOutcome, BrokerSettings, SessionBroker};
use crate::config::{Backend, GatewayConfig};
use crate::handshake::{generate_id, read_agent_handshake, reject_agent};
use crate::registry::{MemoryRegistryStore, RedisRegistryStore, RegistryStore, TunnelRegistry};
use crate::relay::{LocalBus, MessageBus, RedisBus, RelayClient, RelayService, RelaySettings};
use crate::session::{
    FileRecordingStore, MemoryRecordingStore, Playback, RecordingStore, Session, SessionManager,
    SessionState,
};
use crate::status::{BusStatusPublisher, StatusPublisher};
use crate::tunnel::{TunnelManager, TunnelSettings};
use hatch_core::transport::{split_stream, BoxedReader, BoxedWriter};
use hatch_core::{EndReason, HatchError, HatchResult, ReasonCode, TunnelConnection};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// How long [`Gateway::shutdown`] waits for sessions to wind down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a gateway instance is built from.
pub struct GatewayParts {
    pub instance_id: String,
    pub registry: TunnelRegistry,
    pub bus: Arc<dyn MessageBus>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub recordings: Arc<dyn RecordingStore>,
    /// Defaults to publishing on the bus.
    pub status: Option<Arc<dyn StatusPublisher>>,
    pub tunnel: TunnelSettings,
    pub relay: RelaySettings,
    pub broker: BrokerSettings,
    pub max_sessions: usize,
    pub auth_per_minute: u32,
    pub agent_per_minute: u32,
    /// How long ended sessions stay queryable.
    pub retain_ended: Duration,
}

pub struct Gateway {
    instance_id: String,
    credentials: Arc<dyn CredentialProvider>,
    tunnels: TunnelManager,
    broker: SessionBroker,
    sessions: Arc<SessionManager>,
    recordings: Arc<dyn RecordingStore>,
    bus: Arc<dyn MessageBus>,
    rate_limits: Arc<Mutex<GatewayRateLimits>>,
    relay_settings: RelaySettings,
    retain_ended: Duration,
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Self {
        let status = parts.status.unwrap_or_else(|| {
            Arc::new(BusStatusPublisher::new(
                parts.bus.clone(),
                parts.instance_id.clone(),
            ))
        });
        let tunnels = TunnelManager::new(
            parts.instance_id.clone(),
            parts.registry,
            parts.bus.clone(),
            status,
            parts.tunnel,
        );
        let sessions = Arc::new(SessionManager::new(parts.max_sessions));
        let rate_limits = Arc::new(Mutex::new(GatewayRateLimits::new(
            parts.auth_per_minute,
            parts.agent_per_minute,
        )));
        let broker = SessionBroker::new(
            parts.credentials.clone(),
            tunnels.clone(),
            RelayClient::new(
                parts.bus.clone(),
                parts.instance_id.clone(),
                parts.relay.clone(),
            ),
            sessions.clone(),
            parts.recordings.clone(),
            rate_limits.clone(),
            parts.broker,
        );
        Self {
            instance_id: parts.instance_id,
            credentials: parts.credentials,
            tunnels,
            broker,
            sessions,
            recordings: parts.recordings,
            bus: parts.bus,
            rate_limits,
            relay_settings: parts.relay,
            retain_ended: parts.retain_ended,
        }
    }

    /// Build an instance from resolved configuration, connecting to Redis
    /// where configured.
    pub fn from_config(config: &GatewayConfig) -> HatchResult<Self> {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("gw-{}", &generate_id()[..12]));

        let store: Arc<dyn RegistryStore> = match config.file.registry.backend {
            Backend::Memory => Arc::new(MemoryRegistryStore::new()),
            Backend::Redis => Arc::new(RedisRegistryStore::connect(&config.file.registry.url)?),
        };
        let (attempts, backoff) = config.registry_retry();
        let registry = TunnelRegistry::new(store).with_retry(attempts, backoff);

        let bus: Arc<dyn MessageBus> = match config.file.relay.backend {
            Backend::Memory => Arc::new(LocalBus::new()),
            Backend::Redis => Arc::new(RedisBus::connect(&config.file.relay.url)?),
        };

        let recordings: Arc<dyn RecordingStore> = match &config.recording_dir {
            Some(dir) => Arc::new(FileRecordingStore::new(dir.clone())),
            None => Arc::new(MemoryRecordingStore::new()),
        };

        let auth = &config.file.auth;
        Ok(Self::new(GatewayParts {
            instance_id,
            registry,
            bus,
            credentials: Arc::new(config.credential_provider()?),
            recordings,
            status: None,
            tunnel: config.tunnel_settings(),
            relay: config.relay_settings(),
            broker: config.broker_settings(),
            max_sessions: config.max_sessions,
            auth_per_minute: auth.auth_per_minute,
            agent_per_minute: auth.agent_per_minute,
            retain_ended: Duration::from_secs(config.file.session.retain_ended_secs),
        }))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Start serving relay requests and evictions addressed to this instance.
    pub async fn start_relay(&self) -> HatchResult<JoinHandle<()>> {
        RelayService::new(
            self.tunnels.clone(),
            self.bus.clone(),
            self.relay_settings.clone(),
        )
        .start()
        .await
    }

    /// Authenticate an agent dial and attach its tunnel.
    pub async fn serve_agent(
        &self,
        peer: IpAddr,
        mut reader: BoxedReader,
        mut writer: BoxedWriter,
    ) -> HatchResult<TunnelConnection> {
        if !self.rate_limits.lock().check_agent(&peer) {
            warn!(peer = %peer, "agent handshake rate limit exceeded");
            reject_agent(&mut writer, ReasonCode::RateLimited, "too many attempts").await;
            return Err(HatchError::RateLimited);
        }

        let timeout = self.tunnels.settings().handshake_timeout;
        let handshake = match read_agent_handshake(&mut reader, timeout).await {
            Ok(hs) => hs,
            Err(e) => {
                reject_agent(&mut writer, e.code(), &e.to_string()).await;
                return Err(e);
            }
        };
        let identity = match self.credentials.verify_device(&handshake).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(peer = %peer, device_id = %handshake.device_id, error = %e, "agent rejected");
                reject_agent(&mut writer, ReasonCode::AuthFailure, &e.to_string()).await;
                return Err(e);
            }
        };
        self.tunnels.attach(identity, reader, writer).await
    }

    /// Run one client connection through the broker.
    pub async fn serve_client(
        &self,
        peer: IpAddr,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> BrokerOutcome {
        self.broker.handle_client(peer, reader, writer).await
    }

    pub async fn session_status(&self, session_id: &str) -> HatchResult<Session> {
        self.sessions.status(session_id).await
    }

    pub async fn terminate_session(&self, session_id: &str, reason: EndReason) -> HatchResult<()> {
        self.sessions.terminate(session_id, reason).await
    }

    /// Playback of a session: what has been recorded so far if it is still
    /// live, otherwise the stored recording.
    pub async fn stream_recording(&self, session_id: &str) -> HatchResult<Playback> {
        if let Some(recording) = self.sessions.recording(session_id).await {
            return Ok(recording.playback());
        }
        Ok(self.recordings.load(session_id).await?.playback())
    }

    /// Periodic housekeeping.
    pub async fn gc(&self) {
        let removed = self.sessions.gc(self.retain_ended).await;
        self.rate_limits.lock().gc();
        if removed > 0 {
            debug!(removed, "gc pass");
        }
    }

    /// End every session with `shutdown`, then evict every tunnel.
    ///
    /// Sessions get [`SHUTDOWN_GRACE`] to seal their recordings before the
    /// tunnels go away.
    pub async fn shutdown(&self) {
        for session in self.sessions.list().await {
            if session.state == SessionState::Active {
                let _ = self
                    .sessions
                    .terminate(&session.session_id, EndReason::Shutdown)
                    .await;
            }
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.sessions.active_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                active = self.sessions.active_count().await,
                "sessions still open at shutdown"
            );
        }
        self.tunnels.close_all("gateway shutting down").await;
    }

    /// Accept agents and clients until an accept loop fails.
    pub async fn run(
        self: Arc<Self>,
        agent_listen: SocketAddr,
        client_listen: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) -> HatchResult<()> {
        let _relay = self.start_relay().await?;
        let agents = TcpListener::bind(agent_listen).await?;
        let clients = TcpListener::bind(client_listen).await?;
        info!(
            instance_id = %self.instance_id,
            agents = %agent_listen,
            clients = %client_listen,
            tls = tls.is_some(),
            "gateway listening"
        );

        let gc = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                gc.gc().await;
            }
        });

        loop {
            tokio::select! {
                accepted = agents.accept() => {
                    let (stream, addr) = accepted?;
                    let gateway = self.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        let Some((reader, writer)) = wrap(stream, addr, tls).await else {
                            return;
                        };
                        if let Err(e) = gateway.serve_agent(addr.ip(), reader, writer).await {
                            debug!(peer = %addr, error = %e, "agent connection refused");
                        }
                    });
                }
                accepted = clients.accept() => {
                    let (stream, addr) = accepted?;
                    let gateway = self.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        let Some((reader, writer)) = wrap(stream, addr, tls).await else {
                            return;
                        };
                        let outcome = gateway.serve_client(addr.ip(), reader, writer).await;
                        debug!(peer = %addr, state = ?outcome.state, "client connection finished");
                    });
                }
            }
        }
    }
}

async fn wrap(
    stream: TcpStream,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
) -> Option<(BoxedReader, BoxedWriter)> {
    let _ = stream.set_nodelay(true);
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Some(split_stream(tls_stream)),
            Err(e) => {
                debug!(peer = %addr, error = %e, "TLS handshake failed");
                None
            }
        },
        None => Some(split_stream(stream)),
    }
}
