//! Session broker: one task per client connection.
//!
//! The connection walks
//! `Connecting → Authenticating → Authorized → ChannelEstablishing → Active
//! → Closing → Closed`, or ends in `Rejected` before a channel is live.
//! Nothing is opened on a tunnel until the user is authenticated and the
//! requested purpose is in scope.

use crate::auth::{CredentialProvider, GatewayRateLimits, Permission, UserCredentials, UserIdentity};
use crate::handshake::{generate_id, generate_nonce};
use crate::relay::RelayClient;
use crate::session::{Direction, NewSession, RecordingStore, SessionHandle, SessionManager};
use crate::tunnel::TunnelManager;
use hatch_core::codec::cbor_encode;
use hatch_core::identity::client_transcript;
use hatch_core::messages::{AuthMethod, AuthRequest};
use hatch_core::transport::{BoxedReader, BoxedWriter};
use hatch_core::{
    cbor_decode, Channel, ChannelEvent, ChannelParams, ChannelSender, ClientMessage, EndReason,
    HatchError, HatchResult, Purpose, ReasonCode, TunnelConnection, CLIENT_PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Connecting,
    Authenticating,
    Authorized,
    ChannelEstablishing,
    Active,
    Closing,
    Closed,
    Rejected,
}

impl BrokerState {
    pub fn can_transition_to(self, next: BrokerState) -> bool {
        use BrokerState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Authorized)
                | (Authenticating, Rejected)
                | (Authorized, ChannelEstablishing)
                | (Authorized, Rejected)
                | (ChannelEstablishing, Active)
                | (ChannelEstablishing, Rejected)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Per-message deadline before the session is live.
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub absolute_timeout: Option<Duration>,
    /// How long a closing channel may take to confirm before it is dropped.
    pub close_grace: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            absolute_timeout: None,
            close_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct SessionBroker {
    credentials: Arc<dyn CredentialProvider>,
    tunnels: TunnelManager,
    relay: RelayClient,
    sessions: Arc<SessionManager>,
    recordings: Arc<dyn RecordingStore>,
    rate_limits: Arc<Mutex<GatewayRateLimits>>,
    settings: BrokerSettings,
}

/// What the connection looked like when it finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOutcome {
    pub state: BrokerState,
    pub session_id: Option<String>,
    pub end_reason: Option<EndReason>,
}

struct ClientConn {
    peer: IpAddr,
    reader: Option<BoxedReader>,
    writer: BoxedWriter,
    state: BrokerState,
    session_id: Option<String>,
    end_reason: Option<EndReason>,
}

impl ClientConn {
    fn transition(&mut self, next: BrokerState) -> HatchResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(HatchError::ProtocolViolation(format!(
                "broker cannot go from {:?} to {next:?}",
                self.state
            )));
        }
        debug!(peer = %self.peer, from = ?self.state, to = ?next, "broker state");
        self.state = next;
        Ok(())
    }

    async fn send(&mut self, msg: &ClientMessage) -> HatchResult<()> {
        let payload = cbor_encode(msg)?;
        self.writer.write_frame(&payload).await
    }

    async fn recv(&mut self, timeout: Duration) -> HatchResult<ClientMessage> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| HatchError::Other("client reader already taken".into()))?;
        let bytes = tokio::time::timeout(timeout, reader.read_frame())
            .await
            .map_err(|_| HatchError::ProtocolViolation("client timed out".into()))??
            .ok_or_else(|| HatchError::TunnelLost("client disconnected".into()))?;
        cbor_decode(&bytes)
    }

    /// Answer with `msg`, close the connection and end in `Rejected`.
    async fn reject(&mut self, msg: ClientMessage) -> HatchResult<()> {
        if let Err(e) = self.send(&msg).await {
            debug!(peer = %self.peer, error = %e, "failed to deliver rejection");
        }
        let _ = self.writer.shutdown().await;
        self.transition(BrokerState::Rejected)
    }
}

fn auth_fail(err: &HatchError) -> ClientMessage {
    ClientMessage::AuthFail {
        code: err.code(),
        message: err.to_string(),
    }
}

fn open_fail(err: &HatchError) -> ClientMessage {
    ClientMessage::OpenFail {
        code: err.code(),
        message: err.to_string(),
    }
}

/// Narrow the client's request to what `permission` allows.
pub fn apply_permission(
    permission: &Permission,
    purpose: Purpose,
    mut params: ChannelParams,
) -> HatchResult<ChannelParams> {
    if !permission.has_scope(purpose) {
        return Err(HatchError::PolicyDenied(format!("{purpose} is not in scope")));
    }
    if !permission.allow_pty {
        params.pty = None;
    }
    if let Some(forced) = &permission.forced_command {
        if matches!(purpose, Purpose::Shell | Purpose::Exec) {
            params.command = Some(forced.clone());
        }
    }
    Ok(params)
}

/// The device end of a session: a local channel or a relay stream.
struct Route {
    channel: Channel,
    owner: String,
    link: Option<TunnelConnection>,
}

impl SessionBroker {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        tunnels: TunnelManager,
        relay: RelayClient,
        sessions: Arc<SessionManager>,
        recordings: Arc<dyn RecordingStore>,
        rate_limits: Arc<Mutex<GatewayRateLimits>>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            credentials,
            tunnels,
            relay,
            sessions,
            recordings,
            rate_limits,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run one client connection to completion.
    pub async fn handle_client(
        &self,
        peer: IpAddr,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> BrokerOutcome {
        let mut conn = ClientConn {
            peer,
            reader: Some(reader),
            writer,
            state: BrokerState::Connecting,
            session_id: None,
            end_reason: None,
        };
        if let Err(e) = self.run(&mut conn).await {
            debug!(peer = %peer, state = ?conn.state, error = %e, "client connection ended with error");
            if !conn.state.is_terminal() {
                let next = match conn.state {
                    BrokerState::Connecting => BrokerState::Closed,
                    _ => BrokerState::Rejected,
                };
                let _ = conn.writer.shutdown().await;
                conn.state = next;
            }
        }
        BrokerOutcome {
            state: conn.state,
            session_id: conn.session_id,
            end_reason: conn.end_reason,
        }
    }

    async fn run(&self, conn: &mut ClientConn) -> HatchResult<()> {
        let timeout = self.settings.handshake_timeout;

        let username = match conn.recv(timeout).await {
            Ok(ClientMessage::Hello { version, username }) => {
                conn.transition(BrokerState::Authenticating)?;
                if version != CLIENT_PROTOCOL_VERSION {
                    let err = HatchError::InvalidMessage(format!(
                        "unsupported protocol version: {version} (expected {CLIENT_PROTOCOL_VERSION})"
                    ));
                    return conn.reject(auth_fail(&err)).await;
                }
                username
            }
            Ok(other) => {
                return Err(HatchError::ProtocolViolation(format!(
                    "expected hello, got {other:?}"
                )))
            }
            Err(e) => {
                conn.transition(BrokerState::Closed)?;
                return Err(e);
            }
        };

        if !self.rate_limits.lock().check_auth(&conn.peer) {
            warn!(peer = %conn.peer, username = %username, "auth rate limit exceeded");
            return conn.reject(auth_fail(&HatchError::RateLimited)).await;
        }

        let session_id = generate_id();
        let nonce = generate_nonce();
        conn.send(&ClientMessage::Challenge {
            session_id: session_id.clone(),
            nonce: nonce.clone(),
        })
        .await?;

        let user = match conn.recv(timeout).await? {
            ClientMessage::Auth(request) => {
                let credentials = match credentials_from(username, request, &session_id, &nonce) {
                    Ok(c) => c,
                    Err(e) => return conn.reject(auth_fail(&e)).await,
                };
                match self.credentials.authenticate_user(&credentials).await {
                    Ok(user) => user,
                    Err(e) => {
                        info!(peer = %conn.peer, error = %e, "client auth failed");
                        return conn.reject(auth_fail(&e)).await;
                    }
                }
            }
            other => {
                let err = HatchError::ProtocolViolation(format!("expected auth, got {other:?}"));
                return conn.reject(auth_fail(&err)).await;
            }
        };
        conn.send(&ClientMessage::AuthOk {
            user_id: user.user_id.clone(),
        })
        .await?;
        conn.transition(BrokerState::Authorized)?;

        let (device_id, purpose, params) = match conn.recv(timeout).await? {
            ClientMessage::Open {
                device,
                purpose,
                params,
            } => (device, purpose, params),
            other => {
                let err = HatchError::ProtocolViolation(format!("expected open, got {other:?}"));
                return conn.reject(open_fail(&err)).await;
            }
        };
        let (permission, params) = match self.authorize(&user, &device_id, purpose, params).await {
            Ok(granted) => granted,
            Err(e) => {
                info!(user_id = %user.user_id, device_id = %device_id, error = %e, "session not authorized");
                return conn.reject(open_fail(&e)).await;
            }
        };

        conn.transition(BrokerState::ChannelEstablishing)?;
        let route = match self.route(&device_id, purpose, params).await {
            Ok(route) => route,
            Err(e) => {
                info!(device_id = %device_id, error = %e, "channel not established");
                return conn.reject(open_fail(&e)).await;
            }
        };

        let handle = match self
            .sessions
            .create(NewSession {
                session_id: session_id.clone(),
                device_id: device_id.clone(),
                user_id: user.user_id.clone(),
                purpose,
                owner_instance_id: route.owner.clone(),
                authorized_scope: permission,
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                route.channel.close(None);
                if let Some(link) = &route.link {
                    link.close(ReasonCode::RelayLost, "session refused");
                }
                return conn.reject(open_fail(&e)).await;
            }
        };
        conn.session_id = Some(session_id.clone());
        conn.send(&ClientMessage::OpenOk {
            session_id: session_id.clone(),
        })
        .await?;
        conn.transition(BrokerState::Active)?;
        info!(
            session_id = %session_id,
            device_id = %device_id,
            owner = %route.owner,
            relayed = route.link.is_some(),
            "session active"
        );

        self.active(conn, route, handle).await
    }

    async fn authorize(
        &self,
        user: &UserIdentity,
        device_id: &str,
        purpose: Purpose,
        params: ChannelParams,
    ) -> HatchResult<(Permission, ChannelParams)> {
        let permission = self.credentials.authorize_session(user, device_id).await?;
        let params = apply_permission(&permission, purpose, params)?;
        Ok((permission, params))
    }

    /// Find the device's tunnel and open a channel on it, here or through
    /// the owning instance.
    async fn route(
        &self,
        device_id: &str,
        purpose: Purpose,
        params: ChannelParams,
    ) -> HatchResult<Route> {
        let record = match self.tunnels.registry().lookup(device_id).await {
            Ok(record) => record,
            Err(HatchError::NotFound(_)) => {
                return Err(HatchError::DeviceOffline(device_id.to_string()))
            }
            Err(e) => return Err(e),
        };

        if record.owner_instance_id == self.tunnels.instance_id() {
            let channel = self.tunnels.open_local(device_id, purpose, params).await?;
            return Ok(Route {
                channel,
                owner: record.owner_instance_id,
                link: None,
            });
        }

        let stream = self
            .relay
            .open(&record.owner_instance_id, device_id, purpose, params)
            .await?;
        Ok(Route {
            channel: stream.channel,
            owner: record.owner_instance_id,
            link: Some(stream.link),
        })
    }

    async fn active(
        &self,
        conn: &mut ClientConn,
        route: Route,
        mut handle: SessionHandle,
    ) -> HatchResult<()> {
        let session_id = handle.session_id.clone();
        let reader = conn
            .reader
            .take()
            .ok_or_else(|| HatchError::Other("client reader already taken".into()))?;
        let mut client_rx = pump_client(reader);
        let (sender, mut receiver) = route.channel.split();

        let absolute_deadline = self.settings.absolute_timeout.map(|d| Instant::now() + d);
        let mut last_activity = Instant::now();
        let mut terminate_open = true;

        let (reason, message) = loop {
            let idle_deadline = self.settings.idle_timeout.map(|d| last_activity + d);
            tokio::select! {
                msg = client_rx.recv() => match msg {
                    Some(Ok(msg)) => {
                        last_activity = Instant::now();
                        match self.from_client(&handle, &sender, msg) {
                            Ok(None) => {}
                            Ok(Some(end)) => break end,
                            Err(e) => break (EndReason::from_failure(e.code()), e.to_string()),
                        }
                    }
                    Some(Err(e)) => break (EndReason::ClientClose, format!("bad client frame: {e}")),
                    None => break (EndReason::ClientClose, "client disconnected".to_string()),
                },
                event = receiver.recv() => match event {
                    Some(ChannelEvent::Data(data)) => {
                        last_activity = Instant::now();
                        record(&handle, Direction::Output, &data);
                        if let Err(e) = conn.send(&ClientMessage::Data { data }).await {
                            break (EndReason::ClientClose, format!("client write failed: {e}"));
                        }
                    }
                    Some(ChannelEvent::Closed { exit_status }) => {
                        if let Some(status) = exit_status {
                            let _ = conn.send(&ClientMessage::Exit { status }).await;
                        }
                        break (EndReason::AgentClose, "device closed the channel".to_string());
                    }
                    Some(ChannelEvent::Failed { code, message }) => {
                        break (EndReason::from_failure(code), message);
                    }
                    Some(ChannelEvent::Eof) | Some(ChannelEvent::Resize { .. }) => {}
                    None => break (EndReason::TunnelLost, "channel gone".to_string()),
                },
                _ = sleep_until(idle_deadline) => {
                    break (EndReason::Timeout, "idle timeout".to_string());
                }
                _ = sleep_until(absolute_deadline) => {
                    break (EndReason::Timeout, "session time limit reached".to_string());
                }
                changed = handle.terminate.changed(), if terminate_open => match changed {
                    Ok(()) => {
                        let reason = (*handle.terminate.borrow()).unwrap_or(EndReason::PolicyRevoked);
                        break (reason, "terminated by gateway".to_string());
                    }
                    Err(_) => terminate_open = false,
                },
            }
        };

        conn.transition(BrokerState::Closing)?;
        conn.end_reason = Some(reason);
        info!(session_id = %session_id, reason = %reason, "closing session: {message}");

        // Release the channel before the relay link carrying it.
        sender.close(None);
        let _ = tokio::time::timeout(self.settings.close_grace, async {
            while let Some(event) = receiver.recv().await {
                if event.is_terminal() {
                    break;
                }
            }
        })
        .await;
        drop(receiver);
        if let Some(link) = &route.link {
            link.close(ReasonCode::RelayLost, "session closed");
        }

        if let Some(sealed) = self.sessions.end(&session_id, reason).await {
            match self.recordings.persist(&sealed).await {
                Ok(()) => self.sessions.mark_recording_persisted(&session_id).await,
                Err(e) => warn!(
                    session_id = %session_id,
                    error = %e,
                    "failed to persist recording; keeping it in memory"
                ),
            }
        }

        if reason != EndReason::ClientClose {
            let _ = conn.send(&ClientMessage::Close { reason, message }).await;
        }
        let _ = conn.writer.shutdown().await;
        conn.transition(BrokerState::Closed)
    }

    /// Apply one client message to the channel. `Some` ends the session.
    fn from_client(
        &self,
        handle: &SessionHandle,
        sender: &ChannelSender,
        msg: ClientMessage,
    ) -> HatchResult<Option<(EndReason, String)>> {
        match msg {
            ClientMessage::Data { data } => {
                sender.send(&data)?;
                record(handle, Direction::Input, &data);
            }
            ClientMessage::Resize { cols, rows } => sender.resize(cols, rows)?,
            ClientMessage::Eof => sender.eof(),
            ClientMessage::Close { message, .. } => {
                return Ok(Some((EndReason::ClientClose, message)));
            }
            other => {
                warn!(session_id = %handle.session_id, "ignoring unexpected client message: {other:?}");
            }
        }
        Ok(None)
    }
}

fn credentials_from(
    username: String,
    request: AuthRequest,
    session_id: &str,
    nonce: &[u8],
) -> HatchResult<UserCredentials> {
    match request.method {
        AuthMethod::Pubkey => {
            let public_key = request
                .public_key
                .ok_or_else(|| HatchError::AuthFailure("missing public key".into()))?;
            let signature = request
                .signature
                .ok_or_else(|| HatchError::AuthFailure("missing signature".into()))?;
            Ok(UserCredentials::PublicKey {
                username,
                public_key,
                signature,
                transcript: client_transcript(session_id, nonce),
            })
        }
        AuthMethod::Password => {
            let password = request
                .password
                .ok_or_else(|| HatchError::AuthFailure("missing password".into()))?;
            Ok(UserCredentials::Password { username, password })
        }
    }
}

fn record(handle: &SessionHandle, direction: Direction, data: &[u8]) {
    if let Err(e) = handle.recorder.lock().record(direction, data) {
        error!(session_id = %handle.session_id, error = %e, "recording dropped a chunk");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Read client frames on their own task so the session loop never cancels
/// a half-read frame.
fn pump_client(mut reader: BoxedReader) -> mpsc::Receiver<HatchResult<ClientMessage>> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        loop {
            let msg = match reader.read_frame().await {
                Ok(Some(bytes)) => cbor_decode::<ClientMessage>(&bytes),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = msg.is_err();
            if tx.send(msg).await.is_err() || failed {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{hash_password, StaticCredentialProvider};
    use crate::registry::{MemoryRegistryStore, TunnelRegistry};
    use crate::relay::{LocalBus, RelaySettings};
    use crate::session::{MemoryRecordingStore, SessionState};
    use crate::status::LogStatusPublisher;
    use crate::testkit::{connect_agent, spawn_echo, TestClient};
    use crate::tunnel::TunnelSettings;
    use ed25519_dalek::{Signer, SigningKey};
    use hatch_core::keys::parse_authorized_key_line;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Fixture {
        broker: SessionBroker,
        tunnels: TunnelManager,
        recordings: Arc<MemoryRecordingStore>,
    }

    fn fixture(provider: StaticCredentialProvider, settings: BrokerSettings) -> Fixture {
        fixture_with(provider, settings, TunnelSettings::default())
    }

    fn fixture_with(
        provider: StaticCredentialProvider,
        settings: BrokerSettings,
        tunnel: TunnelSettings,
    ) -> Fixture {
        let bus = Arc::new(LocalBus::new());
        let tunnels = TunnelManager::new(
            "gw-a",
            TunnelRegistry::new(Arc::new(MemoryRegistryStore::new())),
            bus.clone(),
            Arc::new(LogStatusPublisher),
            tunnel,
        );
        let recordings = Arc::new(MemoryRecordingStore::new());
        let broker = SessionBroker::new(
            Arc::new(provider),
            tunnels.clone(),
            RelayClient::new(bus, "gw-a", RelaySettings::default()),
            Arc::new(SessionManager::new(16)),
            recordings.clone(),
            Arc::new(Mutex::new(GatewayRateLimits::new(5, 30))),
            settings,
        );
        Fixture {
            broker,
            tunnels,
            recordings,
        }
    }

    fn password_provider(options: Option<&str>) -> StaticCredentialProvider {
        let mut provider = StaticCredentialProvider::new("default");
        provider.add_password_user("alice", hash_password("hunter2"), options);
        provider
    }

    fn start(fx: &Fixture) -> (TestClient, tokio::task::JoinHandle<BrokerOutcome>) {
        let (client, reader, writer) = TestClient::pair();
        let broker = fx.broker.clone();
        let task = tokio::spawn(async move { broker.handle_client(PEER, reader, writer).await });
        (client, task)
    }

    async fn login(client: &mut TestClient, password: &str) -> ClientMessage {
        client
            .send(&ClientMessage::Hello {
                version: CLIENT_PROTOCOL_VERSION.into(),
                username: "alice".into(),
            })
            .await
            .unwrap();
        assert!(matches!(client.expect().await, ClientMessage::Challenge { .. }));
        client
            .send(&ClientMessage::Auth(AuthRequest {
                method: AuthMethod::Password,
                public_key: None,
                signature: None,
                password: Some(password.into()),
            }))
            .await
            .unwrap();
        client.expect().await
    }

    async fn open(client: &mut TestClient, device: &str, purpose: Purpose) -> ClientMessage {
        client
            .send(&ClientMessage::Open {
                device: device.into(),
                purpose,
                params: ChannelParams::default(),
            })
            .await
            .unwrap();
        client.expect().await
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use BrokerState::*;
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(ChannelEstablishing.can_transition_to(Rejected));
        assert!(!Active.can_transition_to(Rejected));
        assert!(!Connecting.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(Rejected.is_terminal() && Closed.is_terminal());
    }

    #[test]
    fn permission_narrows_the_request() {
        let perm = Permission {
            namespace_id: "default".into(),
            scopes: vec![Purpose::Shell],
            allow_pty: false,
            forced_command: Some("top".into()),
        };
        let params = ChannelParams {
            command: Some("bash".into()),
            pty: Some(Default::default()),
            ..Default::default()
        };
        let narrowed = apply_permission(&perm, Purpose::Shell, params.clone()).unwrap();
        assert_eq!(narrowed.command.as_deref(), Some("top"));
        assert!(narrowed.pty.is_none());
        assert!(matches!(
            apply_permission(&perm, Purpose::Exec, params),
            Err(HatchError::PolicyDenied(_))
        ));
    }

    #[tokio::test]
    async fn local_session_echoes_records_and_ends_on_client_close() {
        let fx = fixture(password_provider(None), BrokerSettings::default());
        let agent = connect_agent(&fx.tunnels, "d1").await.unwrap();
        spawn_echo(agent.incoming);

        let (mut client, task) = start(&fx);
        assert_eq!(
            login(&mut client, "hunter2").await,
            ClientMessage::AuthOk {
                user_id: "alice".into()
            }
        );
        let session_id = match open(&mut client, "d1", Purpose::Shell).await {
            ClientMessage::OpenOk { session_id } => session_id,
            other => panic!("expected open_ok, got {other:?}"),
        };

        client
            .send(&ClientMessage::Data {
                data: b"hello".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(
            client.expect().await,
            ClientMessage::Data {
                data: b"hello".to_vec()
            }
        );

        drop(client);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, BrokerState::Closed);
        assert_eq!(outcome.end_reason, Some(EndReason::ClientClose));

        let session = fx.broker.sessions().status(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Ended);
        assert_eq!(session.end_reason, Some(EndReason::ClientClose));
        assert!(session.recording_persisted);

        let recording = fx.recordings.load(&session_id).await.unwrap();
        assert_eq!(recording.bytes(Direction::Input), b"hello");
        assert_eq!(recording.bytes(Direction::Output), b"hello");

        while agent.conn.channel_count() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn input_the_device_never_got_is_not_recorded() {
        let tunnel = TunnelSettings {
            max_buffer: 16,
            ..Default::default()
        };
        let fx = fixture_with(password_provider(None), BrokerSettings::default(), tunnel);
        let mut agent = connect_agent(&fx.tunnels, "d1").await.unwrap();
        // Accept but never read, so no credit comes back.
        let holder = tokio::spawn(async move {
            let channel = agent.incoming.next().await.unwrap().accept().unwrap();
            (channel, agent)
        });

        let (mut client, task) = start(&fx);
        login(&mut client, "hunter2").await;
        let session_id = match open(&mut client, "d1", Purpose::Shell).await {
            ClientMessage::OpenOk { session_id } => session_id,
            other => panic!("expected open_ok, got {other:?}"),
        };
        let _held = holder.await.unwrap();

        let flood = vec![b'x'; hatch_core::mux::DEFAULT_WINDOW as usize + 1024];
        client.send(&ClientMessage::Data { data: flood }).await.unwrap();
        match client.expect().await {
            ClientMessage::Close { reason, .. } => {
                assert_eq!(reason, EndReason::BackpressureExceeded)
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(
            task.await.unwrap().end_reason,
            Some(EndReason::BackpressureExceeded)
        );
        let recording = fx.recordings.load(&session_id).await.unwrap();
        assert!(recording.bytes(Direction::Input).is_empty());
    }

    #[tokio::test]
    async fn agent_exit_is_reported_to_the_client() {
        let fx = fixture(password_provider(None), BrokerSettings::default());
        let agent = connect_agent(&fx.tunnels, "d1").await.unwrap();
        spawn_echo(agent.incoming);

        let (mut client, task) = start(&fx);
        login(&mut client, "hunter2").await;
        assert!(matches!(
            open(&mut client, "d1", Purpose::Exec).await,
            ClientMessage::OpenOk { .. }
        ));
        client.send(&ClientMessage::Eof).await.unwrap();

        assert_eq!(client.expect().await, ClientMessage::Exit { status: 0 });
        match client.expect().await {
            ClientMessage::Close { reason, .. } => assert_eq!(reason, EndReason::AgentClose),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(task.await.unwrap().end_reason, Some(EndReason::AgentClose));
    }

    #[tokio::test]
    async fn offline_device_is_rejected_before_any_channel() {
        let fx = fixture(password_provider(None), BrokerSettings::default());
        let (mut client, task) = start(&fx);
        login(&mut client, "hunter2").await;

        match open(&mut client, "d2", Purpose::Shell).await {
            ClientMessage::OpenFail { code, .. } => assert_eq!(code, ReasonCode::DeviceOffline),
            other => panic!("expected open_fail, got {other:?}"),
        }
        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, BrokerState::Rejected);
        assert!(outcome.session_id.is_none());
        assert!(fx.broker.sessions().list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_fails_the_open() {
        let fx = fixture(password_provider(None), BrokerSettings::default());
        let mut agent = connect_agent(&fx.tunnels, "d1").await.unwrap();

        let (mut client, task) = start(&fx);
        login(&mut client, "hunter2").await;
        client
            .send(&ClientMessage::Open {
                device: "d1".into(),
                purpose: Purpose::Shell,
                params: ChannelParams::default(),
            })
            .await
            .unwrap();
        let _unanswered = agent.incoming.next().await.unwrap();

        match client.expect().await {
            ClientMessage::OpenFail { code, .. } => assert_eq!(code, ReasonCode::OpenTimeout),
            other => panic!("expected open_fail, got {other:?}"),
        }
        assert_eq!(task.await.unwrap().state, BrokerState::Rejected);
        assert!(fx.broker.sessions().list().await.is_empty());
        assert!(!agent.conn.is_closed());
    }

    #[tokio::test]
    async fn bad_password_is_rejected() {
        let fx = fixture(password_provider(None), BrokerSettings::default());
        let (mut client, task) = start(&fx);
        match login(&mut client, "wrong").await {
            ClientMessage::AuthFail { code, .. } => assert_eq!(code, ReasonCode::AuthFailure),
            other => panic!("expected auth_fail, got {other:?}"),
        }
        assert_eq!(task.await.unwrap().state, BrokerState::Rejected);
    }

    #[tokio::test]
    async fn purpose_outside_scope_is_denied() {
        let fx = fixture(
            password_provider(Some(r#"scopes="exec""#)),
            BrokerSettings::default(),
        );
        let agent = connect_agent(&fx.tunnels, "d1").await.unwrap();
        let mut incoming = agent.incoming;

        let (mut client, task) = start(&fx);
        login(&mut client, "hunter2").await;
        match open(&mut client, "d1", Purpose::Shell).await {
            ClientMessage::OpenFail { code, .. } => assert_eq!(code, ReasonCode::PolicyDenied),
            other => panic!("expected open_fail, got {other:?}"),
        }
        assert_eq!(task.await.unwrap().state, BrokerState::Rejected);
        assert_eq!(agent.conn.channel_count(), 0);
        assert!(tokio::time::timeout(Duration::from_millis(50), incoming.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn pubkey_auth_signs_the_challenge() {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let line = {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine as _;
            let mut wire = Vec::new();
            wire.extend_from_slice(&11u32.to_be_bytes());
            wire.extend_from_slice(b"ssh-ed25519");
            wire.extend_from_slice(&32u32.to_be_bytes());
            wire.extend_from_slice(key.verifying_key().as_bytes());
            format!("ssh-ed25519 {} alice@laptop", STANDARD.encode(wire))
        };
        let mut provider = StaticCredentialProvider::new("default");
        provider.add_user_keys(vec![parse_authorized_key_line(&line).unwrap()]);
        let fx = fixture(provider, BrokerSettings::default());

        let (mut client, _task) = start(&fx);
        client
            .send(&ClientMessage::Hello {
                version: CLIENT_PROTOCOL_VERSION.into(),
                username: "alice".into(),
            })
            .await
            .unwrap();
        let (session_id, nonce) = match client.expect().await {
            ClientMessage::Challenge { session_id, nonce } => (session_id, nonce),
            other => panic!("expected challenge, got {other:?}"),
        };
        let signature = key.sign(&client_transcript(&session_id, &nonce));
        client
            .send(&ClientMessage::Auth(AuthRequest {
                method: AuthMethod::Pubkey,
                public_key: Some(key.verifying_key().to_bytes().to_vec()),
                signature: Some(signature.to_bytes().to_vec()),
                password: None,
            }))
            .await
            .unwrap();
        assert_eq!(
            client.expect().await,
            ClientMessage::AuthOk {
                user_id: "alice".into()
            }
        );
    }

    #[tokio::test]
    async fn auth_attempts_are_rate_limited_per_ip() {
        let fx = fixture(password_provider(None), BrokerSettings::default());
        for _ in 0..5 {
            let (mut client, task) = start(&fx);
            login(&mut client, "wrong").await;
            task.await.unwrap();
        }
        let (mut client, task) = start(&fx);
        client
            .send(&ClientMessage::Hello {
                version: CLIENT_PROTOCOL_VERSION.into(),
                username: "alice".into(),
            })
            .await
            .unwrap();
        match client.expect().await {
            ClientMessage::AuthFail { code, .. } => assert_eq!(code, ReasonCode::RateLimited),
            other => panic!("expected auth_fail, got {other:?}"),
        }
        assert_eq!(task.await.unwrap().state, BrokerState::Rejected);
    }

    #[tokio::test]
    async fn terminate_ends_the_session_with_the_given_reason() {
        let fx = fixture(password_provider(None), BrokerSettings::default());
        let agent = connect_agent(&fx.tunnels, "d1").await.unwrap();
        spawn_echo(agent.incoming);

        let (mut client, task) = start(&fx);
        login(&mut client, "hunter2").await;
        let session_id = match open(&mut client, "d1", Purpose::Shell).await {
            ClientMessage::OpenOk { session_id } => session_id,
            other => panic!("expected open_ok, got {other:?}"),
        };
        fx.broker
            .sessions()
            .terminate(&session_id, EndReason::PolicyRevoked)
            .await
            .unwrap();

        match client.expect().await {
            ClientMessage::Close { reason, .. } => assert_eq!(reason, EndReason::PolicyRevoked),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(task.await.unwrap().end_reason, Some(EndReason::PolicyRevoked));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_time_out() {
        let settings = BrokerSettings {
            idle_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let fx = fixture(password_provider(None), settings);
        let agent = connect_agent(&fx.tunnels, "d1").await.unwrap();
        spawn_echo(agent.incoming);

        let (mut client, task) = start(&fx);
        login(&mut client, "hunter2").await;
        assert!(matches!(
            open(&mut client, "d1", Purpose::Shell).await,
            ClientMessage::OpenOk { .. }
        ));
        match client.expect().await {
            ClientMessage::Close { reason, .. } => assert_eq!(reason, EndReason::Timeout),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(task.await.unwrap().end_reason, Some(EndReason::Timeout));
    }
}
