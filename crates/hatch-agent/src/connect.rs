//! Dialing the gateway and keeping the tunnel up.
//!
//! One dial = TCP connect, optional TLS, the `Handshake` frame, then the
//! gateway's `HandshakeAck` or `HandshakeReject`. After an ack the tunnel
//! is handed to the multiplexer and channel opens are served until it
//! closes. Lost tunnels are redialed with exponential backoff; an
//! authentication reject ends the loop.

use crate::channel::{serve_channel, ChannelServices};
use crate::config::{AgentConfig, TlsOptions};
use crate::credential::DeviceCredential;
use hatch_core::codec::cbor_encode;
use hatch_core::transport::{split_stream, BoxedReader, BoxedWriter};
use hatch_core::{
    cbor_decode, CloseReason, HatchError, HatchResult, Incoming, MuxConfig, ReasonCode, Role,
    TunnelConnection, TunnelFrame,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

/// What the gateway told us in its ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAck {
    pub instance_id: String,
    pub heartbeat_interval: Duration,
    pub window: u32,
}

/// Exponential reconnect delay: `min`, doubling, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Send the handshake and wait for the gateway's answer.
pub async fn handshake(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    device_id: &str,
    credential: &DeviceCredential,
    timeout: Duration,
) -> HatchResult<GatewayAck> {
    let frame = TunnelFrame::Handshake(credential.handshake(device_id, unix_now()));
    writer.write_frame(&cbor_encode(&frame)?).await?;

    let bytes = tokio::time::timeout(timeout, reader.read_frame())
        .await
        .map_err(|_| HatchError::Transport("handshake timed out".into()))??
        .ok_or_else(|| HatchError::TunnelLost("gateway closed during handshake".into()))?;
    match cbor_decode::<TunnelFrame>(&bytes)? {
        TunnelFrame::HandshakeAck {
            instance_id,
            heartbeat_interval_ms,
            window,
        } => Ok(GatewayAck {
            instance_id,
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms.max(1)),
            window,
        }),
        TunnelFrame::HandshakeReject { code, message } => Err(HatchError::from_code(code, message)),
        other => Err(HatchError::ProtocolViolation(format!(
            "expected handshake_ack, got {}",
            other.name()
        ))),
    }
}

/// Build a TLS connector trusting `ca_cert`, or nothing at all when insecure.
pub fn tls_connector(options: &TlsOptions) -> HatchResult<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| HatchError::Other(format!("TLS setup failed: {e}")))?;

    let config = if options.insecure {
        warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth()
    } else {
        let path = options
            .ca_cert
            .as_ref()
            .ok_or_else(|| HatchError::Other("no CA certificate configured".into()))?;
        let pem = std::fs::read(path)
            .map_err(|e| HatchError::Other(format!("cannot read CA {}: {e}", path.display())))?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            let cert = cert.map_err(|e| HatchError::Other(format!("bad CA PEM: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| HatchError::Other(format!("bad CA certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(HatchError::Other(format!(
                "no certificates in {}",
                path.display()
            )));
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Device agent: dials, handshakes and serves until told to stop.
pub struct Agent {
    device_id: String,
    gateway: String,
    credential: DeviceCredential,
    services: Arc<ChannelServices>,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    handshake_timeout: Duration,
    reconnect: Backoff,
    current: Mutex<Option<TunnelConnection>>,
}

impl Agent {
    pub fn from_config(config: &AgentConfig) -> HatchResult<Self> {
        let credential = config.credential.load()?;
        let tls = match &config.tls {
            Some(options) => {
                let name = ServerName::try_from(options.server_name.clone()).map_err(|e| {
                    HatchError::Other(format!("invalid TLS server name {:?}: {e}", options.server_name))
                })?;
                Some((tls_connector(options)?, name))
            }
            None => None,
        };
        Ok(Self {
            device_id: config.device_id.clone(),
            gateway: config.gateway.clone(),
            credential,
            services: Arc::new(config.channel_services()),
            tls,
            handshake_timeout: config.handshake_timeout,
            reconnect: Backoff::new(config.reconnect_min, config.reconnect_max),
            current: Mutex::new(None),
        })
    }

    /// An agent dialing plain TCP, for tests and embedding.
    pub fn new(
        device_id: impl Into<String>,
        gateway: impl Into<String>,
        credential: DeviceCredential,
        services: ChannelServices,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            gateway: gateway.into(),
            credential,
            services: Arc::new(services),
            tls: None,
            handshake_timeout: Duration::from_secs(15),
            reconnect: Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            current: Mutex::new(None),
        }
    }

    pub fn with_reconnect(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect = Backoff::new(min, max.max(min));
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn dial(&self) -> HatchResult<(BoxedReader, BoxedWriter)> {
        let tcp = tokio::time::timeout(self.handshake_timeout, TcpStream::connect(&self.gateway))
            .await
            .map_err(|_| HatchError::Transport(format!("connect to {} timed out", self.gateway)))?
            .map_err(|e| HatchError::Transport(format!("connect to {} failed: {e}", self.gateway)))?;
        tcp.set_nodelay(true)?;
        match &self.tls {
            Some((connector, name)) => {
                let stream = connector
                    .connect(name.clone(), tcp)
                    .await
                    .map_err(|e| HatchError::Transport(format!("TLS handshake failed: {e}")))?;
                Ok(split_stream(stream))
            }
            None => Ok(split_stream(tcp)),
        }
    }

    /// Dial once and start the multiplexer over the acked tunnel.
    pub async fn connect(&self) -> HatchResult<(TunnelConnection, Incoming, GatewayAck)> {
        let (mut reader, mut writer) = self.dial().await?;
        let ack = handshake(
            &mut reader,
            &mut writer,
            &self.device_id,
            &self.credential,
            self.handshake_timeout,
        )
        .await?;
        let config = MuxConfig {
            window: ack.window,
            heartbeat_interval: Some(ack.heartbeat_interval),
            ..MuxConfig::new(Role::Agent)
        };
        let (conn, incoming) = TunnelConnection::spawn(
            reader,
            writer,
            config,
            format!("gateway:{}", ack.instance_id),
        );
        Ok((conn, incoming, ack))
    }

    /// Serve channel opens until the tunnel closes.
    pub async fn serve(&self, conn: TunnelConnection, mut incoming: Incoming) -> CloseReason {
        self.set_current(Some(conn.clone()));
        while let Some(pending) = incoming.next().await {
            let services = self.services.clone();
            tokio::spawn(async move { serve_channel(pending, &services).await });
        }
        let reason = conn.closed().await;
        self.set_current(None);
        reason
    }

    /// Keep a tunnel up until an authentication reject.
    pub async fn run(&self) -> HatchResult<()> {
        let mut backoff = self.reconnect.clone();
        loop {
            match self.connect().await {
                Ok((conn, incoming, ack)) => {
                    backoff.reset();
                    info!(
                        device_id = %self.device_id,
                        instance_id = %ack.instance_id,
                        "tunnel established"
                    );
                    let reason = self.serve(conn, incoming).await;
                    warn!(device_id = %self.device_id, code = %reason.code, "tunnel closed: {}", reason.message);
                }
                Err(e) if e.code() == ReasonCode::AuthFailure => {
                    error!(device_id = %self.device_id, error = %e, "gateway rejected credentials");
                    return Err(e);
                }
                Err(e) => warn!(device_id = %self.device_id, error = %e, "connect failed"),
            }
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    /// Close the current tunnel, if any.
    pub fn shutdown(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(conn) = current.as_ref() {
                conn.close(ReasonCode::TunnelLost, "agent shutting down");
            }
        }
    }

    fn set_current(&self, conn: Option<TunnelConnection>) {
        if let Ok(mut current) = self.current.lock() {
            *current = conn;
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Accepts any server certificate. Only used with `insecure`.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use hatch_core::messages::{DeviceProof, Handshake};
    use hatch_core::{ChannelEvent, ChannelParams, Purpose};
    use tokio::net::TcpListener;

    async fn read_handshake(reader: &mut BoxedReader) -> Handshake {
        let bytes = reader.read_frame().await.unwrap().unwrap();
        match cbor_decode::<TunnelFrame>(&bytes).unwrap() {
            TunnelFrame::Handshake(hs) => hs,
            other => panic!("expected handshake, got {}", other.name()),
        }
    }

    async fn send(writer: &mut BoxedWriter, frame: TunnelFrame) {
        writer.write_frame(&cbor_encode(&frame).unwrap()).await.unwrap();
    }

    fn ack() -> TunnelFrame {
        TunnelFrame::HandshakeAck {
            instance_id: "gw-test".into(),
            heartbeat_interval_ms: 10_000,
            window: 64 * 1024,
        }
    }

    fn key_agent(addr: String) -> Agent {
        Agent::new(
            "d1",
            addr,
            DeviceCredential::Key(SigningKey::from_bytes(&[9u8; 32])),
            ChannelServices::new("/bin/sh"),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn handshake_returns_ack() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut ar, mut aw) = split_stream(a);
        let (mut gr, mut gw) = split_stream(b);
        let gateway = tokio::spawn(async move {
            let hs = read_handshake(&mut gr).await;
            send(&mut gw, ack()).await;
            hs
        });

        let cred = DeviceCredential::Token(vec![1, 2, 3]);
        let got = handshake(&mut ar, &mut aw, "d1", &cred, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got.instance_id, "gw-test");
        assert_eq!(got.heartbeat_interval, Duration::from_secs(10));

        let hs = gateway.await.unwrap();
        assert_eq!(hs.device_id, "d1");
        assert_eq!(hs.proof, DeviceProof::Token { token: vec![1, 2, 3] });
    }

    #[tokio::test]
    async fn handshake_reject_maps_to_error() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut ar, mut aw) = split_stream(a);
        let (mut gr, mut gw) = split_stream(b);
        tokio::spawn(async move {
            read_handshake(&mut gr).await;
            send(
                &mut gw,
                TunnelFrame::HandshakeReject {
                    code: ReasonCode::RateLimited,
                    message: "slow down".into(),
                },
            )
            .await;
        });

        let cred = DeviceCredential::Token(vec![0]);
        let err = handshake(&mut ar, &mut aw, "d1", &cred, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ReasonCode::RateLimited);
    }

    #[tokio::test]
    async fn run_stops_on_auth_reject() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = split_stream(stream);
            read_handshake(&mut r).await;
            send(
                &mut w,
                TunnelFrame::HandshakeReject {
                    code: ReasonCode::AuthFailure,
                    message: "unknown device".into(),
                },
            )
            .await;
        });

        let agent = key_agent(addr);
        let err = tokio::time::timeout(Duration::from_secs(5), agent.run())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), ReasonCode::AuthFailure);
    }

    #[tokio::test]
    async fn run_redials_after_tunnel_loss_and_serves_channels() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            // First dial: ack, then drop the connection.
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = split_stream(stream);
            read_handshake(&mut r).await;
            send(&mut w, ack()).await;
            drop((r, w));

            // Second dial: ack, then run an exec channel through it.
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = split_stream(stream);
            let hs = read_handshake(&mut r).await;
            assert!(matches!(hs.proof, DeviceProof::Signature { .. }));
            send(&mut w, ack()).await;
            let config = MuxConfig {
                heartbeat_interval: None,
                ..MuxConfig::new(Role::Gateway)
            };
            let (conn, _incoming) = TunnelConnection::spawn(r, w, config, "gw-test");
            let params = ChannelParams {
                command: Some("echo tunnel-ok".into()),
                ..ChannelParams::default()
            };
            let mut ch = conn.open_channel(Purpose::Exec, params).await.unwrap();
            let mut out = Vec::new();
            let status = loop {
                match ch.recv().await.unwrap() {
                    ChannelEvent::Data(data) => out.extend_from_slice(&data),
                    ChannelEvent::Closed { exit_status } => break exit_status,
                    _ => {}
                }
            };
            let _ = done_tx.send((out, status));
        });

        let agent = Arc::new(
            key_agent(addr).with_reconnect(Duration::from_millis(10), Duration::from_millis(50)),
        );
        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };
        let (out, status) = tokio::time::timeout(Duration::from_secs(10), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"tunnel-ok\n");
        assert_eq!(status, Some(0));

        agent.shutdown();
        runner.abort();
    }
}
