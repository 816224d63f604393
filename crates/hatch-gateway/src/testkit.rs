//! In-memory agents and clients for gateway tests.

use crate::auth::{DeviceIdentity, DeviceStatus};
use crate::tunnel::TunnelManager;
use hatch_core::codec::cbor_encode;
use hatch_core::transport::{split_stream, BoxedReader, BoxedWriter};
use hatch_core::{
    cbor_decode, ChannelEvent, ClientMessage, HatchError, HatchResult, Incoming, MuxConfig, Role,
    TunnelConnection, TunnelFrame,
};

pub(crate) fn device_identity(device_id: &str) -> DeviceIdentity {
    DeviceIdentity {
        device_id: device_id.to_string(),
        public_key_fingerprint: None,
        namespace_id: "default".into(),
        status: DeviceStatus::Pending,
        last_heartbeat: None,
    }
}

/// Agent end of an attached tunnel.
pub(crate) struct TestAgent {
    pub conn: TunnelConnection,
    pub incoming: Incoming,
}

/// Attach `device` to `mgr` over an in-memory stream, skipping credential
/// checks, and start the agent side of the mux.
pub(crate) async fn connect_agent(mgr: &TunnelManager, device: &str) -> HatchResult<TestAgent> {
    let (gateway_side, agent_side) = tokio::io::duplex(1 << 20);
    let (gr, gw) = split_stream(gateway_side);
    let (mut ar, aw) = split_stream(agent_side);
    mgr.attach(device_identity(device), gr, gw).await?;
    expect_ack(&mut ar).await?;
    Ok(start_agent_mux(ar, aw, device))
}

pub(crate) async fn expect_ack(reader: &mut BoxedReader) -> HatchResult<String> {
    let bytes = reader
        .read_frame()
        .await?
        .ok_or_else(|| HatchError::TunnelLost("closed before ack".into()))?;
    match cbor_decode::<TunnelFrame>(&bytes)? {
        TunnelFrame::HandshakeAck { instance_id, .. } => Ok(instance_id),
        TunnelFrame::HandshakeReject { code, message } => Err(HatchError::from_code(code, message)),
        other => Err(HatchError::ProtocolViolation(format!(
            "expected handshake_ack, got {}",
            other.name()
        ))),
    }
}

pub(crate) fn start_agent_mux(reader: BoxedReader, writer: BoxedWriter, device: &str) -> TestAgent {
    let config = MuxConfig {
        heartbeat_interval: None,
        ..MuxConfig::new(Role::Agent)
    };
    let (conn, incoming) = TunnelConnection::spawn(reader, writer, config, format!("agent:{device}"));
    TestAgent { conn, incoming }
}

/// Accept every channel and echo its data back. Eof closes with status 0.
pub(crate) fn spawn_echo(mut incoming: Incoming) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(pending) = incoming.next().await {
            let Ok(mut channel) = pending.accept() else {
                continue;
            };
            tokio::spawn(async move {
                while let Some(event) = channel.recv().await {
                    match event {
                        ChannelEvent::Data(data) => {
                            if channel.sender().write(&data).await.is_err() {
                                break;
                            }
                        }
                        ChannelEvent::Eof => {
                            channel.close(Some(0));
                            break;
                        }
                        ChannelEvent::Resize { .. } => {}
                        ChannelEvent::Closed { .. } | ChannelEvent::Failed { .. } => break,
                    }
                }
            });
        }
    })
}

/// Client end of a broker connection.
pub(crate) struct TestClient {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl TestClient {
    pub fn pair() -> (Self, BoxedReader, BoxedWriter) {
        let (client_side, gateway_side) = tokio::io::duplex(1 << 20);
        let (reader, writer) = split_stream(client_side);
        let (gr, gw) = split_stream(gateway_side);
        (Self { reader, writer }, gr, gw)
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> HatchResult<()> {
        let payload = cbor_encode(msg)?;
        self.writer.write_frame(&payload).await
    }

    pub async fn recv(&mut self) -> HatchResult<Option<ClientMessage>> {
        match self.reader.read_frame().await? {
            Some(bytes) => Ok(Some(cbor_decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Next message. Panics if the stream ended or failed.
    pub async fn expect(&mut self) -> ClientMessage {
        match self.recv().await {
            Ok(Some(msg)) => msg,
            other => panic!("expected a client message, got {other:?}"),
        }
    }
}
