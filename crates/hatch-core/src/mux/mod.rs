//! Channel multiplexer for one agent tunnel.
//!
//! A [`TunnelConnection`] owns one frame transport and a table of channels.
//! It runs three tasks: a reader that dispatches inbound frames, a writer
//! that drains the outbound queue, and an optional heartbeat. The channel
//! table lock is only ever held for short synchronous sections; no lock is
//! held across transport I/O.
//!
//! Channel IDs are allocated by the opener: the gateway uses odd IDs, the
//! agent even ones. IDs are never reused within a connection.

mod channel;
mod window;

pub use channel::{Channel, ChannelEvent, ChannelReceiver, ChannelSender, PendingChannel};
pub use window::{CapExceeded, RecvWindow, SendWindow};

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::{HatchError, HatchResult, ReasonCode};
use crate::messages::{ChannelParams, Purpose, TunnelFrame};
use crate::transport::{BoxedReader, BoxedWriter};
use channel::ChannelShared;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

pub const DEFAULT_WINDOW: u32 = 256 * 1024;
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;
pub const DEFAULT_MAX_CHUNK: usize = 32 * 1024;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Which end of the tunnel this is. Decides channel ID parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Gateway,
    Agent,
}

impl Role {
    fn first_channel_id(self) -> u32 {
        match self {
            Self::Gateway => 1,
            Self::Agent => 2,
        }
    }

    fn allocates(self, id: u32) -> bool {
        match self {
            Self::Gateway => id % 2 == 1,
            Self::Agent => id % 2 == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub role: Role,
    /// Receive window advertised for each channel.
    pub window: u32,
    /// Per-channel cap on bytes buffered beyond the peer's credit.
    pub max_buffer: usize,
    /// Largest `data` payload put on the wire.
    pub max_chunk: usize,
    /// `None` disables pings from this side (pongs are always answered).
    pub heartbeat_interval: Option<Duration>,
    pub max_missed_heartbeats: u32,
    /// Code channels fail with when the transport goes away.
    pub lost_code: ReasonCode,
}

impl MuxConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            window: DEFAULT_WINDOW,
            max_buffer: DEFAULT_MAX_BUFFER,
            max_chunk: DEFAULT_MAX_CHUNK,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            lost_code: ReasonCode::TunnelLost,
        }
    }
}

/// Why a connection or channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: ReasonCode,
    pub message: String,
}

impl CloseReason {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn to_error(&self) -> HatchError {
        HatchError::from_code(self.code, self.message.clone())
    }
}

struct Table {
    channels: HashMap<u32, Arc<ChannelShared>>,
    closed: bool,
}

pub(crate) struct Shared {
    label: String,
    config: MuxConfig,
    table: Mutex<Table>,
    next_id: AtomicU32,
    out_tx: mpsc::UnboundedSender<TunnelFrame>,
    state: watch::Sender<Option<CloseReason>>,
    incoming: Mutex<Option<mpsc::UnboundedSender<PendingChannel>>>,
    unanswered_pings: AtomicU32,
}

impl Shared {
    fn send_frame(&self, frame: TunnelFrame) {
        let _ = self.out_tx.send(frame);
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.state.borrow().clone()
    }

    fn get(&self, id: u32) -> Option<Arc<ChannelShared>> {
        self.table.lock().channels.get(&id).cloned()
    }

    fn remove(&self, id: u32) {
        self.table.lock().channels.remove(&id);
    }

    /// Whether `id` was handed out by this side's allocator.
    fn issued(&self, id: u32) -> bool {
        self.config.role.allocates(id) && id < self.next_id.load(Ordering::Relaxed)
    }

    fn insert(&self, ch: Arc<ChannelShared>) -> HatchResult<()> {
        let mut table = self.table.lock();
        if table.closed {
            drop(table);
            return Err(self
                .close_reason()
                .map(|r| r.to_error())
                .unwrap_or_else(|| HatchError::from_code(self.config.lost_code, "tunnel closed")));
        }
        if table.channels.contains_key(&ch.id) {
            return Err(HatchError::ProtocolViolation(format!(
                "channel {} already in use",
                ch.id
            )));
        }
        table.channels.insert(ch.id, ch);
        Ok(())
    }

    /// Fail one channel, optionally telling the peer.
    fn fail_channel(&self, ch: &ChannelShared, reason: CloseReason, notify_peer: bool) {
        self.remove(ch.id);
        if notify_peer {
            self.send_frame(TunnelFrame::Error {
                channel_id: ch.id,
                code: reason.code,
                message: reason.message.clone(),
            });
        }
        debug!(tunnel = %self.label, channel_id = ch.id, code = %reason.code, "channel failed: {}", reason.message);
        ch.fail(&reason);
    }

    fn close_channel(&self, ch: &Arc<ChannelShared>, exit_status: Option<i32>) {
        if !ch.request_close(exit_status) {
            return;
        }
        ch.pump(self);
    }

    /// Tear down the connection and fail every channel with `code`.
    fn close(&self, code: ReasonCode, message: impl Into<String>) {
        let reason = CloseReason::new(code, message);
        let channels = {
            let mut table = self.table.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            std::mem::take(&mut table.channels)
        };
        info!(
            tunnel = %self.label,
            code = %reason.code,
            channels = channels.len(),
            "tunnel closed: {}",
            reason.message
        );
        for ch in channels.values() {
            ch.fail(&reason);
        }
        self.incoming.lock().take();
        self.state.send_replace(Some(reason));
    }

    /// Send an `evict` notice, then close.
    fn evict(&self, code: ReasonCode, message: impl Into<String>) {
        let message = message.into();
        if self.table.lock().closed {
            return;
        }
        self.send_frame(TunnelFrame::Evict {
            code,
            message: message.clone(),
        });
        self.close(code, message);
    }

    fn dispatch(self: &Arc<Self>, frame: TunnelFrame) -> HatchResult<()> {
        trace!(tunnel = %self.label, frame = frame.name(), "frame received");
        match frame {
            TunnelFrame::Open {
                channel_id,
                purpose,
                params,
                window,
            } => self.on_open(channel_id, purpose, params, window)?,
            TunnelFrame::OpenOk { channel_id, window } => {
                let Some(ch) = self.get(channel_id) else {
                    if self.issued(channel_id) {
                        // Answer to an open we abandoned.
                        debug!(tunnel = %self.label, channel_id, "late open_ok for abandoned channel");
                        self.send_frame(TunnelFrame::Error {
                            channel_id,
                            code: ReasonCode::OpenTimeout,
                            message: "open abandoned".into(),
                        });
                        return Ok(());
                    }
                    return Err(HatchError::ProtocolViolation(format!(
                        "open_ok for unknown channel {channel_id}"
                    )));
                };
                let reply = ch.open_reply.lock().take().ok_or_else(|| {
                    HatchError::ProtocolViolation(format!("unexpected open_ok for channel {channel_id}"))
                })?;
                ch.grant(window);
                if reply.send(Ok(())).is_err() {
                    // Opener gave up waiting.
                    self.close_channel(&ch, None);
                }
            }
            TunnelFrame::OpenFail {
                channel_id,
                code,
                message,
            } => match self.get(channel_id) {
                Some(ch) => {
                    self.remove(channel_id);
                    if let Some(reply) = ch.open_reply.lock().take() {
                        let _ = reply.send(Err(CloseReason::new(code, message)));
                    }
                }
                None => debug!(tunnel = %self.label, channel_id, "open_fail for unknown channel"),
            },
            TunnelFrame::Data { channel_id, data } => {
                let Some(ch) = self.get(channel_id) else {
                    trace!(tunnel = %self.label, channel_id, "data for closed channel dropped");
                    return Ok(());
                };
                if let Err(remaining) = ch.on_data(data.len()) {
                    return Err(HatchError::ProtocolViolation(format!(
                        "channel {channel_id}: {} bytes overruns credit of {remaining}",
                        data.len()
                    )));
                }
                ch.emit(ChannelEvent::Data(data));
            }
            TunnelFrame::WindowAdjust { channel_id, bytes } => {
                if let Some(ch) = self.get(channel_id) {
                    ch.grant(bytes);
                    ch.pump(self);
                }
            }
            TunnelFrame::Resize {
                channel_id,
                cols,
                rows,
            } => {
                if let Some(ch) = self.get(channel_id) {
                    ch.emit(ChannelEvent::Resize { cols, rows });
                }
            }
            TunnelFrame::Eof { channel_id } => {
                if let Some(ch) = self.get(channel_id) {
                    ch.emit(ChannelEvent::Eof);
                }
            }
            TunnelFrame::Close {
                channel_id,
                exit_status,
            } => {
                if let Some(ch) = self.get(channel_id) {
                    if ch.on_remote_close() {
                        self.send_frame(TunnelFrame::Close {
                            channel_id,
                            exit_status: None,
                        });
                    }
                    self.remove(channel_id);
                    ch.emit(ChannelEvent::Closed { exit_status });
                }
            }
            TunnelFrame::Error {
                channel_id,
                code,
                message,
            } => {
                if let Some(ch) = self.get(channel_id) {
                    self.fail_channel(&ch, CloseReason::new(code, message), false);
                }
            }
            TunnelFrame::Ping { seq } => self.send_frame(TunnelFrame::Pong { seq }),
            TunnelFrame::Pong { .. } => self.unanswered_pings.store(0, Ordering::Release),
            TunnelFrame::Evict { code, message } => {
                warn!(tunnel = %self.label, code = %code, "evicted by peer: {}", message);
                self.close(code, message);
            }
            other @ (TunnelFrame::Handshake(_)
            | TunnelFrame::HandshakeAck { .. }
            | TunnelFrame::HandshakeReject { .. }) => {
                return Err(HatchError::ProtocolViolation(format!(
                    "unexpected {} after handshake",
                    other.name()
                )));
            }
        }
        Ok(())
    }

    fn on_open(
        self: &Arc<Self>,
        channel_id: u32,
        purpose: Purpose,
        params: ChannelParams,
        window: u32,
    ) -> HatchResult<()> {
        if self.config.role.allocates(channel_id) || channel_id == 0 {
            return Err(HatchError::ProtocolViolation(format!(
                "peer opened channel {channel_id} with our parity"
            )));
        }
        let (ch, rx) = ChannelShared::new(
            channel_id,
            purpose,
            window,
            self.config.window,
            self.config.max_buffer,
        );
        match self.insert(ch.clone()) {
            Ok(()) => {}
            Err(e @ HatchError::ProtocolViolation(_)) => return Err(e),
            // Closing: nothing to answer.
            Err(_) => return Ok(()),
        }
        debug!(tunnel = %self.label, channel_id, purpose = %purpose, "channel open requested");
        let pending = PendingChannel::new(self.clone(), ch, rx, params);
        let tx = self.incoming.lock().clone();
        if let Some(tx) = tx {
            // A closed receiver hands the pending channel back; dropping it rejects.
            let _ = tx.send(pending);
        }
        Ok(())
    }
}

/// Handle to a multiplexed tunnel. Clones share the same connection.
#[derive(Clone)]
pub struct TunnelConnection {
    shared: Arc<Shared>,
}

/// Channel opens initiated by the peer.
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<PendingChannel>,
}

impl Incoming {
    /// Next open request; `None` once the tunnel is closed.
    pub async fn next(&mut self) -> Option<PendingChannel> {
        self.rx.recv().await
    }
}

impl TunnelConnection {
    /// Start the reader, writer and heartbeat tasks over an already
    /// handshaken transport.
    pub fn spawn(
        reader: BoxedReader,
        writer: BoxedWriter,
        config: MuxConfig,
        label: impl Into<String>,
    ) -> (Self, Incoming) {
        let (conn, incoming, out_rx) = Self::build(config, label.into());
        conn.start(reader, writer, out_rx);
        (conn, incoming)
    }

    /// Like [`spawn`](Self::spawn), with one channel agreed out of band
    /// already in the table before the reader starts, so no early frame for
    /// it is dropped. Used by relay links.
    pub fn spawn_adopted(
        reader: BoxedReader,
        writer: BoxedWriter,
        config: MuxConfig,
        label: impl Into<String>,
        channel_id: u32,
        purpose: Purpose,
        peer_window: u32,
    ) -> HatchResult<(Self, Channel)> {
        let (conn, _incoming, out_rx) = Self::build(config, label.into());
        let channel = conn.adopt_channel(channel_id, purpose, peer_window)?;
        conn.start(reader, writer, out_rx);
        Ok((conn, channel))
    }

    fn build(
        config: MuxConfig,
        label: String,
    ) -> (Self, Incoming, mpsc::UnboundedReceiver<TunnelFrame>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            label,
            next_id: AtomicU32::new(config.role.first_channel_id()),
            config,
            table: Mutex::new(Table {
                channels: HashMap::new(),
                closed: false,
            }),
            out_tx,
            state,
            incoming: Mutex::new(Some(incoming_tx)),
            unanswered_pings: AtomicU32::new(0),
        });
        (Self { shared }, Incoming { rx: incoming_rx }, out_rx)
    }

    fn start(
        &self,
        reader: BoxedReader,
        writer: BoxedWriter,
        out_rx: mpsc::UnboundedReceiver<TunnelFrame>,
    ) {
        let shared = &self.shared;
        tokio::spawn(reader_loop(shared.clone(), reader, shared.state.subscribe()));
        tokio::spawn(writer_loop(
            shared.clone(),
            writer,
            out_rx,
            shared.state.subscribe(),
        ));
        if let Some(interval) = shared.config.heartbeat_interval {
            tokio::spawn(heartbeat_loop(
                shared.clone(),
                interval,
                shared.state.subscribe(),
            ));
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Open a channel to the peer and wait for its answer.
    pub async fn open_channel(&self, purpose: Purpose, params: ChannelParams) -> HatchResult<Channel> {
        let (ch, rx, reply_rx) = self.send_open(purpose, params)?;
        self.finish_open(ch, rx, reply_rx.await)
    }

    /// Like [`open_channel`](Self::open_channel), giving up after `timeout`.
    ///
    /// An abandoned open is failed on both ends with `open-timeout`; a late
    /// `open_ok` from the peer is answered the same way.
    pub async fn open_channel_within(
        &self,
        purpose: Purpose,
        params: ChannelParams,
        timeout: Duration,
    ) -> HatchResult<Channel> {
        let (ch, rx, reply_rx) = self.send_open(purpose, params)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(reply) => self.finish_open(ch, rx, reply),
            Err(_) => {
                let reason = CloseReason::new(
                    ReasonCode::OpenTimeout,
                    format!("peer did not answer open within {timeout:?}"),
                );
                self.shared.fail_channel(&ch, reason, true);
                Err(HatchError::OpenTimeout(timeout))
            }
        }
    }

    fn send_open(
        &self,
        purpose: Purpose,
        params: ChannelParams,
    ) -> HatchResult<(
        Arc<ChannelShared>,
        mpsc::UnboundedReceiver<ChannelEvent>,
        oneshot::Receiver<Result<(), CloseReason>>,
    )> {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (ch, rx) = ChannelShared::new(
            id,
            purpose,
            0,
            shared.config.window,
            shared.config.max_buffer,
        );
        let (reply_tx, reply_rx) = oneshot::channel();
        *ch.open_reply.lock() = Some(reply_tx);
        shared.insert(ch.clone())?;
        shared.send_frame(TunnelFrame::Open {
            channel_id: id,
            purpose,
            params,
            window: shared.config.window,
        });
        debug!(tunnel = %shared.label, channel_id = id, purpose = %purpose, "channel open sent");
        Ok((ch, rx, reply_rx))
    }

    fn finish_open(
        &self,
        ch: Arc<ChannelShared>,
        rx: mpsc::UnboundedReceiver<ChannelEvent>,
        reply: Result<Result<(), CloseReason>, oneshot::error::RecvError>,
    ) -> HatchResult<Channel> {
        match reply {
            Ok(Ok(())) => Ok(Channel::new(self.shared.clone(), ch, rx)),
            Ok(Err(reason)) => Err(reason.to_error()),
            Err(_) => Err(self.lost_error()),
        }
    }

    /// Register a channel both ends agreed on out of band (relay links).
    ///
    /// `peer_window` is the credit the peer advertised for it.
    pub fn adopt_channel(
        &self,
        channel_id: u32,
        purpose: Purpose,
        peer_window: u32,
    ) -> HatchResult<Channel> {
        let shared = &self.shared;
        let (ch, rx) = ChannelShared::new(
            channel_id,
            purpose,
            peer_window,
            shared.config.window,
            shared.config.max_buffer,
        );
        shared.insert(ch.clone())?;
        if shared.config.role.allocates(channel_id) {
            shared
                .next_id
                .fetch_max(channel_id.saturating_add(2), Ordering::Relaxed);
        }
        Ok(Channel::new(shared.clone(), ch, rx))
    }

    /// Close the transport, failing every channel with `code`.
    pub fn close(&self, code: ReasonCode, message: impl Into<String>) {
        self.shared.close(code, message);
    }

    /// Tell the peer it is being evicted, then close.
    pub fn evict(&self, code: ReasonCode, message: impl Into<String>) {
        self.shared.evict(code, message);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Resolve once the connection has closed.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.state.subscribe();
        let reason = match rx.wait_for(|s| s.is_some()).await {
            Ok(reason) => reason
                .clone()
                .unwrap_or_else(|| CloseReason::new(self.shared.config.lost_code, "tunnel closed")),
            Err(_) => CloseReason::new(self.shared.config.lost_code, "tunnel closed"),
        };
        reason
    }

    pub fn channel_count(&self) -> usize {
        self.shared.table.lock().channels.len()
    }

    fn lost_error(&self) -> HatchError {
        self.close_reason()
            .map(|r| r.to_error())
            .unwrap_or_else(|| HatchError::from_code(self.shared.config.lost_code, "tunnel closed"))
    }
}

async fn reader_loop(
    shared: Arc<Shared>,
    mut reader: BoxedReader,
    mut state: watch::Receiver<Option<CloseReason>>,
) {
    loop {
        let next = tokio::select! {
            r = reader.read_frame() => r,
            _ = state.changed() => return,
        };
        match next {
            Ok(Some(bytes)) => {
                let result = cbor_decode::<TunnelFrame>(&bytes)
                    .map_err(|e| HatchError::ProtocolViolation(e.to_string()))
                    .and_then(|frame| shared.dispatch(frame));
                if let Err(e) = result {
                    warn!(tunnel = %shared.label, error = %e, "closing tunnel");
                    shared.evict(e.code(), e.to_string());
                    return;
                }
            }
            Ok(None) => {
                shared.close(shared.config.lost_code, "peer closed the tunnel");
                return;
            }
            Err(e @ HatchError::ProtocolViolation(_)) => {
                warn!(tunnel = %shared.label, error = %e, "closing tunnel");
                shared.evict(ReasonCode::ProtocolViolation, e.to_string());
                return;
            }
            Err(e) => {
                shared.close(shared.config.lost_code, e.to_string());
                return;
            }
        }
    }
}

async fn writer_loop(
    shared: Arc<Shared>,
    mut writer: BoxedWriter,
    mut out_rx: mpsc::UnboundedReceiver<TunnelFrame>,
    mut state: watch::Receiver<Option<CloseReason>>,
) {
    loop {
        tokio::select! {
            biased;
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_one(&mut writer, &frame).await {
                    shared.close(shared.config.lost_code, e.to_string());
                    break;
                }
            }
            _ = state.changed() => {
                // Flush what was queued before the close (an evict notice in particular).
                while let Ok(frame) = out_rx.try_recv() {
                    if write_one(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_one(writer: &mut BoxedWriter, frame: &TunnelFrame) -> HatchResult<()> {
    let payload = cbor_encode(frame)?;
    writer.write_frame(&payload).await
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    interval: Duration,
    mut state: watch::Receiver<Option<CloseReason>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.changed() => return,
        }
        let unanswered = shared.unanswered_pings.load(Ordering::Acquire);
        if unanswered >= shared.config.max_missed_heartbeats {
            warn!(tunnel = %shared.label, unanswered, "heartbeat timeout");
            shared.close(
                shared.config.lost_code,
                format!("{unanswered} heartbeats unanswered"),
            );
            return;
        }
        seq += 1;
        shared.unanswered_pings.fetch_add(1, Ordering::AcqRel);
        shared.send_frame(TunnelFrame::Ping { seq });
    }
}
