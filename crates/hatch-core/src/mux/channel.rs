//! Channel handles and per-channel state.

use super::window::{RecvWindow, SendWindow};
use super::{CloseReason, Shared};
use crate::error::{HatchError, HatchResult, ReasonCode};
use crate::messages::{ChannelParams, Purpose, TunnelFrame};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

/// Something that happened on a channel, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    /// The peer will send no more data.
    Eof,
    /// Both sides closed. Terminal.
    Closed { exit_status: Option<i32> },
    /// The channel or its tunnel failed. Terminal.
    Failed { code: ReasonCode, message: String },
}

impl ChannelEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug)]
struct SendState {
    window: SendWindow,
    eof_requested: bool,
    eof_sent: bool,
    close_requested: Option<Option<i32>>,
    close_sent: bool,
    remote_closed: bool,
    finished: bool,
    failed: Option<CloseReason>,
}

pub(crate) type OpenReply = oneshot::Sender<Result<(), CloseReason>>;

pub(crate) struct ChannelShared {
    pub(crate) id: u32,
    pub(crate) purpose: Purpose,
    send: Mutex<SendState>,
    recv: Mutex<RecvWindow>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    drained: Notify,
    pub(crate) open_reply: Mutex<Option<OpenReply>>,
}

impl ChannelShared {
    pub(crate) fn new(
        id: u32,
        purpose: Purpose,
        send_credit: u32,
        recv_window: u32,
        max_buffer: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ch = Arc::new(Self {
            id,
            purpose,
            send: Mutex::new(SendState {
                window: SendWindow::new(send_credit, max_buffer),
                eof_requested: false,
                eof_sent: false,
                close_requested: None,
                close_sent: false,
                remote_closed: false,
                finished: false,
                failed: None,
            }),
            recv: Mutex::new(RecvWindow::new(recv_window)),
            events: Mutex::new(Some(tx)),
            drained: Notify::new(),
            open_reply: Mutex::new(None),
        });
        (ch, rx)
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        let mut events = self.events.lock();
        let terminal = event.is_terminal();
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
        if terminal {
            events.take();
        }
    }

    /// Account for inbound data against the advertised credit.
    pub(crate) fn on_data(&self, len: usize) -> Result<(), u64> {
        self.recv.lock().on_data(len)
    }

    pub(crate) fn grant(&self, bytes: u32) {
        self.send.lock().window.grant(bytes);
    }

    /// Fail the channel: drop buffered output, answer a pending open, wake writers.
    pub(crate) fn fail(&self, reason: &CloseReason) {
        {
            let mut st = self.send.lock();
            if st.failed.is_some() || st.finished {
                return;
            }
            st.failed = Some(reason.clone());
            st.window.clear();
        }
        if let Some(reply) = self.open_reply.lock().take() {
            let _ = reply.send(Err(reason.clone()));
        }
        self.emit(ChannelEvent::Failed {
            code: reason.code,
            message: reason.message.clone(),
        });
        self.drained.notify_waiters();
    }

    /// Handle the peer's `close`. Returns true if we must answer with our own.
    pub(crate) fn on_remote_close(&self) -> bool {
        let mut st = self.send.lock();
        st.remote_closed = true;
        st.finished = true;
        st.window.clear();
        let reply = !st.close_sent && st.failed.is_none();
        st.close_sent = true;
        drop(st);
        self.drained.notify_waiters();
        reply
    }

    /// Record a local close. Returns false if one was already requested.
    pub(crate) fn request_close(&self, exit_status: Option<i32>) -> bool {
        let mut st = self.send.lock();
        if st.failed.is_some() || st.finished || st.close_requested.is_some() {
            return false;
        }
        st.close_requested = Some(exit_status);
        true
    }

    /// Push whatever current credit allows; emit deferred `eof`/`close` once drained.
    pub(crate) fn pump(&self, mux: &Shared) {
        let mut finished = false;
        let drained;
        {
            let mut st = self.send.lock();
            if st.failed.is_some() || st.finished {
                return;
            }
            while let Some(chunk) = st.window.take_sendable(mux.config.max_chunk) {
                mux.send_frame(TunnelFrame::Data {
                    channel_id: self.id,
                    data: chunk,
                });
            }
            drained = st.window.is_drained();
            if drained {
                if st.eof_requested && !st.eof_sent {
                    st.eof_sent = true;
                    mux.send_frame(TunnelFrame::Eof {
                        channel_id: self.id,
                    });
                }
                if let Some(exit_status) = st.close_requested {
                    if !st.close_sent {
                        st.close_sent = true;
                        mux.send_frame(TunnelFrame::Close {
                            channel_id: self.id,
                            exit_status,
                        });
                    }
                }
                if st.close_sent && st.remote_closed {
                    st.finished = true;
                    finished = true;
                }
            }
        }
        if drained {
            self.drained.notify_waiters();
        }
        if finished {
            mux.remove(self.id);
        }
    }

    /// Whether the channel has been fully closed or failed.
    pub(crate) fn is_done(&self) -> bool {
        let st = self.send.lock();
        st.finished || st.failed.is_some()
    }
}

/// Writing half of a channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSender {
    mux: Arc<Shared>,
    ch: Arc<ChannelShared>,
}

impl ChannelSender {
    pub fn id(&self) -> u32 {
        self.ch.id
    }

    /// Queue bytes for the peer.
    ///
    /// Bytes beyond the peer's credit are buffered; if the buffer would grow
    /// past the cap the channel fails with `BackpressureExceeded`.
    pub fn send(&self, data: &[u8]) -> HatchResult<()> {
        {
            let mut st = self.ch.send.lock();
            if let Some(reason) = &st.failed {
                return Err(reason.to_error());
            }
            if st.eof_requested || st.close_requested.is_some() || st.remote_closed {
                return Err(HatchError::InvalidMessage(format!(
                    "channel {} is closed for writing",
                    self.ch.id
                )));
            }
            if let Err(over) = st.window.enqueue(data) {
                drop(st);
                self.mux.fail_channel(
                    &self.ch,
                    CloseReason::new(
                        ReasonCode::BackpressureExceeded,
                        format!(
                            "send buffer would hold {} bytes (cap {})",
                            over.buffered, over.cap
                        ),
                    ),
                    true,
                );
                return Err(HatchError::BackpressureExceeded(self.ch.id));
            }
        }
        self.ch.pump(&self.mux);
        Ok(())
    }

    /// Wait until everything queued has been handed to the transport.
    pub async fn ready(&self) -> HatchResult<()> {
        loop {
            let notified = self.ch.drained.notified();
            {
                let st = self.ch.send.lock();
                if let Some(reason) = &st.failed {
                    return Err(reason.to_error());
                }
                if st.window.is_drained() || st.finished {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// `ready()` then `send()`.
    pub async fn write(&self, data: &[u8]) -> HatchResult<()> {
        self.ready().await?;
        self.send(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> HatchResult<()> {
        if let Some(reason) = &self.ch.send.lock().failed {
            return Err(reason.to_error());
        }
        self.mux.send_frame(TunnelFrame::Resize {
            channel_id: self.ch.id,
            cols,
            rows,
        });
        Ok(())
    }

    /// Half-close: no more data from this side. Sent after buffered data.
    pub fn eof(&self) {
        {
            let mut st = self.ch.send.lock();
            if st.eof_requested {
                return;
            }
            st.eof_requested = true;
        }
        self.ch.pump(&self.mux);
    }

    /// Close the channel, reporting `exit_status` if this side ran a process.
    pub fn close(&self, exit_status: Option<i32>) {
        self.mux.close_channel(&self.ch, exit_status);
    }

    /// Fail the channel locally and tell the peer with an `error` frame.
    pub fn fail(&self, code: ReasonCode, message: impl Into<String>) {
        self.mux
            .fail_channel(&self.ch, CloseReason::new(code, message), true);
    }
}

/// Reading half of a channel.
///
/// Dropping it before a terminal event closes the channel.
pub struct ChannelReceiver {
    mux: Arc<Shared>,
    ch: Arc<ChannelShared>,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    done: bool,
}

impl ChannelReceiver {
    pub fn id(&self) -> u32 {
        self.ch.id
    }

    /// Next event. Consumed data returns credit to the peer.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.done {
            return None;
        }
        let Some(event) = self.rx.recv().await else {
            self.done = true;
            return None;
        };
        match &event {
            ChannelEvent::Data(data) => {
                let grant = self.ch.recv.lock().consume(data.len());
                if let Some(bytes) = grant {
                    self.mux.send_frame(TunnelFrame::WindowAdjust {
                        channel_id: self.ch.id,
                        bytes,
                    });
                }
            }
            e if e.is_terminal() => self.done = true,
            _ => {}
        }
        Some(event)
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        if !self.done && !self.ch.is_done() {
            self.mux.close_channel(&self.ch, None);
        }
    }
}

/// An open channel: both halves together.
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    pub(crate) fn new(
        mux: Arc<Shared>,
        ch: Arc<ChannelShared>,
        rx: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            sender: ChannelSender {
                mux: mux.clone(),
                ch: ch.clone(),
            },
            receiver: ChannelReceiver {
                mux,
                ch,
                rx,
                done: false,
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.sender.ch.id
    }

    pub fn purpose(&self) -> Purpose {
        self.sender.ch.purpose
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }

    pub fn send(&self, data: &[u8]) -> HatchResult<()> {
        self.sender.send(data)
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.receiver.recv().await
    }

    pub fn close(&self, exit_status: Option<i32>) {
        self.sender.close(exit_status)
    }
}

/// A channel the peer asked to open. Accept or reject it; dropping rejects.
pub struct PendingChannel {
    mux: Arc<Shared>,
    ch: Arc<ChannelShared>,
    rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    params: ChannelParams,
}

impl PendingChannel {
    pub(crate) fn new(
        mux: Arc<Shared>,
        ch: Arc<ChannelShared>,
        rx: mpsc::UnboundedReceiver<ChannelEvent>,
        params: ChannelParams,
    ) -> Self {
        Self {
            mux,
            ch,
            rx: Some(rx),
            params,
        }
    }

    pub fn id(&self) -> u32 {
        self.ch.id
    }

    pub fn purpose(&self) -> Purpose {
        self.ch.purpose
    }

    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    pub fn accept(mut self) -> HatchResult<Channel> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| HatchError::Other("channel already answered".into()))?;
        if let Some(reason) = self.mux.close_reason() {
            return Err(reason.to_error());
        }
        if self.ch.is_done() {
            return Err(HatchError::from_code(
                ReasonCode::OpenTimeout,
                "opener gave up before the channel was accepted",
            ));
        }
        self.mux.send_frame(TunnelFrame::OpenOk {
            channel_id: self.ch.id,
            window: self.mux.config.window,
        });
        debug!(tunnel = %self.mux.label, channel_id = self.ch.id, purpose = %self.ch.purpose, "channel accepted");
        Ok(Channel::new(self.mux.clone(), self.ch.clone(), rx))
    }

    pub fn reject(mut self, code: ReasonCode, message: impl Into<String>) {
        self.rx.take();
        self.send_reject(code, message.into());
    }

    fn send_reject(&self, code: ReasonCode, message: String) {
        debug!(tunnel = %self.mux.label, channel_id = self.ch.id, code = %code, "channel rejected: {}", message);
        self.mux.remove(self.ch.id);
        self.mux.send_frame(TunnelFrame::OpenFail {
            channel_id: self.ch.id,
            code,
            message,
        });
    }
}

impl Drop for PendingChannel {
    fn drop(&mut self) {
        if self.rx.take().is_some() {
            self.send_reject(ReasonCode::Unsupported, "no handler for channel".into());
        }
    }
}
