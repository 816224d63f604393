//! Frame transport abstraction.
//!
//! The tunnel multiplexer and the client broker only need to move whole
//! frames. Anything that can read and write length-prefixed frames (a TCP
//! or TLS stream, an in-memory duplex in tests) plugs in here.

use crate::codec;
use crate::error::{HatchError, HatchResult};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Receiving half of a frame transport.
pub trait FrameReader: Send {
    /// Read the next frame payload. `Ok(None)` = peer closed cleanly.
    fn read_frame(&mut self) -> Pin<Box<dyn Future<Output = HatchResult<Option<Vec<u8>>>> + Send + '_>>;
}

/// Sending half of a frame transport.
pub trait FrameWriter: Send {
    /// Write one frame payload.
    fn write_frame<'a>(
        &'a mut self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = HatchResult<()>> + Send + 'a>>;

    /// Close the write side.
    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = HatchResult<()>> + Send + '_>>;
}

/// [`FrameReader`] over any async byte stream.
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: AsyncRead + Unpin + Send> FrameReader for StreamReader<R> {
    fn read_frame(&mut self) -> Pin<Box<dyn Future<Output = HatchResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(codec::read_frame(&mut self.inner))
    }
}

/// [`FrameWriter`] over any async byte stream.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter for StreamWriter<W> {
    fn write_frame<'a>(
        &'a mut self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = HatchResult<()>> + Send + 'a>> {
        Box::pin(codec::write_frame(&mut self.inner, payload))
    }

    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = HatchResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .shutdown()
                .await
                .map_err(|e| HatchError::Transport(format!("shutdown failed: {e}")))
        })
    }
}

pub type BoxedReader = Box<dyn FrameReader>;
pub type BoxedWriter = Box<dyn FrameWriter>;

/// Split a byte stream into boxed frame halves.
pub fn split_stream<S>(stream: S) -> (BoxedReader, BoxedWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (r, w): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    (
        Box::new(StreamReader::new(r)),
        Box::new(StreamWriter::new(w)),
    )
}
