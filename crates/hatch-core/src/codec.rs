//! Length-prefixed CBOR framing shared by the tunnel and client protocols.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{HatchError, HatchResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted on either protocol (1 MiB).
pub const MAX_FRAME_LEN: usize = 1_048_576;

/// Encode a value as a bare CBOR payload (no length prefix).
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> HatchResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(HatchError::Codec(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    Ok(payload)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> HatchResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Read one length-prefixed payload.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> HatchResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(HatchError::Transport(format!("read length failed: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(HatchError::ProtocolViolation(format!(
            "frame too large: {len} bytes"
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| HatchError::Transport(format!("read payload failed: {e}")))?;
    Ok(Some(buf))
}

/// Write one payload with its length prefix and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> HatchResult<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(HatchError::Codec(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| HatchError::Transport(format!("write length failed: {e}")))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| HatchError::Transport(format!("write payload failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| HatchError::Transport(format!("flush failed: {e}")))?;
    Ok(())
}
