//! Session recording and playback.
//!
//! A recorder appends timestamped input/output chunks while the session is
//! live. Offsets are milliseconds since session start and never go
//! backwards; a decreasing offset is a bug in the caller and is reported,
//! not clamped. Sealing freezes the events into a shared immutable slice.
//!
//! Stored form is newline-delimited JSON, one event per line.

use async_trait::async_trait;
use hatch_core::{HatchError, HatchResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to device.
    Input,
    /// Device to client.
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingEvent {
    pub offset_ms: u64,
    pub direction: Direction,
    pub payload: Vec<u8>,
}

/// Append-only recorder for one live session.
pub struct SessionRecorder {
    session_id: String,
    started: Instant,
    events: Vec<RecordingEvent>,
    last_offset: u64,
    sealed: bool,
}

impl SessionRecorder {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started: Instant::now(),
            events: Vec::new(),
            last_offset: 0,
            sealed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record a chunk at the current offset.
    pub fn record(&mut self, direction: Direction, payload: &[u8]) -> HatchResult<()> {
        let offset_ms = self.started.elapsed().as_millis() as u64;
        self.record_at(offset_ms, direction, payload)
    }

    /// Record a chunk at an explicit offset.
    pub fn record_at(
        &mut self,
        offset_ms: u64,
        direction: Direction,
        payload: &[u8],
    ) -> HatchResult<()> {
        if self.sealed {
            return Err(HatchError::RecorderBug(format!(
                "append to sealed recording {}",
                self.session_id
            )));
        }
        if offset_ms < self.last_offset {
            return Err(HatchError::RecorderBug(format!(
                "offset {offset_ms} ms after {} ms in recording {}",
                self.last_offset, self.session_id
            )));
        }
        if payload.is_empty() {
            return Ok(());
        }
        self.last_offset = offset_ms;
        self.events.push(RecordingEvent {
            offset_ms,
            direction,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Copy of what has been recorded so far.
    pub fn snapshot(&self) -> SealedRecording {
        SealedRecording {
            session_id: self.session_id.clone(),
            events: self.events.clone().into(),
        }
    }

    /// Freeze the recording. Later appends fail.
    pub fn seal(&mut self) -> SealedRecording {
        self.sealed = true;
        SealedRecording {
            session_id: self.session_id.clone(),
            events: std::mem::take(&mut self.events).into(),
        }
    }
}

/// Immutable recording. Clones share the events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecording {
    session_id: String,
    events: Arc<[RecordingEvent]>,
}

impl SealedRecording {
    /// Rebuild from stored events, checking offset order.
    pub fn from_events(
        session_id: impl Into<String>,
        events: Vec<RecordingEvent>,
    ) -> HatchResult<Self> {
        let session_id = session_id.into();
        if let Some(w) = events.windows(2).find(|w| w[1].offset_ms < w[0].offset_ms) {
            return Err(HatchError::RecorderBug(format!(
                "stored recording {session_id} goes back from {} to {} ms",
                w[0].offset_ms, w[1].offset_ms
            )));
        }
        Ok(Self {
            session_id,
            events: events.into(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn events(&self) -> &[RecordingEvent] {
        &self.events
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.events.last().map(|e| e.offset_ms).unwrap_or(0))
    }

    /// All bytes recorded in one direction, concatenated.
    pub fn bytes(&self, direction: Direction) -> Vec<u8> {
        self.events
            .iter()
            .filter(|e| e.direction == direction)
            .flat_map(|e| e.payload.iter().copied())
            .collect()
    }

    pub fn playback(&self) -> Playback {
        Playback::new(self.clone())
    }
}

/// Lazy, finite, restartable walk over a sealed recording.
pub struct Playback {
    recording: SealedRecording,
    pos: usize,
}

impl Playback {
    pub fn new(recording: SealedRecording) -> Self {
        Self { recording, pos: 0 }
    }

    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn remaining(&self) -> usize {
        self.recording.events.len() - self.pos
    }

    /// Write the remaining output to `sink`, pacing events by their offsets
    /// divided by `speed`.
    pub async fn play<W: AsyncWrite + Unpin>(&mut self, speed: f64, sink: &mut W) -> HatchResult<()> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(HatchError::InvalidMessage(format!(
                "playback speed must be positive, got {speed}"
            )));
        }
        let mut last = self
            .pos
            .checked_sub(1)
            .map(|i| self.recording.events[i].offset_ms)
            .unwrap_or(0);
        while let Some(event) = self.next() {
            let delta = event.offset_ms - last;
            last = event.offset_ms;
            if delta > 0 {
                tokio::time::sleep(Duration::from_secs_f64(delta as f64 / 1000.0 / speed)).await;
            }
            if event.direction == Direction::Output {
                sink.write_all(&event.payload).await?;
            }
        }
        sink.flush().await?;
        Ok(())
    }
}

impl Iterator for Playback {
    type Item = RecordingEvent;

    fn next(&mut self) -> Option<RecordingEvent> {
        let event = self.recording.events.get(self.pos)?.clone();
        self.pos += 1;
        Some(event)
    }
}

/// Where sealed recordings go.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn persist(&self, recording: &SealedRecording) -> HatchResult<()>;

    /// `NotFound` if nothing was persisted for `session_id`.
    async fn load(&self, session_id: &str) -> HatchResult<SealedRecording>;
}

/// One `<session_id>.jsonl` file per session.
pub struct FileRecordingStore {
    dir: PathBuf,
}

impl FileRecordingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> HatchResult<PathBuf> {
        if session_id.is_empty()
            || !session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HatchError::InvalidMessage(format!(
                "bad session id {session_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.jsonl")))
    }
}

#[async_trait]
impl RecordingStore for FileRecordingStore {
    async fn persist(&self, recording: &SealedRecording) -> HatchResult<()> {
        let path = self.path_for(recording.session_id())?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut out = String::new();
        for event in recording.events() {
            let line = serde_json::to_string(event)
                .map_err(|e| HatchError::Other(format!("serialize recording event: {e}")))?;
            out.push_str(&line);
            out.push('\n');
        }
        tokio::fs::write(&path, out).await?;
        debug!(
            path = %path.display(),
            events = recording.events().len(),
            duration_ms = recording.duration().as_millis() as u64,
            "recording persisted"
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> HatchResult<SealedRecording> {
        let path = self.path_for(session_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HatchError::NotFound(format!("recording {session_id}")));
            }
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str::<RecordingEvent>(line).map_err(|e| {
                HatchError::Store(format!(
                    "{} line {}: malformed recording event: {e}",
                    path.display(),
                    index + 1
                ))
            })?;
            events.push(event);
        }
        SealedRecording::from_events(session_id, events)
    }
}

#[derive(Default)]
pub struct MemoryRecordingStore {
    recordings: Mutex<HashMap<String, SealedRecording>>,
}

impl MemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordingStore for MemoryRecordingStore {
    async fn persist(&self, recording: &SealedRecording) -> HatchResult<()> {
        self.recordings
            .lock()
            .insert(recording.session_id().to_string(), recording.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> HatchResult<SealedRecording> {
        self.recordings
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| HatchError::NotFound(format!("recording {session_id}")))
    }
}
