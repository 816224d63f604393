//! Sessions and their recordings.

pub mod manager;
pub mod recording;

pub use manager::{NewSession, Session, SessionHandle, SessionManager, SessionState};
pub use recording::{
    Direction, FileRecordingStore, MemoryRecordingStore, Playback, RecordingEvent, RecordingStore,
    SealedRecording, SessionRecorder,
};
