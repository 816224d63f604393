//! Session bookkeeping.
//!
//! A session exists from the moment its channel is wired until it ends.
//! Ended sessions stay queryable until garbage-collected; their fields are
//! frozen except for the recording flag set once the recording is stored.
//! The recording is sealed in the same step that ends the session, and the
//! sealed copy is held here until the recording store has it.

use super::recording::{SealedRecording, SessionRecorder};
use crate::auth::Permission;
use crate::registry::now_ms;
use hatch_core::{EndReason, HatchError, HatchResult, Purpose};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Ended,
}

/// Snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub device_id: String,
    pub user_id: String,
    pub namespace_id: String,
    pub purpose: Purpose,
    /// Instance holding the device's tunnel.
    pub owner_instance_id: String,
    /// UNIX epoch milliseconds.
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub authorized_scope: Permission,
    pub state: SessionState,
    pub end_reason: Option<EndReason>,
    pub recording_persisted: bool,
}

/// What the broker knows when it wires a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: String,
    pub device_id: String,
    pub user_id: String,
    pub purpose: Purpose,
    pub owner_instance_id: String,
    pub authorized_scope: Permission,
}

/// Held by the task running the session.
pub struct SessionHandle {
    pub session_id: String,
    pub recorder: Arc<Mutex<SessionRecorder>>,
    /// Becomes `Some` when something outside the session asks it to end.
    pub terminate: watch::Receiver<Option<EndReason>>,
}

struct Entry {
    session: Session,
    recorder: Arc<Mutex<SessionRecorder>>,
    /// Sealed recording not yet in the store.
    sealed: Option<SealedRecording>,
    terminate: watch::Sender<Option<EndReason>>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Entry>>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    pub async fn create(&self, new: NewSession) -> HatchResult<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        let active = sessions
            .values()
            .filter(|e| e.session.state == SessionState::Active)
            .count();
        if active >= self.max_sessions {
            return Err(HatchError::PolicyDenied(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }
        if sessions.contains_key(&new.session_id) {
            return Err(HatchError::InvalidMessage(format!(
                "session {} already exists",
                new.session_id
            )));
        }

        let recorder = Arc::new(Mutex::new(SessionRecorder::new(new.session_id.clone())));
        let (terminate_tx, terminate_rx) = watch::channel(None);
        let session = Session {
            session_id: new.session_id.clone(),
            device_id: new.device_id,
            user_id: new.user_id,
            namespace_id: new.authorized_scope.namespace_id.clone(),
            purpose: new.purpose,
            owner_instance_id: new.owner_instance_id,
            started_at: now_ms(),
            ended_at: None,
            authorized_scope: new.authorized_scope,
            state: SessionState::Active,
            end_reason: None,
            recording_persisted: false,
        };
        info!(
            session_id = %session.session_id,
            device_id = %session.device_id,
            user_id = %session.user_id,
            purpose = %session.purpose,
            "session created"
        );
        sessions.insert(
            new.session_id.clone(),
            Entry {
                session,
                recorder: recorder.clone(),
                sealed: None,
                terminate: terminate_tx,
            },
        );

        Ok(SessionHandle {
            session_id: new.session_id,
            recorder,
            terminate: terminate_rx,
        })
    }

    pub async fn status(&self, session_id: &str) -> HatchResult<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| HatchError::NotFound(format!("session {session_id}")))
    }

    /// Recording held in memory: a snapshot while the session is live, the
    /// sealed copy after it ended until the store has it. `None` otherwise.
    pub async fn recording(&self, session_id: &str) -> Option<SealedRecording> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id)?;
        match entry.session.state {
            SessionState::Active => Some(entry.recorder.lock().snapshot()),
            SessionState::Ended => entry.sealed.clone(),
        }
    }

    /// Ask a session to end. The session task does the actual teardown.
    pub async fn terminate(&self, session_id: &str, reason: EndReason) -> HatchResult<()> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| HatchError::NotFound(format!("session {session_id}")))?;
        if entry.session.state == SessionState::Ended {
            debug!(session_id, "terminate on an ended session");
            return Ok(());
        }
        entry.terminate.send_replace(Some(reason));
        info!(session_id, reason = %reason, "session termination requested");
        Ok(())
    }

    /// Mark a session ended and seal its recording. Only the first call has
    /// an effect; it returns the sealed recording for the caller to persist.
    pub async fn end(&self, session_id: &str, reason: EndReason) -> Option<SealedRecording> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) if entry.session.state == SessionState::Active => {
                entry.session.state = SessionState::Ended;
                entry.session.ended_at = Some(now_ms());
                entry.session.end_reason = Some(reason);
                let sealed = entry.recorder.lock().seal();
                entry.sealed = Some(sealed.clone());
                info!(session_id, reason = %reason, events = sealed.events().len(), "session ended");
                Some(sealed)
            }
            _ => None,
        }
    }

    /// The store has the recording; drop the in-memory copy.
    pub async fn mark_recording_persisted(&self, session_id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.session.recording_persisted = true;
            entry.sealed = None;
        }
    }

    pub async fn list(&self) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|e| e.session.state == SessionState::Active)
            .count()
    }

    /// Forget sessions that ended more than `retain` ago. Returns how many.
    pub async fn gc(&self, retain: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(retain.as_millis() as u64);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, e| e.session.ended_at.map_or(true, |at| at > cutoff));
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "ended sessions collected");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Direction;

    fn new_session(id: &str, device: &str) -> NewSession {
        NewSession {
            session_id: id.into(),
            device_id: device.into(),
            user_id: "alice".into(),
            purpose: Purpose::Shell,
            owner_instance_id: "gw-a".into(),
            authorized_scope: Permission {
                namespace_id: "default".into(),
                scopes: vec![Purpose::Shell],
                allow_pty: true,
                forced_command: None,
            },
        }
    }

    #[tokio::test]
    async fn ended_sessions_are_frozen() {
        let mgr = SessionManager::new(8);
        mgr.create(new_session("s1", "d1")).await.unwrap();
        assert_eq!(mgr.status("s1").await.unwrap().state, SessionState::Active);

        assert!(mgr.end("s1", EndReason::ClientClose).await.is_some());
        assert!(mgr.end("s1", EndReason::Timeout).await.is_none());
        let s = mgr.status("s1").await.unwrap();
        assert_eq!(s.state, SessionState::Ended);
        assert_eq!(s.end_reason, Some(EndReason::ClientClose));
        assert!(s.ended_at.is_some());
    }

    #[tokio::test]
    async fn sealed_recording_is_held_until_persisted() {
        let mgr = SessionManager::new(8);
        let handle = mgr.create(new_session("s1", "d1")).await.unwrap();
        handle
            .recorder
            .lock()
            .record(Direction::Output, b"$ ")
            .unwrap();
        assert_eq!(mgr.recording("s1").await.unwrap().events().len(), 1);

        let sealed = mgr.end("s1", EndReason::ClientClose).await.unwrap();
        assert_eq!(sealed.bytes(Direction::Output), b"$ ");
        assert_eq!(mgr.recording("s1").await, Some(sealed));

        mgr.mark_recording_persisted("s1").await;
        assert!(mgr.recording("s1").await.is_none());
        assert!(mgr.status("s1").await.unwrap().recording_persisted);
        assert!(mgr.recording("nope").await.is_none());
    }

    #[tokio::test]
    async fn terminate_signals_the_session_task() {
        let mgr = SessionManager::new(8);
        let mut handle = mgr.create(new_session("s1", "d1")).await.unwrap();
        mgr.terminate("s1", EndReason::PolicyRevoked).await.unwrap();
        handle.terminate.changed().await.unwrap();
        assert_eq!(*handle.terminate.borrow(), Some(EndReason::PolicyRevoked));
        assert!(matches!(
            mgr.terminate("nope", EndReason::Timeout).await,
            Err(HatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn session_cap_counts_active_sessions_only() {
        let mgr = SessionManager::new(1);
        mgr.create(new_session("s1", "d1")).await.unwrap();
        assert!(matches!(
            mgr.create(new_session("s2", "d1")).await,
            Err(HatchError::PolicyDenied(_))
        ));
        mgr.end("s1", EndReason::AgentClose).await;
        mgr.create(new_session("s2", "d1")).await.unwrap();
        assert!(mgr.create(new_session("s2", "d1")).await.is_err());
    }

    #[tokio::test]
    async fn gc_drops_only_old_ended_sessions() {
        let mgr = SessionManager::new(8);
        mgr.create(new_session("s1", "d1")).await.unwrap();
        mgr.create(new_session("s2", "d1")).await.unwrap();
        mgr.end("s1", EndReason::ClientClose).await;

        assert_eq!(mgr.gc(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(mgr.gc(Duration::ZERO).await, 1);
        assert_eq!(mgr.list().await.len(), 1);
        assert_eq!(mgr.active_count().await, 1);
    }
}
