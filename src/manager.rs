//! The stream manager: the in-process registry of active sessions backing the REST
//! control plane. Guards its map with a `tokio::sync::Mutex` (not `std::sync::Mutex`) because
//! `remove` needs to await the session task's exit while holding a consistent view of the map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::{RepresentationInfo, Session, SessionStatus};

struct SessionHandle {
    config: SessionConfig,
    root_dir: PathBuf,
    status: Arc<Mutex<SessionStatus>>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// A snapshot of one session's current state, suitable for serializing back over the REST control
/// plane's `GET /streams/{id}` endpoint.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: &'static str,
    pub error_message: Option<String>,
    pub mpd_url: String,
    pub label: Option<String>,
    pub video: Option<RepresentationInfo>,
    pub audio: Option<RepresentationInfo>,
}

pub struct StreamManager {
    output_root: PathBuf,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl StreamManager {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        StreamManager {
            output_root: output_root.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a new session, spawning its background task and registering it under a fresh id.
    pub async fn create(&self, config: SessionConfig) -> Uuid {
        let id = Uuid::new_v4();
        let root_dir = config
            .output_dir
            .clone()
            .unwrap_or_else(|| self.output_root.join(id.to_string()));
        let cancel = CancellationToken::new();
        let session = Session::new(id, config.clone(), root_dir.clone(), cancel.clone());
        let status = session.status_handle();

        let join = tokio::spawn(session.run());

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            id,
            SessionHandle {
                config,
                root_dir,
                status,
                cancel,
                join,
            },
        );
        info!(session = %id, "created session");
        id
    }

    pub async fn get(&self, id: Uuid) -> Result<SessionSnapshot, SessionError> {
        let sessions = self.sessions.lock().await;
        let handle = sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        let status = handle.status.lock().await;
        Ok(SessionSnapshot {
            id,
            state: status.state.as_str(),
            error_message: status.error_message.clone(),
            mpd_url: handle.config.mpd_url.clone(),
            label: handle.config.label.clone(),
            video: status.video.clone(),
            audio: status.audio.clone(),
        })
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock().await;
        let mut out = Vec::with_capacity(sessions.len());
        for (id, handle) in sessions.iter() {
            let status = handle.status.lock().await;
            out.push(SessionSnapshot {
                id: *id,
                state: status.state.as_str(),
                error_message: status.error_message.clone(),
                mpd_url: handle.config.mpd_url.clone(),
                label: handle.config.label.clone(),
                video: status.video.clone(),
                audio: status.audio.clone(),
            });
        }
        out
    }

    /// Requests cancellation and waits for the session's background task to actually exit before
    /// removing it from the map, so that callers observing a successful `remove` can rely on the
    /// session's files no longer being written to.
    pub async fn remove(&self, id: Uuid) -> Result<(), SessionError> {
        let handle = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&id).ok_or(SessionError::NotFound(id))?
        };
        handle.cancel.cancel();
        let _ = handle.join.await;
        info!(session = %id, "removed session");
        Ok(())
    }

    /// The directory a session's HLS output is actually written to (honors a per-session
    /// `output_dir` override; defaults to `<output_root>/<id>` otherwise).
    pub async fn session_dir(&self, id: Uuid) -> Option<PathBuf> {
        let sessions = self.sessions.lock().await;
        sessions.get(&id).map(|h| h.root_dir.clone())
    }

    pub fn root(&self) -> &Path {
        &self.output_root
    }
}
