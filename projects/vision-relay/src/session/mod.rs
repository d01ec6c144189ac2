// Session lifecycle: Created -> Active -> Closing -> Closed
//
// A session owns its frame buffer and publishes its state through a watch
// channel so the reader, processor and supervisor all observe the same
// terminal transition.

pub mod registry;
pub mod router;
pub mod stats;

use crate::pipeline::frame_buffer::FrameBuffer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use stats::{SessionStats, StatsSnapshot};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_terminating(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

/// Why a session left the Active state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    StreamEnded,
    SourceFailed,
    ProcessingFailed,
    TrackUnavailable,
    Requested,
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    pub stats: StatsSnapshot,
}

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    buffer: FrameBuffer,
    state: watch::Sender<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    stats: SessionStats,
    workers: Mutex<Vec<AbortHandle>>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            id: id.into(),
            created_at: Utc::now(),
            buffer: FrameBuffer::new(),
            state,
            close_reason: Mutex::new(None),
            stats: SessionStats::default(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.buffer.dropped())
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|reason| *reason)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
            close_reason: self.close_reason(),
            stats: self.stats_snapshot(),
        }
    }

    /// Created -> Active. Returns false if the session is not in Created.
    pub fn activate(&self) -> bool {
        let activated = self.state.send_if_modified(|state| {
            if *state == SessionState::Created {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
        if activated {
            info!("Session {} active", self.id);
        }
        activated
    }

    /// Move to Closing and close the frame buffer. Only the first caller
    /// performs the transition; later calls return false.
    pub fn request_close(&self, reason: CloseReason) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if state.is_terminating() {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });
        if transitioned {
            if let Ok(mut slot) = self.close_reason.lock() {
                *slot = Some(reason);
            }
            self.buffer.close();
            info!("Session {} closing ({:?})", self.id, reason);
        }
        transitioned
    }

    /// Final transition, performed once all workers have finished.
    pub fn mark_closed(&self) {
        self.buffer.close();
        let closed = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if closed {
            info!("Session {} closed", self.id);
        }
    }

    /// Resolves once the session has left the Active state.
    pub async fn closing(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|state| state.is_terminating()).await;
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub fn attach_workers(&self, handles: Vec<AbortHandle>) {
        if let Ok(mut workers) = self.workers.lock() {
            workers.extend(handles);
        }
    }

    fn abort_workers(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                handle.abort();
            }
        }
    }

    /// Request closing and wait for Closed. Workers still running after
    /// `grace` are aborted.
    pub async fn close(&self, reason: CloseReason, grace: Duration) {
        self.request_close(reason);
        if tokio::time::timeout(grace, self.wait_closed()).await.is_ok() {
            return;
        }

        warn!(
            "Session {} did not close within {:?}, aborting workers",
            self.id, grace
        );
        self.abort_workers();
        if tokio::time::timeout(grace, self.wait_closed()).await.is_err() {
            warn!("Session {} has no supervisor, forcing Closed", self.id);
            self.mark_closed();
        }
    }
}
