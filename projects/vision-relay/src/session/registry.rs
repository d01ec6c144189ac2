use crate::error::{DuplicateSessionError, SessionError};
use crate::session::{CloseReason, Session};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

#[derive(Default)]
struct Table {
    sessions: HashMap<String, Arc<Session>>,
    /// Set by `close_all`; no session may register afterwards.
    closed: bool,
}

/// Table of live sessions keyed by client id
#[derive(Default)]
pub struct SessionRegistry {
    table: Mutex<Table>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a session under its id. An id that is already present is
    /// rejected, and so is every registration once `close_all` has started.
    pub fn register(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut table = self.lock();
        if table.closed {
            return Err(SessionError::ShuttingDown);
        }
        if table.sessions.contains_key(session.id()) {
            return Err(DuplicateSessionError {
                client_id: session.id().to_string(),
            }
            .into());
        }
        info!("Registering session for client {}", session.id());
        table.sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().sessions.get(id).cloned()
    }

    /// Unconditional removal by id. Supervisors use `remove_session` instead so
    /// a stale handle never evicts a newer session.
    #[allow(dead_code)]
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().sessions.remove(id)
    }

    /// Remove `session` only if it is still the registered instance for its id.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut table = self.lock();
        match table.sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                table.sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Stop accepting sessions, close every registered one and wait until all
    /// of them are Closed.
    pub async fn close_all(&self, grace: Duration) {
        let sessions: Vec<Arc<Session>> = {
            let mut table = self.lock();
            table.closed = true;
            table.sessions.values().cloned().collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!("Closing {} sessions", sessions.len());

        futures::future::join_all(sessions.iter().map(|session| async move {
            session.close(CloseReason::Shutdown, grace).await;
            self.remove_session(session);
        }))
        .await;
    }
}
