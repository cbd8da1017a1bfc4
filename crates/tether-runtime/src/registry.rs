#![forbid(unsafe_code)]

//! Session registry: the hosting layer's view of live sessions.
//!
//! Creates sessions from a shared config template, hands out shared
//! handles by id, and sweeps the ones whose TTL ran out. Lookups do not
//! refresh a session's TTL clock; only session operations touch it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::reconcile::Reconciler;
use crate::session::{Session, SessionConfig, SessionId};

/// Owner of every live session in the process.
pub struct SessionRegistry {
    template: SessionConfig,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry; every session it creates starts from `template`.
    pub fn new(template: SessionConfig) -> Self {
        Self {
            template,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create and register a new session.
    pub fn create(&self, reconciler: Arc<dyn Reconciler>) -> Arc<Session> {
        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(Session::new(id, self.template.clone(), reconciler));
        self.sessions
            .lock()
            .expect("session table poisoned")
            .insert(id, Arc::clone(&session));
        tracing::info!(session = %id, "session created");
        session
    }

    /// Look up a session without refreshing its TTL.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .get(&id)
            .cloned()
    }

    /// Tear down a session explicitly.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .lock()
            .expect("session table poisoned")
            .remove(&id);
        if removed.is_some() {
            tracing::info!(session = %id, "session removed");
        }
        removed
    }

    /// Drop every session whose idle time exceeds its TTL.
    ///
    /// Returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        let before = sessions.len();
        sessions.retain(|_, session| !session.expired(now));
        let dropped = before - sessions.len();
        if dropped > 0 {
            tracing::info!(dropped, "expired sessions swept");
        }
        dropped
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session table poisoned").len()
    }

    /// True when no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
