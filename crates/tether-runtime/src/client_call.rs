#![forbid(unsafe_code)]

//! Deadline-bounded bridge for renders that wait on a client response.
//!
//! A component render may issue a blocking client call (DOM query, async
//! hook result). The render's worker parks on a response channel with a
//! deadline — 5 seconds by default — and gets a timeout error back rather
//! than wedging the scheduler; other workers proceed independently.
//!
//! A timed-out call's table entry is removed, so a late `resolve` finds
//! nothing and the response is dropped on the floor.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Errors a waiting render can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCallError {
    /// No response arrived within the deadline.
    Timeout(Duration),
    /// The bridge dropped the call (session torn down).
    Closed,
}

impl fmt::Display for ClientCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCallError::Timeout(d) => {
                write!(f, "client call timed out after {}ms", d.as_millis())
            }
            ClientCallError::Closed => write!(f, "client call channel closed"),
        }
    }
}

impl std::error::Error for ClientCallError {}

/// Result type for client-call operations.
pub type ClientCallResult<T> = Result<T, ClientCallError>;

/// Pending-call table shared between renders and the wire layer.
#[derive(Debug, Clone)]
pub struct ClientCallBridge {
    pending: Arc<Mutex<HashMap<u64, mpsc::Sender<String>>>>,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl ClientCallBridge {
    /// Create a bridge with the given per-call deadline.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    /// Open a pending call. The returned handle's id goes to the client;
    /// `wait` parks until `resolve` or the deadline.
    pub fn begin(&self) -> PendingCall {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("call table poisoned")
            .insert(id, tx);
        PendingCall {
            id,
            rx,
            pending: Arc::clone(&self.pending),
            timeout: self.timeout,
        }
    }

    /// Deliver the client's response for call `id`.
    ///
    /// Returns false when the call is unknown — already resolved, timed
    /// out, or never issued. Late responses are dropped, not errors.
    pub fn resolve(&self, id: u64, payload: String) -> bool {
        let sender = self.pending.lock().expect("call table poisoned").remove(&id);
        match sender {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                tracing::debug!(call = id, "late client-call response dropped");
                false
            }
        }
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("call table poisoned").len()
    }
}

/// One in-flight client call.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: mpsc::Receiver<String>,
    pending: Arc<Mutex<HashMap<u64, mpsc::Sender<String>>>>,
    timeout: Duration,
}

impl PendingCall {
    /// Id the client must echo in its response.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Park until the response arrives or the deadline passes.
    pub fn wait(self) -> ClientCallResult<String> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(payload) => Ok(payload),
            Err(RecvTimeoutError::Timeout) => {
                self.pending
                    .lock()
                    .expect("call table poisoned")
                    .remove(&self.id);
                Err(ClientCallError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.pending
                    .lock()
                    .expect("call table poisoned")
                    .remove(&self.id);
                Err(ClientCallError::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolve_wakes_the_waiter() {
        let bridge = ClientCallBridge::new(Duration::from_secs(1));
        let call = bridge.begin();
        let id = call.id();

        let resolver = bridge.clone();
        let handle = thread::spawn(move || {
            resolver.resolve(id, "42".to_owned());
        });

        assert_eq!(call.wait(), Ok("42".to_owned()));
        handle.join().unwrap();
        assert_eq!(bridge.pending_count(), 0);
    }

    #[test]
    fn timeout_returns_an_error_and_drops_the_entry() {
        let bridge = ClientCallBridge::new(Duration::from_millis(5));
        let call = bridge.begin();
        let id = call.id();

        let err = call.wait().unwrap_err();
        assert!(matches!(err, ClientCallError::Timeout(_)));
        // A late response finds nothing to resolve.
        assert!(!bridge.resolve(id, "too late".to_owned()));
    }

    #[test]
    fn concurrent_calls_resolve_independently() {
        let bridge = ClientCallBridge::new(Duration::from_secs(1));
        let a = bridge.begin();
        let b = bridge.begin();
        assert_ne!(a.id(), b.id());

        bridge.resolve(b.id(), "b".to_owned());
        bridge.resolve(a.id(), "a".to_owned());
        assert_eq!(a.wait(), Ok("a".to_owned()));
        assert_eq!(b.wait(), Ok("b".to_owned()));
    }
}
