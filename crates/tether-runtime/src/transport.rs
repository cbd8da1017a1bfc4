#![forbid(unsafe_code)]

//! Transport seam: how frames and handshake messages leave the engine.
//!
//! Every send is fire-and-forget from the engine's perspective: a failure
//! is returned to the caller, but buffered state is never rolled back —
//! the frame stays in the buffer and is replayed on the next successful
//! join/ack cycle. Retry policy belongs to the transport implementation or
//! the hosting layer, not here.
//!
//! [`RecordingTransport`] is the built-in in-memory implementation, used by
//! the test suites and useful to hosting layers as a capture buffer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tether_proto::frame::Frame;
use tether_proto::messages::{Diagnostic, InitSnapshot, PubsubControl, ResumeReplay};

/// Errors a transport can report on send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The underlying connection is gone.
    Closed,
    /// The peer or the wire layer refused the message.
    Rejected(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Rejected(reason) => write!(f, "transport rejected send: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Outbound wire interface of the session engine.
pub trait Transport: Send {
    /// Deliver a full init snapshot.
    fn send_init(&mut self, snapshot: &InitSnapshot) -> TransportResult<()>;
    /// Deliver a resume acknowledgment with its replay frames.
    fn send_resume(&mut self, replay: &ResumeReplay) -> TransportResult<()>;
    /// Deliver one sequenced frame.
    fn send_frame(&mut self, frame: &Frame) -> TransportResult<()>;
    /// Deliver a structured diagnostic (development mode).
    fn send_error(&mut self, diagnostic: &Diagnostic) -> TransportResult<()>;
    /// Deliver a handler-subscription delta.
    fn send_pubsub_control(&mut self, control: &PubsubControl) -> TransportResult<()>;
}

/// One message captured by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum SentMessage {
    Init(InitSnapshot),
    Resume(ResumeReplay),
    Frame(Frame),
    Error(Diagnostic),
    Pubsub(PubsubControl),
}

/// In-memory transport that records every message it is asked to send.
///
/// Clones share the same log, so a test can keep one handle while the
/// session owns the other. `set_failing(true)` makes every send return
/// [`TransportError::Closed`] without recording, for exercising the
/// keep-buffered-on-failure path.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<Vec<SentMessage>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingTransport {
    /// Create an empty recording transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.log.lock().expect("transport log poisoned").clone()
    }

    /// Sequence numbers of the frames sent, in send order.
    pub fn frame_seqs(&self) -> Vec<u64> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                SentMessage::Frame(f) => Some(f.seq),
                _ => None,
            })
            .collect()
    }

    /// The most recent init snapshot sent, if any.
    pub fn last_init(&self) -> Option<InitSnapshot> {
        self.sent().iter().rev().find_map(|m| match m {
            SentMessage::Init(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn record(&self, message: SentMessage) -> TransportResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.log
            .lock()
            .expect("transport log poisoned")
            .push(message);
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn send_init(&mut self, snapshot: &InitSnapshot) -> TransportResult<()> {
        self.record(SentMessage::Init(snapshot.clone()))
    }

    fn send_resume(&mut self, replay: &ResumeReplay) -> TransportResult<()> {
        self.record(SentMessage::Resume(replay.clone()))
    }

    fn send_frame(&mut self, frame: &Frame) -> TransportResult<()> {
        self.record(SentMessage::Frame(frame.clone()))
    }

    fn send_error(&mut self, diagnostic: &Diagnostic) -> TransportResult<()> {
        self.record(SentMessage::Error(diagnostic.clone()))
    }

    fn send_pubsub_control(&mut self, control: &PubsubControl) -> TransportResult<()> {
        self.record(SentMessage::Pubsub(control.clone()))
    }
}
