#![forbid(unsafe_code)]

//! Join/resume handshake messages and transport-borne control records.
//!
//! A client joins (or re-joins) by presenting its protocol epoch and the
//! highest frame sequence it acknowledges. The server answers with either a
//! full [`InitSnapshot`] or a [`ResumeReplay`] of buffered frames; the
//! decision procedure lives in the session engine.

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Full view snapshot sent on first contact or after a desync.
///
/// Carries everything the client needs to rebuild the view from scratch:
/// the static/dynamic split of the rendered template, the live handler ids
/// to rebind, and the current location. `chain` seeds the client's frame
/// checksum chain for subsequent frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSnapshot {
    /// Sequence number consumed by this snapshot.
    pub seq: u64,
    /// Protocol epoch the snapshot was built under.
    pub version: u64,
    /// Static template segments.
    pub statics: Vec<String>,
    /// Dynamic segment values, parallel to the holes between statics.
    pub dynamics: Vec<String>,
    /// Handler ids the client must bind events to.
    pub handlers: Vec<String>,
    /// Current location (path + query) for history sync.
    pub location: String,
    /// Checksum chain head after this snapshot.
    pub chain: u64,
}

/// Incremental resume: the frames the client missed, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeReplay {
    /// The acknowledged sequence the replay starts after.
    pub ack_seq: u64,
    /// Buffered frames with `seq > ack_seq`, in order.
    pub frames: Vec<Frame>,
}

/// Outcome of a join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinResult {
    /// Full snapshot; the client rebuilds from scratch.
    Init(InitSnapshot),
    /// Replay; the client applies the missed frames in order.
    Resume(ResumeReplay),
}

impl JoinResult {
    /// True when the join fell back to a full snapshot.
    pub fn is_init(&self) -> bool {
        matches!(self, JoinResult::Init(_))
    }
}

/// Handler-subscription delta announced to the client after a render pass.
///
/// Tells the client which handler ids became live and which were released,
/// so it can bind and unbind event listeners without re-scanning the view.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PubsubControl {
    /// Handler ids registered this pass.
    pub subscribed: Vec<String>,
    /// Handler ids released this pass.
    pub released: Vec<String>,
}

impl PubsubControl {
    /// True when the pass changed no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.subscribed.is_empty() && self.released.is_empty()
    }
}

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A component render returned an error.
    RenderError,
    /// A component render panicked.
    RenderPanic,
    /// A client call timed out or failed.
    ClientCall,
}

/// Structured fault record surfaced to the client in development mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Human-readable description of the fault.
    pub message: String,
    /// Arena handle of the faulting component, when known.
    pub component: Option<String>,
}
