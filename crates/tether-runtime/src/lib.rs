#![forbid(unsafe_code)]

//! Tether Runtime
//!
//! This crate ties the component tree (`tether-core`) and the protocol data
//! model (`tether-proto`) into a server-driven UI runtime.
//!
//! # Key Components
//!
//! - [`RenderScheduler`] - Renders a batch of dirty components in parallel,
//!   parent before child
//! - [`Session`] - Per-client protocol engine: flush, dispatch, join/resume,
//!   ack
//! - [`SessionRegistry`] - Owns the live sessions and sweeps expired ones
//! - [`Reconciler`] - Trait seam for the external view-diffing collaborator
//! - [`Transport`] - Trait seam for the wire layer
//! - [`ClientCallBridge`] - Deadline-bounded bridge for renders that wait on
//!   a client response
//!
//! # How it fits in the system
//!
//! The runtime is the orchestrator. External events enter through
//! [`Session::dispatch_event`], mutate hook state via registered handlers,
//! and come back out as sequenced frames the attached [`Transport`] streams
//! to the client. A disconnected client re-enters through
//! [`Session::join`], which decides between replaying buffered frames and
//! sending a full snapshot.

pub mod client_call;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use client_call::{ClientCallBridge, ClientCallError, ClientCallResult, PendingCall};
pub use reconcile::{Reconciler, RenderError, RenderOutput, ViewSnapshot};
pub use registry::SessionRegistry;
pub use scheduler::{BatchReport, FaultKind, RenderFault, RenderScheduler, SchedulerConfig};
pub use session::{
    DiagnosticsMode, DispatchOutcome, FlushOutcome, Session, SessionConfig, SessionError,
    SessionId, SessionResult, SessionStats,
};
pub use transport::{RecordingTransport, SentMessage, Transport, TransportError, TransportResult};
