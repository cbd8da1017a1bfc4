#![forbid(unsafe_code)]

//! Protocol data model: patch operations, sequenced frames, and the
//! bounded replay buffer.
//!
//! Everything in this crate is wire-facing and serde-derived. The crate
//! holds no behavior beyond the frame buffer's eviction/pruning discipline
//! and the frame checksum chain; orchestration lives in `tether-runtime`.

pub mod buffer;
pub mod frame;
pub mod messages;
pub mod patch;

pub use buffer::FrameBuffer;
pub use frame::{CHAIN_SEED, Effect, Frame, NavDirective, RenderMetrics};
pub use messages::{
    Diagnostic, DiagnosticKind, InitSnapshot, JoinResult, PubsubControl, ResumeReplay,
};
pub use patch::PatchOp;
