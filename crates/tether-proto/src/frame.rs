#![forbid(unsafe_code)]

//! Frame = one sequenced unit of view change.
//!
//! A frame carries everything the client needs to advance its view by one
//! step: the ordered patch ops, side-effect payloads, an optional
//! navigation directive, and render metrics. Frames are created by the
//! session engine after a successful render pass and owned by the
//! [`FrameBuffer`](crate::buffer::FrameBuffer) until pruned.
//!
//! # Sequence contract
//!
//! Sequence numbers are session-scoped, start at 1, and are strictly
//! increasing and gap-free for the lifetime of a session. A client that
//! observes a gap must re-join rather than apply further frames.
//!
//! # Checksum chain
//!
//! Each frame carries an FNV-1a checksum over its canonical patch bytes,
//! chained to the previous frame's checksum. The init snapshot seeds the
//! chain; a resuming client folds the replayed frames and compares the
//! result against the server's chain head to verify nothing was lost or
//! reordered during replay.

use serde::{Deserialize, Serialize};

use crate::patch::PatchOp;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Fold bytes into an FNV-1a state.
pub fn fnv1a64_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Chain seed for a fresh session (before any init snapshot).
pub const CHAIN_SEED: u64 = FNV_OFFSET_BASIS;

/// A side effect requested by a component render (e.g. a client hook
/// invocation). Opaque to the runtime; delivered in frame order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effect {
    /// Effect name, namespaced by the component that raised it.
    pub name: String,
    /// Raw JSON payload.
    pub payload: String,
}

/// Client-side navigation requested by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NavDirective {
    /// Push a new history entry.
    Push { to: String },
    /// Replace the current history entry.
    Replace { to: String },
}

/// Metrics recorded for one render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RenderMetrics {
    /// Wall-clock render time in microseconds.
    pub render_micros: u64,
    /// Number of components rendered in the pass.
    pub components_rendered: u32,
    /// Number of patch ops in the frame.
    pub patch_count: u32,
    /// Number of component renders that faulted (error or panic).
    pub faults: u32,
}

/// One sequenced unit of patch operations sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Session-scoped sequence number, starting at 1.
    pub seq: u64,
    /// Ordered patch operations.
    pub patches: Vec<PatchOp>,
    /// Side-effect payloads, delivered after the patches apply.
    pub effects: Vec<Effect>,
    /// Optional navigation directive.
    pub nav: Option<NavDirective>,
    /// Render metrics for this pass.
    pub metrics: RenderMetrics,
    /// FNV-1a checksum chained to the previous frame.
    pub checksum: u64,
}

impl Frame {
    /// Build a frame and seal its checksum against the previous chain head.
    ///
    /// The checksum covers the sequence number and the canonical JSON bytes
    /// of the patch list, so two frames with identical patches at different
    /// positions in the chain still hash differently.
    pub fn sealed(
        seq: u64,
        patches: Vec<PatchOp>,
        effects: Vec<Effect>,
        nav: Option<NavDirective>,
        metrics: RenderMetrics,
        prev_chain: u64,
    ) -> Self {
        let checksum = chain_next(prev_chain, seq, &patches);
        Self {
            seq,
            patches,
            effects,
            nav,
            metrics,
            checksum,
        }
    }

    /// True when the frame changes nothing client-visible.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.effects.is_empty() && self.nav.is_none()
    }
}

/// Advance the checksum chain by one frame's content.
pub fn chain_next(prev_chain: u64, seq: u64, patches: &[PatchOp]) -> u64 {
    // Serialization of PatchOp cannot fail: no maps with non-string keys,
    // no non-finite floats.
    let bytes = serde_json::to_vec(patches).unwrap_or_default();
    let hash = fnv1a64_bytes(prev_chain, &seq.to_le_bytes());
    fnv1a64_bytes(hash, &bytes)
}

/// Fold a replayed frame run over a chain seed, as a client would.
///
/// Returns the resulting chain head, or `None` if any frame's stored
/// checksum disagrees with the recomputed chain (lost or reordered frame).
pub fn verify_chain(seed: u64, frames: &[Frame]) -> Option<u64> {
    let mut chain = seed;
    for frame in frames {
        chain = chain_next(chain, frame.seq, &frame.patches);
        if chain != frame.checksum {
            return None;
        }
    }
    Some(chain)
}
