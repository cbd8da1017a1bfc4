#![forbid(unsafe_code)]

//! Seam for the external reconciler collaborator.
//!
//! The runtime treats view diffing as a black box: a [`Reconciler`] renders
//! one component against its previous view tree and hands back the patch
//! ops, side effects, and navigation the client should see. How the diff is
//! computed (template splitting, keyed lists, morphing) is entirely the
//! collaborator's business.

use std::fmt;

use tether_core::context::RenderContext;
use tether_core::handlers::SharedRegistry;
use tether_core::tree::SharedTree;
use tether_proto::frame::{Effect, NavDirective};
use tether_proto::patch::PatchOp;

/// Everything one component render contributes to a frame.
#[derive(Debug, Default)]
pub struct RenderOutput {
    /// Ordered patch ops for this component's region of the view.
    pub patches: Vec<PatchOp>,
    /// Side effects raised during the render.
    pub effects: Vec<Effect>,
    /// Navigation requested by the render, if any.
    pub nav: Option<NavDirective>,
}

impl RenderOutput {
    /// Output that changes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when this output contributes nothing to a frame.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.effects.is_empty() && self.nav.is_none()
    }
}

/// The full-view material an init snapshot is assembled from.
#[derive(Debug, Clone, Default)]
pub struct ViewSnapshot {
    /// Static template segments.
    pub statics: Vec<String>,
    /// Dynamic segment values.
    pub dynamics: Vec<String>,
    /// Current location (path + query).
    pub location: String,
}

/// Error returned by a component render.
///
/// Carries only a message: the runtime's job is containment and reporting,
/// not interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderError {
    message: String,
}

impl RenderError {
    /// Build a render error from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RenderError {}

/// The external view-diffing collaborator.
///
/// Implementations must be shareable across scheduler workers; sibling
/// components may render concurrently.
pub trait Reconciler: Send + Sync {
    /// Render one component and diff it against its previous view tree.
    fn render(&self, ctx: &mut RenderContext) -> Result<RenderOutput, RenderError>;

    /// Assemble the material for a full init snapshot of the current view.
    fn snapshot(&self, tree: &SharedTree, handlers: &SharedRegistry) -> ViewSnapshot;
}
