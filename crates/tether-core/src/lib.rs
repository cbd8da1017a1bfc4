#![forbid(unsafe_code)]

//! Core: component tree, hook state, handler identity, and render context.

pub mod context;
pub mod event;
pub mod handlers;
pub mod logging;
pub mod tree;

pub use context::{RenderContext, StateSetter, SweepOutcome};
pub use event::EventPayload;
pub use handlers::{HandlerId, HandlerRegistry, SharedRegistry};
pub use tree::{ComponentId, ComponentTree, NodeFlags, NodeIdentity, SharedTree};

// Re-export tracing macros at crate root for ergonomic use.
#[cfg(feature = "tracing")]
pub use logging::{debug, debug_span, error, info, trace, warn};
