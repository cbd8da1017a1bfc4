#![forbid(unsafe_code)]

//! Render context: the explicit per-render view of one component.
//!
//! Everything a component render is allowed to touch flows through this
//! context — hook slots, the per-render handler counter, the previous
//! props snapshot. The counter-reset pattern is deliberately *not* ambient
//! state: constructing the context is what resets the node's cursors, so
//! a render that never starts can never skew another node's indices.
//!
//! Lifecycle: `begin` → (render body calls `use_state` /
//! `register_handler`) → `finish`, which sweeps handlers the render did
//! not re-emit. A faulted render calls `abandon` instead, leaving the
//! previous registrations in place (the client keeps its last-good
//! bindings).

use std::marker::PhantomData;

use crate::event::EventPayload;
use crate::handlers::{HandlerFn, HandlerId, SharedRegistry};
use crate::tree::{ComponentId, SharedTree};

/// Handler-subscription delta produced by one component render.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Ids whose delivery subscription was created during this render.
    pub subscribed: Vec<HandlerId>,
    /// Ids released because the render did not re-emit them.
    pub released: Vec<HandlerId>,
}

/// Setter half of a hook state slot.
///
/// Writing marks the owning node dirty; the new value becomes visible to
/// the node's next render.
pub struct StateSetter<T> {
    tree: SharedTree,
    node: ComponentId,
    slot: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for StateSetter<T> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            node: self.node,
            slot: self.slot,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> StateSetter<T> {
    /// Store `value` in the slot and mark the node dirty.
    pub fn set(&self, value: T) {
        self.tree
            .lock()
            .expect("tree lock poisoned")
            .hook_set(self.node, self.slot, value);
    }
}

/// The explicit render context for one node in one pass.
pub struct RenderContext {
    tree: SharedTree,
    handlers: SharedRegistry,
    node: ComponentId,
    subscribed: Vec<HandlerId>,
}

impl RenderContext {
    /// Open the context: clears the node's dirty flag, resets its hook and
    /// handler cursors, and opens the registry's render bracket.
    pub fn begin(tree: SharedTree, handlers: SharedRegistry, node: ComponentId) -> Self {
        tree.lock()
            .expect("tree lock poisoned")
            .begin_render(node);
        handlers
            .lock()
            .expect("registry lock poisoned")
            .begin_owner_render(node);
        Self {
            tree,
            handlers,
            node,
            subscribed: Vec::new(),
        }
    }

    /// The node this context renders.
    #[inline]
    pub fn node(&self) -> ComponentId {
        self.node
    }

    /// Read (initializing on first use) the next hook state slot.
    ///
    /// Hook order must be stable across renders of the same node; the slot
    /// is addressed by call order, not by name.
    pub fn use_state<T: Clone + Send + 'static>(
        &mut self,
        init: impl FnOnce() -> T,
    ) -> (T, StateSetter<T>) {
        let mut tree = self.tree.lock().expect("tree lock poisoned");
        let slot = tree.next_hook_index(self.node);
        let value = tree.hook_get_or_init(self.node, slot, init);
        drop(tree);
        (
            value,
            StateSetter {
                tree: self.tree.clone(),
                node: self.node,
                slot,
                _marker: PhantomData,
            },
        )
    }

    /// Register an event handler for this render.
    ///
    /// The positional index comes from the node's per-render counter; see
    /// `HandlerRegistry::register` for the id derivation rules.
    pub fn register_handler(
        &mut self,
        element_ref: Option<&str>,
        event: &str,
        callback: HandlerFn,
    ) -> HandlerId {
        let index = self
            .tree
            .lock()
            .expect("tree lock poisoned")
            .next_handler_index(self.node);
        let (id, created) = self
            .handlers
            .lock()
            .expect("registry lock poisoned")
            .register(self.node, element_ref, event, index, callback);
        if created {
            self.subscribed.push(id.clone());
        }
        id
    }

    /// The previous props snapshot, if one was stored.
    pub fn prev_props(&self) -> Option<Vec<u8>> {
        self.tree
            .lock()
            .expect("tree lock poisoned")
            .prev_props(self.node)
            .map(<[u8]>::to_vec)
    }

    /// Store the props snapshot the next render will see as "previous".
    pub fn commit_props(&mut self, props: Vec<u8>) {
        self.tree
            .lock()
            .expect("tree lock poisoned")
            .set_prev_props(self.node, props);
    }

    /// Close the context after a successful render: sweep handlers the
    /// render did not re-emit and report the subscription delta.
    pub fn finish(self) -> SweepOutcome {
        let released = self
            .handlers
            .lock()
            .expect("registry lock poisoned")
            .end_owner_render(self.node);
        SweepOutcome {
            subscribed: self.subscribed,
            released,
        }
    }

    /// Close the context after a faulted render without sweeping, keeping
    /// the node's last-good handler registrations live.
    pub fn abandon(self) {}

    /// Convenience for tests and hosting layers: dispatch a payload
    /// straight through the registry bound to this context.
    pub fn dispatch(&self, id: &HandlerId, payload: EventPayload) -> crate::handlers::HandlerResult<()> {
        self.handlers
            .lock()
            .expect("registry lock poisoned")
            .dispatch(id, payload)
    }
}
