#![forbid(unsafe_code)]

//! Handler registry: stable identity for event callbacks.
//!
//! A DOM-bound handler needs an identifier that survives re-renders, so the
//! client can keep delivering events while the server swaps the callback
//! underneath. Two derivation schemes:
//!
//! - With a stable element reference: `"<ref>:<event>"` — stable across
//!   renders regardless of registration order.
//! - Without one: `"<owner>:h<n>"`, where `n` is the owner's per-render
//!   handler counter (reset by the render context at render start).
//!
//! # Delivery
//!
//! Each live registration owns exactly one mpsc channel — the delivery
//! subscription. Dispatch enqueues the payload; `deliver_pending` drains
//! every queue and invokes the callbacks, all under the session lock.
//! Re-registering an id replaces the callback in place and keeps the
//! channel, so the subscriber count per id never exceeds one.
//!
//! # Lifecycle
//!
//! `begin_owner_render` / `end_owner_render` bracket one owner's render:
//! the end sweep releases every registration the owner did not re-emit,
//! closing its channel. `remove_owner` releases everything when a
//! component is swept from the tree.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::event::EventPayload;
use crate::tree::ComponentId;

/// Shared handle to a handler registry.
pub type SharedRegistry = Arc<Mutex<HandlerRegistry>>;

/// Callback invoked when the client fires the bound event.
pub type HandlerFn = Box<dyn FnMut(&EventPayload) + Send>;

/// Stable identifier binding a client-side event to a server callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(String);

impl HandlerId {
    /// Id derived from a stable element reference.
    pub fn for_ref(ref_id: &str, event: &str) -> Self {
        Self(format!("{ref_id}:{event}"))
    }

    /// Positional id derived from the owner and its per-render counter.
    pub fn positional(owner: ComponentId, index: u32) -> Self {
        Self(format!("{owner}:h{index}"))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Errors raised by handler dispatch.
#[derive(Debug)]
pub enum HandlerError {
    /// No live registration for the id.
    Unknown(HandlerId),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Unknown(id) => write!(f, "no handler registered for {id}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Result type for handler operations.
pub type HandlerResult<T> = Result<T, HandlerError>;

struct Registration {
    owner: ComponentId,
    callback: HandlerFn,
    tx: mpsc::Sender<EventPayload>,
    rx: mpsc::Receiver<EventPayload>,
    last_pass: u64,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("owner", &self.owner)
            .field("last_pass", &self.last_pass)
            .finish_non_exhaustive()
    }
}

/// Registry of live handler registrations.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: HashMap<HandlerId, Registration>,
    owner_pass: HashMap<ComponentId, u64>,
    pass_counter: u64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry behind its shared handle.
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Open a render bracket for `owner`.
    ///
    /// Registrations made until the matching [`end_owner_render`] carry the
    /// new pass stamp; the end sweep releases the ones that don't.
    ///
    /// [`end_owner_render`]: HandlerRegistry::end_owner_render
    pub fn begin_owner_render(&mut self, owner: ComponentId) {
        self.pass_counter += 1;
        self.owner_pass.insert(owner, self.pass_counter);
    }

    /// Register (or refresh) a handler.
    ///
    /// `element_ref` selects the derivation scheme; `index` is the owner's
    /// per-render counter and is ignored when a ref is present. Returns the
    /// id and whether a new delivery subscription was created.
    ///
    /// Positional ids are reproducible only when the owner emits handlers
    /// in the same order every render; conditional emission reorders the
    /// indices and rebinds callbacks to the wrong ids. Content-addressed
    /// keys would remove that fragility at the cost of hashing the
    /// callback's binding; refs are the supported escape hatch today.
    pub fn register(
        &mut self,
        owner: ComponentId,
        element_ref: Option<&str>,
        event: &str,
        index: u32,
        callback: HandlerFn,
    ) -> (HandlerId, bool) {
        let id = match element_ref {
            Some(ref_id) => HandlerId::for_ref(ref_id, event),
            None => HandlerId::positional(owner, index),
        };
        let pass = self.owner_pass.get(&owner).copied().unwrap_or(0);
        match self.entries.get_mut(&id) {
            Some(entry) => {
                // Replace in place: the channel (and thus the delivery
                // subscription) survives the re-registration.
                entry.callback = callback;
                entry.owner = owner;
                entry.last_pass = pass;
                (id, false)
            }
            None => {
                let (tx, rx) = mpsc::channel();
                self.entries.insert(
                    id.clone(),
                    Registration {
                        owner,
                        callback,
                        tx,
                        rx,
                        last_pass: pass,
                    },
                );
                (id, true)
            }
        }
    }

    /// Close a render bracket: release every registration `owner` did not
    /// re-emit during it. Returns the released ids.
    pub fn end_owner_render(&mut self, owner: ComponentId) -> Vec<HandlerId> {
        let pass = self.owner_pass.get(&owner).copied().unwrap_or(0);
        let stale: Vec<HandlerId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == owner && e.last_pass != pass)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        if !stale.is_empty() {
            crate::debug!(owner = %owner, released = stale.len(), "handler sweep");
        }
        stale
    }

    /// Release every registration owned by `owner` (component destroyed).
    /// Returns the released ids.
    pub fn remove_owner(&mut self, owner: ComponentId) -> Vec<HandlerId> {
        let owned: Vec<HandlerId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &owned {
            self.entries.remove(id);
        }
        self.owner_pass.remove(&owner);
        owned
    }

    /// Enqueue a payload for `id`'s subscription.
    pub fn dispatch(&self, id: &HandlerId, payload: EventPayload) -> HandlerResult<()> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| HandlerError::Unknown(id.clone()))?;
        // The registry owns the receiver, so the channel cannot be closed
        // while the entry is live.
        let _ = entry.tx.send(payload);
        Ok(())
    }

    /// Drain every subscription queue, invoking callbacks in place.
    ///
    /// Returns the number of payloads delivered.
    pub fn deliver_pending(&mut self) -> usize {
        let mut delivered = 0;
        for entry in self.entries.values_mut() {
            while let Ok(payload) = entry.rx.try_recv() {
                (entry.callback)(&payload);
                delivered += 1;
            }
        }
        delivered
    }

    /// True when `id` has a live registration.
    pub fn is_registered(&self, id: &HandlerId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of live delivery subscriptions (one per registered id).
    pub fn live_subscriptions(&self) -> usize {
        self.entries.len()
    }

    /// All live handler ids, sorted, for snapshot assembly.
    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().map(|id| id.0.clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{ComponentTree, NodeIdentity};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn owner() -> ComponentId {
        let mut tree = ComponentTree::new();
        tree.mount(None, NodeIdentity::anonymous(1))
    }

    fn counting_callback(hits: Arc<AtomicUsize>) -> HandlerFn {
        Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn ref_ids_are_stable_across_registration_order() {
        let owner = owner();
        let mut reg = HandlerRegistry::new();
        reg.begin_owner_render(owner);
        let (a, _) = reg.register(owner, Some("save-btn"), "click", 0, Box::new(|_| {}));
        let (b, _) = reg.register(owner, Some("save-btn"), "click", 7, Box::new(|_| {}));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "save-btn:click");
    }

    #[test]
    fn positional_ids_follow_the_render_counter() {
        let owner = owner();
        let mut reg = HandlerRegistry::new();
        reg.begin_owner_render(owner);
        let (a, _) = reg.register(owner, None, "click", 0, Box::new(|_| {}));
        let (b, _) = reg.register(owner, None, "click", 1, Box::new(|_| {}));
        assert_eq!(a.as_str(), format!("{owner}:h0"));
        assert_eq!(b.as_str(), format!("{owner}:h1"));
    }

    #[test]
    fn hundred_reregistrations_one_delivery() {
        let owner = owner();
        let mut reg = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut id = None;
        for _ in 0..100 {
            reg.begin_owner_render(owner);
            let (this_id, _) = reg.register(
                owner,
                Some("counter"),
                "click",
                0,
                counting_callback(hits.clone()),
            );
            let released = reg.end_owner_render(owner);
            assert!(released.is_empty());
            if let Some(prev) = &id {
                assert_eq!(prev, &this_id);
            }
            id = Some(this_id);
        }

        assert_eq!(reg.live_subscriptions(), 1);
        reg.dispatch(&id.unwrap(), EventPayload::new("click", "{}"))
            .unwrap();
        assert_eq!(reg.deliver_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn end_of_render_sweep_releases_unemitted_handlers() {
        let owner = owner();
        let mut reg = HandlerRegistry::new();

        reg.begin_owner_render(owner);
        reg.register(owner, None, "click", 0, Box::new(|_| {}));
        reg.register(owner, None, "input", 1, Box::new(|_| {}));
        assert!(reg.end_owner_render(owner).is_empty());
        assert_eq!(reg.live_subscriptions(), 2);

        // Next render emits only the first handler.
        reg.begin_owner_render(owner);
        reg.register(owner, None, "click", 0, Box::new(|_| {}));
        let released = reg.end_owner_render(owner);
        assert_eq!(released.len(), 1);
        assert_eq!(reg.live_subscriptions(), 1);
    }

    #[test]
    fn remove_owner_releases_everything() {
        let owner = owner();
        let mut reg = HandlerRegistry::new();
        reg.begin_owner_render(owner);
        reg.register(owner, None, "click", 0, Box::new(|_| {}));
        reg.register(owner, Some("r1"), "blur", 0, Box::new(|_| {}));

        let released = reg.remove_owner(owner);
        assert_eq!(released.len(), 2);
        assert_eq!(reg.live_subscriptions(), 0);

        let err = reg
            .dispatch(&HandlerId::from("r1:blur"), EventPayload::default())
            .unwrap_err();
        assert!(matches!(err, HandlerError::Unknown(_)));
    }

    #[test]
    fn dispatch_without_delivery_queues_the_payload() {
        let owner = owner();
        let mut reg = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        reg.begin_owner_render(owner);
        let (id, created) = reg.register(owner, None, "click", 0, counting_callback(hits.clone()));
        assert!(created);

        reg.dispatch(&id, EventPayload::new("click", "{}")).unwrap();
        reg.dispatch(&id, EventPayload::new("click", "{}")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(reg.deliver_pending(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
