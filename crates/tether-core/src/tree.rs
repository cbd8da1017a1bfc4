#![forbid(unsafe_code)]

//! Component tree: a generational arena of stateful render units.
//!
//! Nodes are addressed by [`ComponentId`] handles (slot index + generation)
//! rather than references, so parent back-edges are plain lookup keys and
//! never owning pointers. A slot freed by the sweep bumps its generation,
//! invalidating any stale handle that still points at it.
//!
//! # Identity
//!
//! A node's identity is its (parent, call site, key) triple. The first
//! render that encounters an identity creates the node; later passes reuse
//! it (hook state and all) while the identity is stable; the sweep frees
//! nodes the current tree no longer references.
//!
//! # Ownership during a render batch
//!
//! The tree is shared behind a mutex ([`SharedTree`]). Scheduler workers
//! hold the lock only for short node-state accesses, never across a
//! component render; parent-before-child ordering guarantees a node and
//! its ancestors are never rendered concurrently.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

/// Shared handle to a component tree.
pub type SharedTree = Arc<Mutex<ComponentTree>>;

bitflags! {
    /// Per-node state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// State changed since the node's last render.
        const DIRTY = 1 << 0;
        /// Rendered during the current pass.
        const RENDERED = 1 << 1;
        /// Mounted into the tree (cleared only by the sweep).
        const MOUNTED = 1 << 2;
    }
}

/// Stable handle to a component node.
///
/// The generation disambiguates reused slots: a handle from before a sweep
/// never resolves to the slot's new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    index: u32,
    generation: u32,
}

impl ComponentId {
    /// Slot index within the arena.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot this handle was issued for.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}.{}", self.index, self.generation)
    }
}

/// What makes a component call site "the same component" across passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    /// Opaque call-site discriminator (e.g. a template position hash).
    pub call_site: u64,
    /// Explicit key for list rendering, if the author supplied one.
    pub key: Option<String>,
}

impl NodeIdentity {
    /// Identity for an unkeyed call site.
    pub fn anonymous(call_site: u64) -> Self {
        Self {
            call_site,
            key: None,
        }
    }

    /// Identity for a keyed call site.
    pub fn keyed(call_site: u64, key: impl Into<String>) -> Self {
        Self {
            call_site,
            key: Some(key.into()),
        }
    }
}

/// One stateful render unit in the tree.
pub struct ComponentNode {
    parent: Option<ComponentId>,
    identity: NodeIdentity,
    flags: NodeFlags,
    prev_props: Option<Vec<u8>>,
    hooks: Vec<Box<dyn Any + Send>>,
    hook_cursor: usize,
    handler_cursor: u32,
}

impl fmt::Debug for ComponentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentNode")
            .field("parent", &self.parent)
            .field("identity", &self.identity)
            .field("flags", &self.flags)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl ComponentNode {
    fn new(parent: Option<ComponentId>, identity: NodeIdentity) -> Self {
        Self {
            parent,
            identity,
            flags: NodeFlags::MOUNTED | NodeFlags::DIRTY,
            prev_props: None,
            hooks: Vec::new(),
            hook_cursor: 0,
            handler_cursor: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<ComponentNode>,
}

/// Arena of component nodes with (parent, identity) lookup.
#[derive(Debug, Default)]
pub struct ComponentTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    lookup: HashMap<(Option<ComponentId>, NodeIdentity), ComponentId>,
}

impl ComponentTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty tree behind its shared handle.
    pub fn shared() -> SharedTree {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Mount (or re-encounter) the component at `identity` under `parent`.
    ///
    /// Returns the existing node's handle when the identity is already
    /// mounted; otherwise allocates a slot, marks the new node dirty, and
    /// returns the fresh handle.
    pub fn mount(&mut self, parent: Option<ComponentId>, identity: NodeIdentity) -> ComponentId {
        if let Some(parent) = parent {
            debug_assert!(self.contains(parent), "parent handle must be live");
        }
        let lookup_key = (parent, identity.clone());
        if let Some(&id) = self.lookup.get(&lookup_key) {
            if self.contains(id) {
                return id;
            }
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.node = Some(ComponentNode::new(parent, identity));
        let id = ComponentId {
            index,
            generation: slot.generation,
        };
        self.lookup.insert(lookup_key, id);
        id
    }

    fn node(&self, id: ComponentId) -> Option<&ComponentNode> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: ComponentId) -> Option<&mut ComponentNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// True when `id` resolves to a live node.
    pub fn contains(&self, id: ComponentId) -> bool {
        self.node(id).is_some()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    /// True when no node is mounted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parent handle of `id`, if any.
    pub fn parent_of(&self, id: ComponentId) -> Option<ComponentId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// Identity `id` was mounted under.
    pub fn identity_of(&self, id: ComponentId) -> Option<&NodeIdentity> {
        self.node(id).map(|n| &n.identity)
    }

    /// True when `ancestor` appears on `id`'s parent chain.
    pub fn is_ancestor(&self, ancestor: ComponentId, id: ComponentId) -> bool {
        let mut cursor = self.parent_of(id);
        while let Some(parent) = cursor {
            if parent == ancestor {
                return true;
            }
            cursor = self.parent_of(parent);
        }
        false
    }

    /// Flags of `id`, empty for a dead handle.
    pub fn flags(&self, id: ComponentId) -> NodeFlags {
        self.node(id).map_or(NodeFlags::empty(), |n| n.flags)
    }

    /// Mark `id` dirty. Returns false for a dead handle.
    pub fn mark_dirty(&mut self, id: ComponentId) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.flags.insert(NodeFlags::DIRTY);
                true
            }
            None => false,
        }
    }

    /// All dirty nodes in ascending arena order (parents precede children
    /// since a parent is always allocated before its children).
    pub fn dirty_nodes(&self) -> Vec<ComponentId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let node = slot.node.as_ref()?;
                node.flags.contains(NodeFlags::DIRTY).then_some(ComponentId {
                    index: index as u32,
                    generation: slot.generation,
                })
            })
            .collect()
    }

    /// Clear every node's `RENDERED` flag before a new pass.
    pub fn clear_pass_flags(&mut self) {
        for slot in &mut self.slots {
            if let Some(node) = slot.node.as_mut() {
                node.flags.remove(NodeFlags::RENDERED);
            }
        }
    }

    /// Prepare `id` for a render: clear its dirty flag and reset the hook
    /// and handler cursors. Returns false for a dead handle.
    pub fn begin_render(&mut self, id: ComponentId) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.flags.remove(NodeFlags::DIRTY);
                node.hook_cursor = 0;
                node.handler_cursor = 0;
                true
            }
            None => false,
        }
    }

    /// Record that `id` completed its render this pass.
    pub fn mark_rendered(&mut self, id: ComponentId) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.flags.insert(NodeFlags::RENDERED);
                true
            }
            None => false,
        }
    }

    /// Previous props snapshot for `id`.
    pub fn prev_props(&self, id: ComponentId) -> Option<&[u8]> {
        self.node(id).and_then(|n| n.prev_props.as_deref())
    }

    /// Replace the previous props snapshot for `id`.
    pub fn set_prev_props(&mut self, id: ComponentId, props: Vec<u8>) {
        if let Some(node) = self.node_mut(id) {
            node.prev_props = Some(props);
        }
    }

    /// Next positional handler index for `id` within the current render.
    pub fn next_handler_index(&mut self, id: ComponentId) -> u32 {
        let node = self
            .node_mut(id)
            .expect("handler index requested for dead node");
        let index = node.handler_cursor;
        node.handler_cursor += 1;
        index
    }

    /// Next hook slot index for `id` within the current render.
    pub fn next_hook_index(&mut self, id: ComponentId) -> usize {
        let node = self
            .node_mut(id)
            .expect("hook slot requested for dead node");
        let index = node.hook_cursor;
        node.hook_cursor += 1;
        index
    }

    /// Read hook slot `slot` of `id`, initializing it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the slot holds a different type than `T` — hook order must
    /// be stable across renders of the same node.
    pub fn hook_get_or_init<T: Clone + Send + 'static>(
        &mut self,
        id: ComponentId,
        slot: usize,
        init: impl FnOnce() -> T,
    ) -> T {
        let node = self.node_mut(id).expect("hook access on dead node");
        if node.hooks.len() <= slot {
            debug_assert_eq!(node.hooks.len(), slot, "hook slots fill in order");
            node.hooks.push(Box::new(init()));
        }
        node.hooks[slot]
            .downcast_ref::<T>()
            .expect("hook slot type changed between renders")
            .clone()
    }

    /// Overwrite hook slot `slot` of `id` and mark the node dirty.
    pub fn hook_set<T: Send + 'static>(&mut self, id: ComponentId, slot: usize, value: T) {
        if let Some(node) = self.node_mut(id) {
            if node.hooks.len() <= slot {
                return;
            }
            node.hooks[slot] = Box::new(value);
            node.flags.insert(NodeFlags::DIRTY);
        }
    }

    /// Free every node not in `referenced` (nor an ancestor of one).
    ///
    /// Returns the handles that were freed so callers can release
    /// per-component resources (handler registrations, subscriptions).
    pub fn sweep(&mut self, referenced: &[ComponentId]) -> Vec<ComponentId> {
        let mut live: std::collections::HashSet<ComponentId> = std::collections::HashSet::new();
        for &id in referenced {
            if !self.contains(id) {
                continue;
            }
            live.insert(id);
            let mut cursor = self.parent_of(id);
            while let Some(parent) = cursor {
                live.insert(parent);
                cursor = self.parent_of(parent);
            }
        }
        let mut removed = Vec::new();
        for index in 0..self.slots.len() {
            let generation = self.slots[index].generation;
            let id = ComponentId {
                index: index as u32,
                generation,
            };
            if self.slots[index].node.is_some() && !live.contains(&id) {
                self.slots[index].node = None;
                self.slots[index].generation += 1;
                self.free.push(index as u32);
                removed.push(id);
            }
        }
        let slots = &self.slots;
        self.lookup
            .retain(|_, id| slots[id.index as usize].generation == id.generation);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tree_with_chain() -> (ComponentTree, ComponentId, ComponentId, ComponentId) {
        let mut tree = ComponentTree::new();
        let root = tree.mount(None, NodeIdentity::anonymous(1));
        let mid = tree.mount(Some(root), NodeIdentity::anonymous(2));
        let leaf = tree.mount(Some(mid), NodeIdentity::keyed(3, "a"));
        (tree, root, mid, leaf)
    }

    #[test]
    fn mount_reuses_stable_identity() {
        let mut tree = ComponentTree::new();
        let a = tree.mount(None, NodeIdentity::keyed(7, "x"));
        let b = tree.mount(None, NodeIdentity::keyed(7, "x"));
        assert_eq!(a, b);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.identity_of(a), Some(&NodeIdentity::keyed(7, "x")));

        // A different key at the same call site is a different node.
        let c = tree.mount(None, NodeIdentity::keyed(7, "y"));
        assert_ne!(a, c);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn new_nodes_start_dirty() {
        let (tree, root, mid, leaf) = tree_with_chain();
        assert_eq!(tree.dirty_nodes(), vec![root, mid, leaf]);
    }

    #[test]
    fn begin_render_clears_dirty_and_resets_cursors() {
        let (mut tree, root, ..) = tree_with_chain();
        tree.next_handler_index(root);
        tree.next_handler_index(root);
        assert!(tree.begin_render(root));
        assert!(!tree.flags(root).contains(NodeFlags::DIRTY));
        assert_eq!(tree.next_handler_index(root), 0);
    }

    #[test]
    fn ancestor_chain_is_visible() {
        let (tree, root, mid, leaf) = tree_with_chain();
        assert!(tree.is_ancestor(root, leaf));
        assert!(tree.is_ancestor(mid, leaf));
        assert!(!tree.is_ancestor(leaf, root));
    }

    #[test]
    fn sweep_frees_unreferenced_and_invalidates_handles() {
        let (mut tree, root, mid, leaf) = tree_with_chain();
        let orphan = tree.mount(Some(root), NodeIdentity::anonymous(9));

        let removed = tree.sweep(&[leaf]);
        assert_eq!(removed, vec![orphan]);
        assert!(tree.contains(root) && tree.contains(mid) && tree.contains(leaf));
        assert!(!tree.contains(orphan));

        // The freed slot reuses its index under a new generation.
        let fresh = tree.mount(Some(root), NodeIdentity::anonymous(9));
        assert_eq!(fresh.index(), orphan.index());
        assert_ne!(fresh.generation(), orphan.generation());
    }

    #[test]
    fn hook_slots_persist_across_renders() {
        let (mut tree, root, ..) = tree_with_chain();
        tree.begin_render(root);
        let slot = tree.next_hook_index(root);
        let value: u32 = tree.hook_get_or_init(root, slot, || 5);
        assert_eq!(value, 5);

        tree.hook_set(root, slot, 9u32);
        assert!(tree.flags(root).contains(NodeFlags::DIRTY));

        tree.begin_render(root);
        let slot = tree.next_hook_index(root);
        let value: u32 = tree.hook_get_or_init(root, slot, || 5);
        assert_eq!(value, 9);
    }
}
