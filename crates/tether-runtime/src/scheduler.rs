#![forbid(unsafe_code)]

//! Concurrent render scheduler.
//!
//! Renders a batch of dirty components with maximum parallelism subject to
//! one ordering rule: a node never starts rendering before its nearest
//! in-batch ancestor has completed. Siblings carry no ordering guarantee
//! and may render concurrently in any relative order.
//!
//! # Algorithm
//!
//! 1. Snapshot the batch: pending set plus a child → nearest-in-batch-
//!    ancestor map, built once per call and discarded afterward.
//! 2. Seed the ready queue with every node that has no in-batch ancestor.
//! 3. A fixed pool of workers pulls from the queue. On each completion,
//!    scan the waiting nodes for an exact ancestor match and promote the
//!    newly-ready ones.
//! 4. When the pending set empties, the queue closes and the workers exit.
//!
//! # Failure modes
//!
//! | Condition | Behavior | Rationale |
//! |-----------|----------|-----------|
//! | Render returns an error | Node marked complete, fault recorded | Siblings must not starve |
//! | Render panics | Caught, node marked complete, fault recorded | One bad component cannot deadlock the pool |
//! | `stop()` mid-batch | Workers finish their current node, rest abandoned | Cooperative cancellation only |
//!
//! Faults are collected and surfaced in the [`BatchReport`] once the batch
//! drains; the batch itself never aborts early.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tether_core::context::RenderContext;
use tether_core::handlers::{HandlerId, SharedRegistry};
use tether_core::tree::{ComponentId, SharedTree};

use crate::reconcile::{Reconciler, RenderOutput};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size. Zero is clamped to one.
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// How a component render failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The render returned an error value.
    Error,
    /// The render panicked; the panic was contained.
    Panic,
}

/// One contained render failure.
#[derive(Debug, Clone)]
pub struct RenderFault {
    /// The node whose render failed.
    pub node: ComponentId,
    pub kind: FaultKind,
    /// The error's display text or the panic payload.
    pub message: String,
}

impl fmt::Display for RenderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultKind::Error => write!(f, "render of {} failed: {}", self.node, self.message),
            FaultKind::Panic => write!(f, "render of {} panicked: {}", self.node, self.message),
        }
    }
}

/// Everything one scheduling batch produced.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Successful outputs, in completion order.
    pub outputs: Vec<(ComponentId, RenderOutput)>,
    /// Contained failures, surfaced after the batch drained.
    pub faults: Vec<RenderFault>,
    /// Nodes abandoned by a `stop()` — never rendered, still dirty-cleared
    /// only if their render had already begun.
    pub abandoned: Vec<ComponentId>,
    /// Handler ids whose subscriptions were created during the batch.
    pub subscribed: Vec<HandlerId>,
    /// Handler ids released by end-of-render sweeps during the batch.
    pub released: Vec<HandlerId>,
}

impl BatchReport {
    /// Number of components rendered successfully.
    pub fn rendered(&self) -> usize {
        self.outputs.len()
    }
}

struct BatchState {
    ready: VecDeque<ComponentId>,
    /// (node, nearest in-batch ancestor) pairs not yet promoted.
    waiting: Vec<(ComponentId, ComponentId)>,
    /// Nodes not yet completed (includes in-flight).
    pending: HashSet<ComponentId>,
    closed: bool,
    report: BatchReport,
}

struct Shared {
    state: Mutex<Option<BatchState>>,
    cvar: Condvar,
    stop: AtomicBool,
}

/// Fixed-pool scheduler for component render batches.
pub struct RenderScheduler {
    config: SchedulerConfig,
    shared: Arc<Shared>,
}

impl RenderScheduler {
    /// Create a scheduler with the given configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(None),
                cvar: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
        }
    }

    /// Request cooperative cancellation of the in-flight batch.
    ///
    /// Workers finish the node they are on and exit without draining the
    /// queue; unprocessed nodes are reported as abandoned. The next
    /// `schedule_components` call starts from a clean batch.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.cvar.notify_all();
    }

    /// Render every node in `nodes` exactly once, blocking until the batch
    /// drains (or a `stop()` abandons its remainder).
    pub fn schedule_components(
        &self,
        tree: &SharedTree,
        handlers: &SharedRegistry,
        reconciler: &dyn Reconciler,
        nodes: &[ComponentId],
    ) -> BatchReport {
        let span = tracing::debug_span!("schedule_components", batch = nodes.len());
        let _guard = span.enter();

        // A fresh batch clears any stop left over from the previous one.
        self.shared.stop.store(false, Ordering::SeqCst);

        let batch: HashSet<ComponentId> = nodes.iter().copied().collect();
        if batch.is_empty() {
            return BatchReport::default();
        }

        let ancestor_of = {
            let mut tree = tree.lock().expect("tree lock poisoned");
            tree.clear_pass_flags();
            batch_ancestors(&tree, &batch)
        };

        let mut ready = VecDeque::new();
        let mut waiting = Vec::new();
        for &node in &batch {
            match ancestor_of.get(&node) {
                Some(&ancestor) => waiting.push((node, ancestor)),
                None => ready.push_back(node),
            }
        }

        {
            let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
            *state = Some(BatchState {
                ready,
                waiting,
                pending: batch,
                closed: false,
                report: BatchReport::default(),
            });
        }

        let workers = self.config.workers.max(1).min(nodes.len());
        thread::scope(|scope| {
            for _ in 0..workers {
                let shared = Arc::clone(&self.shared);
                let tree = Arc::clone(tree);
                let handlers = Arc::clone(handlers);
                scope.spawn(move || worker_loop(&shared, &tree, &handlers, reconciler));
            }
        });

        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        let batch = state.take().expect("batch state present at drain");
        let mut report = batch.report;
        report
            .abandoned
            .extend(batch.waiting.iter().map(|(node, _)| *node));
        report.abandoned.extend(batch.ready.iter().copied());
        if !report.abandoned.is_empty() {
            tracing::debug!(
                abandoned = report.abandoned.len(),
                "batch stopped before draining"
            );
        }
        report
    }
}

/// Map each batch node to its nearest ancestor that is also in the batch.
fn batch_ancestors(
    tree: &tether_core::tree::ComponentTree,
    batch: &HashSet<ComponentId>,
) -> HashMap<ComponentId, ComponentId> {
    let mut map = HashMap::new();
    for &node in batch {
        let mut cursor = tree.parent_of(node);
        while let Some(parent) = cursor {
            if batch.contains(&parent) {
                map.insert(node, parent);
                break;
            }
            cursor = tree.parent_of(parent);
        }
    }
    map
}

fn worker_loop(
    shared: &Shared,
    tree: &SharedTree,
    handlers: &SharedRegistry,
    reconciler: &dyn Reconciler,
) {
    loop {
        let id = {
            let mut guard = shared.state.lock().expect("scheduler lock poisoned");
            loop {
                if shared.stop.load(Ordering::SeqCst) {
                    if let Some(state) = guard.as_mut() {
                        state.closed = true;
                    }
                    shared.cvar.notify_all();
                    return;
                }
                let state = guard.as_mut().expect("batch state present");
                if let Some(id) = state.ready.pop_front() {
                    break id;
                }
                if state.closed || state.pending.is_empty() {
                    return;
                }
                guard = shared.cvar.wait(guard).expect("scheduler lock poisoned");
            }
        };

        let outcome = render_one(tree, handlers, reconciler, id);

        let mut guard = shared.state.lock().expect("scheduler lock poisoned");
        let state = guard.as_mut().expect("batch state present");
        state.pending.remove(&id);
        match outcome {
            NodeOutcome::Rendered(output, subscribed, released) => {
                state.report.outputs.push((id, output));
                state.report.subscribed.extend(subscribed);
                state.report.released.extend(released);
            }
            NodeOutcome::Fault(fault) => state.report.faults.push(fault),
        }

        // Promote children whose ancestor just completed (fault included:
        // complete is complete, or the batch would deadlock).
        let mut index = 0;
        while index < state.waiting.len() {
            if state.waiting[index].1 == id {
                let (node, _) = state.waiting.swap_remove(index);
                state.ready.push_back(node);
            } else {
                index += 1;
            }
        }

        if state.pending.is_empty() {
            state.closed = true;
        }
        let stopped = shared.stop.load(Ordering::SeqCst);
        if stopped {
            state.closed = true;
        }
        shared.cvar.notify_all();
        drop(guard);

        if stopped {
            return;
        }
    }
}

enum NodeOutcome {
    Rendered(RenderOutput, Vec<HandlerId>, Vec<HandlerId>),
    Fault(RenderFault),
}

fn render_one(
    tree: &SharedTree,
    handlers: &SharedRegistry,
    reconciler: &dyn Reconciler,
    id: ComponentId,
) -> NodeOutcome {
    let span = tracing::trace_span!("render_component", node = %id);
    let _guard = span.enter();

    let mut ctx = RenderContext::begin(Arc::clone(tree), Arc::clone(handlers), id);
    let result = panic::catch_unwind(AssertUnwindSafe(|| reconciler.render(&mut ctx)));
    match result {
        Ok(Ok(output)) => {
            let sweep = ctx.finish();
            tree.lock().expect("tree lock poisoned").mark_rendered(id);
            NodeOutcome::Rendered(output, sweep.subscribed, sweep.released)
        }
        Ok(Err(error)) => {
            ctx.abandon();
            NodeOutcome::Fault(RenderFault {
                node: id,
                kind: FaultKind::Error,
                message: error.to_string(),
            })
        }
        Err(payload) => {
            ctx.abandon();
            NodeOutcome::Fault(RenderFault {
                node: id,
                kind: FaultKind::Panic,
                message: panic_message(payload.as_ref()),
            })
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{RenderError, ViewSnapshot};
    use std::sync::atomic::AtomicUsize;
    use tether_core::handlers::HandlerRegistry;
    use tether_core::tree::{ComponentTree, NodeIdentity, NodeFlags};

    /// Renders successfully, counting invocations per node.
    struct CountingReconciler {
        renders: Mutex<Vec<ComponentId>>,
    }

    impl CountingReconciler {
        fn new() -> Self {
            Self {
                renders: Mutex::new(Vec::new()),
            }
        }
    }

    impl Reconciler for CountingReconciler {
        fn render(&self, ctx: &mut RenderContext) -> Result<RenderOutput, RenderError> {
            self.renders.lock().unwrap().push(ctx.node());
            Ok(RenderOutput::empty())
        }

        fn snapshot(&self, _: &SharedTree, _: &SharedRegistry) -> ViewSnapshot {
            ViewSnapshot::default()
        }
    }

    fn fixture(n: usize) -> (SharedTree, SharedRegistry, Vec<ComponentId>) {
        let tree = ComponentTree::shared();
        let handlers = HandlerRegistry::shared();
        let nodes = {
            let mut guard = tree.lock().unwrap();
            (0..n)
                .map(|i| guard.mount(None, NodeIdentity::anonymous(i as u64)))
                .collect()
        };
        (tree, handlers, nodes)
    }

    #[test]
    fn single_worker_renders_each_node_exactly_once() {
        let (tree, handlers, nodes) = fixture(16);
        let reconciler = CountingReconciler::new();
        let scheduler = RenderScheduler::new(SchedulerConfig { workers: 1 });

        let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &nodes);
        assert_eq!(report.rendered(), 16);
        assert!(report.faults.is_empty());
        assert!(report.abandoned.is_empty());

        let mut rendered = reconciler.renders.lock().unwrap().clone();
        rendered.sort();
        let mut expected = nodes.clone();
        expected.sort();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let (tree, handlers, _) = fixture(0);
        let reconciler = CountingReconciler::new();
        let scheduler = RenderScheduler::new(SchedulerConfig::default());
        let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &[]);
        assert_eq!(report.rendered(), 0);
    }

    #[test]
    fn duplicate_nodes_render_once() {
        let (tree, handlers, nodes) = fixture(1);
        let reconciler = CountingReconciler::new();
        let scheduler = RenderScheduler::new(SchedulerConfig { workers: 4 });
        let doubled = vec![nodes[0], nodes[0], nodes[0]];
        let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &doubled);
        assert_eq!(report.rendered(), 1);
    }

    #[test]
    fn faulting_node_does_not_deadlock_or_starve_siblings() {
        struct FaultyReconciler {
            poison: ComponentId,
        }
        impl Reconciler for FaultyReconciler {
            fn render(&self, ctx: &mut RenderContext) -> Result<RenderOutput, RenderError> {
                if ctx.node() == self.poison {
                    return Err(RenderError::new("boom"));
                }
                Ok(RenderOutput::empty())
            }
            fn snapshot(&self, _: &SharedTree, _: &SharedRegistry) -> ViewSnapshot {
                ViewSnapshot::default()
            }
        }

        let (tree, handlers, nodes) = fixture(8);
        let reconciler = FaultyReconciler { poison: nodes[3] };
        let scheduler = RenderScheduler::new(SchedulerConfig { workers: 2 });
        let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &nodes);
        assert_eq!(report.rendered(), 7);
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].node, nodes[3]);
        assert_eq!(report.faults[0].kind, FaultKind::Error);
    }

    #[test]
    fn panicking_child_still_completes_so_descendants_promote() {
        struct PanickyReconciler {
            poison: ComponentId,
        }
        impl Reconciler for PanickyReconciler {
            fn render(&self, ctx: &mut RenderContext) -> Result<RenderOutput, RenderError> {
                if ctx.node() == self.poison {
                    panic!("render exploded");
                }
                Ok(RenderOutput::empty())
            }
            fn snapshot(&self, _: &SharedTree, _: &SharedRegistry) -> ViewSnapshot {
                ViewSnapshot::default()
            }
        }

        let tree = ComponentTree::shared();
        let handlers = HandlerRegistry::shared();
        let (parent, child) = {
            let mut guard = tree.lock().unwrap();
            let parent = guard.mount(None, NodeIdentity::anonymous(1));
            let child = guard.mount(Some(parent), NodeIdentity::anonymous(2));
            (parent, child)
        };

        let reconciler = PanickyReconciler { poison: parent };
        let scheduler = RenderScheduler::new(SchedulerConfig { workers: 2 });
        let report =
            scheduler.schedule_components(&tree, &handlers, &reconciler, &[parent, child]);

        // The parent's fault is contained and the child still renders.
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].kind, FaultKind::Panic);
        assert_eq!(report.rendered(), 1);
        assert_eq!(report.outputs[0].0, child);
        // Faulted parent keeps its last-good render status.
        assert!(!tree.lock().unwrap().flags(parent).contains(NodeFlags::RENDERED));
    }

    #[test]
    fn stop_abandons_unprocessed_nodes() {
        struct SlowReconciler {
            scheduler_stop: Arc<dyn Fn() + Send + Sync>,
            first: AtomicUsize,
        }
        impl Reconciler for SlowReconciler {
            fn render(&self, _: &mut RenderContext) -> Result<RenderOutput, RenderError> {
                // The first render requests a stop; the rest of the queue
                // must be abandoned, not rendered.
                if self.first.fetch_add(1, Ordering::SeqCst) == 0 {
                    (self.scheduler_stop)();
                }
                Ok(RenderOutput::empty())
            }
            fn snapshot(&self, _: &SharedTree, _: &SharedRegistry) -> ViewSnapshot {
                ViewSnapshot::default()
            }
        }

        let (tree, handlers, nodes) = fixture(6);
        let scheduler = Arc::new(RenderScheduler::new(SchedulerConfig { workers: 1 }));
        let stop_handle = Arc::clone(&scheduler);
        let reconciler = SlowReconciler {
            scheduler_stop: Arc::new(move || stop_handle.stop()),
            first: AtomicUsize::new(0),
        };

        let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &nodes);
        assert_eq!(report.rendered(), 1);
        assert_eq!(report.abandoned.len(), 5);

        // Re-invocation after stop starts from a clean batch.
        let counting = CountingReconciler::new();
        let report = scheduler.schedule_components(&tree, &handlers, &counting, &nodes);
        assert_eq!(report.rendered(), 6);
        assert!(report.abandoned.is_empty());
    }
}
