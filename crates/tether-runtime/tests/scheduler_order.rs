//! Ordering and liveness properties of the render scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tether_core::context::RenderContext;
use tether_core::handlers::{HandlerRegistry, SharedRegistry};
use tether_core::tree::{ComponentId, ComponentTree, NodeIdentity, SharedTree};
use tether_runtime::{Reconciler, RenderError, RenderOutput, RenderScheduler, SchedulerConfig, ViewSnapshot};

/// Records a (start, end) stamp per rendered node.
struct StampingReconciler {
    stamps: Mutex<HashMap<ComponentId, (Instant, Instant)>>,
    dwell: Duration,
}

impl StampingReconciler {
    fn new(dwell: Duration) -> Self {
        Self {
            stamps: Mutex::new(HashMap::new()),
            dwell,
        }
    }
}

impl Reconciler for StampingReconciler {
    fn render(&self, ctx: &mut RenderContext) -> Result<RenderOutput, RenderError> {
        let start = Instant::now();
        thread::sleep(self.dwell);
        let end = Instant::now();
        self.stamps.lock().unwrap().insert(ctx.node(), (start, end));
        Ok(RenderOutput::empty())
    }

    fn snapshot(&self, _: &SharedTree, _: &SharedRegistry) -> ViewSnapshot {
        ViewSnapshot::default()
    }
}

/// Three-level tree: one root, `fanout` children, `fanout` grandchildren
/// under each child.
fn build_tree(fanout: u64) -> (SharedTree, Vec<ComponentId>) {
    let tree = ComponentTree::shared();
    let mut all = Vec::new();
    {
        let mut guard = tree.lock().unwrap();
        let root = guard.mount(None, NodeIdentity::anonymous(0));
        all.push(root);
        for c in 0..fanout {
            let child = guard.mount(Some(root), NodeIdentity::anonymous(100 + c));
            all.push(child);
            for g in 0..fanout {
                let grandchild =
                    guard.mount(Some(child), NodeIdentity::anonymous(1000 + c * 100 + g));
                all.push(grandchild);
            }
        }
    }
    (tree, all)
}

#[test]
fn no_child_starts_before_its_parent_ends() {
    let (tree, all) = build_tree(3);
    let handlers = HandlerRegistry::shared();
    let reconciler = StampingReconciler::new(Duration::from_millis(2));
    let scheduler = RenderScheduler::new(SchedulerConfig { workers: 4 });

    let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &all);
    assert_eq!(report.rendered(), all.len());

    let stamps = reconciler.stamps.lock().unwrap();
    let tree = tree.lock().unwrap();
    for &node in &all {
        let Some(parent) = tree.parent_of(node) else {
            continue;
        };
        let (_, parent_end) = stamps[&parent];
        let (child_start, _) = stamps[&node];
        assert!(
            parent_end <= child_start,
            "{parent} must finish before {node} starts"
        );
    }
}

#[test]
fn parent_order_holds_across_repeated_batches() {
    let (tree, all) = build_tree(2);
    let handlers = HandlerRegistry::shared();
    let scheduler = RenderScheduler::new(SchedulerConfig { workers: 8 });

    for _ in 0..20 {
        let reconciler = StampingReconciler::new(Duration::from_micros(200));
        {
            let mut guard = tree.lock().unwrap();
            for &node in &all {
                guard.mark_dirty(node);
            }
        }
        let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &all);
        assert_eq!(report.rendered(), all.len());

        let stamps = reconciler.stamps.lock().unwrap();
        let guard = tree.lock().unwrap();
        for &node in &all {
            if let Some(parent) = guard.parent_of(node) {
                assert!(stamps[&parent].1 <= stamps[&node].0);
            }
        }
    }
}

#[test]
fn single_worker_completes_independent_batch() {
    let tree = ComponentTree::shared();
    let handlers = HandlerRegistry::shared();
    let nodes: Vec<ComponentId> = {
        let mut guard = tree.lock().unwrap();
        (0..64)
            .map(|i| guard.mount(None, NodeIdentity::anonymous(i)))
            .collect()
    };
    let reconciler = StampingReconciler::new(Duration::ZERO);
    let scheduler = RenderScheduler::new(SchedulerConfig { workers: 1 });

    let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &nodes);
    assert_eq!(report.rendered(), 64);
    assert_eq!(reconciler.stamps.lock().unwrap().len(), 64);
}

#[test]
fn siblings_overlap_when_workers_allow_it() {
    // Not a strict guarantee, but with 8 dwelling siblings and 4 workers
    // at least one pair must overlap or the pool is serializing.
    let tree = ComponentTree::shared();
    let handlers = HandlerRegistry::shared();
    let nodes: Vec<ComponentId> = {
        let mut guard = tree.lock().unwrap();
        (0..8)
            .map(|i| guard.mount(None, NodeIdentity::anonymous(i)))
            .collect()
    };
    let reconciler = StampingReconciler::new(Duration::from_millis(20));
    let scheduler = RenderScheduler::new(SchedulerConfig { workers: 4 });
    scheduler.schedule_components(&tree, &handlers, &reconciler, &nodes);

    let stamps = reconciler.stamps.lock().unwrap();
    let mut overlapping = false;
    for &a in &nodes {
        for &b in &nodes {
            if a == b {
                continue;
            }
            let (a_start, a_end) = stamps[&a];
            let (b_start, _) = stamps[&b];
            if b_start >= a_start && b_start < a_end {
                overlapping = true;
            }
        }
    }
    assert!(overlapping, "independent siblings should render concurrently");
}

#[test]
fn a_timed_out_client_call_does_not_wedge_the_batch() {
    use tether_runtime::{ClientCallBridge, ClientCallError};

    /// One node blocks on a client call that never resolves; its siblings
    /// must render to completion regardless.
    struct BlockingReconciler {
        bridge: ClientCallBridge,
        blocker: ComponentId,
    }

    impl Reconciler for BlockingReconciler {
        fn render(&self, ctx: &mut RenderContext) -> Result<RenderOutput, RenderError> {
            if ctx.node() == self.blocker {
                let call = self.bridge.begin();
                let err = call.wait().expect_err("nobody resolves this call");
                assert!(matches!(err, ClientCallError::Timeout(_)));
                return Err(RenderError::new(err.to_string()));
            }
            Ok(RenderOutput::empty())
        }

        fn snapshot(&self, _: &SharedTree, _: &SharedRegistry) -> ViewSnapshot {
            ViewSnapshot::default()
        }
    }

    let tree = ComponentTree::shared();
    let handlers = HandlerRegistry::shared();
    let nodes: Vec<ComponentId> = {
        let mut guard = tree.lock().unwrap();
        (0..4)
            .map(|i| guard.mount(None, NodeIdentity::anonymous(i)))
            .collect()
    };
    let reconciler = BlockingReconciler {
        bridge: ClientCallBridge::new(Duration::from_millis(10)),
        blocker: nodes[0],
    };
    let scheduler = RenderScheduler::new(SchedulerConfig { workers: 2 });

    let report = scheduler.schedule_components(&tree, &handlers, &reconciler, &nodes);
    assert_eq!(report.rendered(), 3);
    assert_eq!(report.faults.len(), 1);
    assert_eq!(report.faults[0].node, nodes[0]);
}

/// The shared Arc<dyn Reconciler> path used by sessions must also hold the
/// ordering property; this guards the seam, not just the scheduler.
#[test]
fn ordering_holds_through_trait_object_dispatch() {
    let (tree, all) = build_tree(2);
    let handlers = HandlerRegistry::shared();
    let reconciler: Arc<StampingReconciler> =
        Arc::new(StampingReconciler::new(Duration::from_millis(1)));
    let scheduler = RenderScheduler::new(SchedulerConfig::default());

    let dyn_reconciler: &dyn Reconciler = reconciler.as_ref();
    let report = scheduler.schedule_components(&tree, &handlers, dyn_reconciler, &all);
    assert_eq!(report.rendered(), all.len());
}
