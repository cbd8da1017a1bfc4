#![forbid(unsafe_code)]

//! Session protocol engine: flush, dispatch, join/resume, ack.
//!
//! One `Session` per connected client. The engine is single-flow: every
//! session-mutating operation runs inside one per-session lock, so state
//! transitions are linearized even though rendering inside `flush` fans
//! out across scheduler workers.
//!
//! # State machine
//!
//! `Fresh` (no init ever sent) → `Initialized` (frames may be flowing).
//! There is no terminal state; a session ends when its TTL expires or the
//! registry tears it down.
//!
//! # Resume decision (join)
//!
//! | Condition | Answer |
//! |-----------|--------|
//! | Epoch mismatch, never initialized, or `ack < last_init_seq` | full Init |
//! | Replay range not covered by the buffer | full Init |
//! | Otherwise | Resume with buffered frames ≥ `max(ack+1, last_init_seq+1)` |
//!
//! The client and server never renegotiate beyond sequence numbers: the
//! buffer/ack/prune cycle bounds memory while still allowing replay after
//! short disconnects, and the Init fallback covers both first contact and
//! "buffer too small to cover the gap."

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether_core::event::EventPayload;
use tether_core::handlers::{HandlerId, HandlerRegistry, SharedRegistry};
use tether_core::tree::{ComponentId, ComponentTree, NodeIdentity, SharedTree};
use tether_proto::buffer::FrameBuffer;
use tether_proto::frame::{self, Frame, NavDirective, RenderMetrics};
use tether_proto::messages::{
    Diagnostic, DiagnosticKind, InitSnapshot, JoinResult, PubsubControl, ResumeReplay,
};

use crate::client_call::ClientCallBridge;
use crate::reconcile::Reconciler;
use crate::scheduler::{FaultKind, RenderFault, RenderScheduler, SchedulerConfig};
use crate::transport::{Transport, TransportError};

/// Where fault details go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagnosticsMode {
    /// Faults are also sent to the client as structured diagnostics.
    Development,
    /// Faults are swallowed after internal logging; rendering continues
    /// with the last-good view.
    #[default]
    Production,
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Replay buffer capacity in frames.
    pub frame_cap: usize,

    /// Inactivity duration after which the session is considered expired.
    pub ttl: Duration,

    /// Protocol epoch. A client presenting a different epoch on join gets
    /// a full snapshot, never a replay.
    pub version: u64,

    /// Fault routing; see [`DiagnosticsMode`].
    pub diagnostics: DiagnosticsMode,

    /// Deadline for blocking client calls issued from renders.
    pub client_call_timeout: Duration,

    /// Scheduler pool configuration.
    pub scheduler: SchedulerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_cap: 32,
            ttl: Duration::from_secs(300),
            version: 1,
            diagnostics: DiagnosticsMode::Production,
            client_call_timeout: Duration::from_secs(5),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Errors surfaced by session operations.
#[derive(Debug)]
pub enum SessionError {
    /// The event targeted an id with no live registration.
    UnknownHandler(HandlerId),
    /// The attached transport failed a send. The frame stays buffered and
    /// will be replayed on the next successful join/ack cycle.
    Transport(TransportError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::UnknownHandler(id) => write!(f, "unknown handler id {id}"),
            SessionError::Transport(e) => write!(f, "transport send failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::UnknownHandler(_) => None,
            SessionError::Transport(e) => Some(e),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e)
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// What a flush produced.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// Sequence of the emitted frame, or `None` when the pass changed
    /// nothing client-visible.
    pub seq: Option<u64>,
    /// Contained render failures from the pass.
    pub faults: Vec<RenderFault>,
}

/// What happened to a dispatched client event.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Duplicate or out-of-order `client_seq`; silently dropped.
    Stale,
    /// Handler invoked; the follow-up flush produced this outcome.
    Delivered(FlushOutcome),
}

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub next_seq: u64,
    pub last_init_seq: u64,
    pub last_ack: u64,
    pub client_seq: u64,
    pub buffered: usize,
    pub initialized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolState {
    Fresh,
    Initialized,
}

struct Inner {
    state: ProtocolState,
    next_seq: u64,
    last_init_seq: u64,
    last_ack: u64,
    client_seq: u64,
    buffer: FrameBuffer,
    chain: u64,
    pending_nav: Option<NavDirective>,
    transport: Option<Box<dyn Transport>>,
    last_touched: Instant,
}

impl Inner {
    fn check_invariants(&self) {
        debug_assert!(self.last_ack < self.next_seq, "last_ack <= next_seq - 1");
    }
}

/// Per-client protocol engine.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    tree: SharedTree,
    handlers: SharedRegistry,
    scheduler: RenderScheduler,
    reconciler: Arc<dyn Reconciler>,
    calls: ClientCallBridge,
    inner: Mutex<Inner>,
}

impl Session {
    /// Create a fresh session around an empty component tree.
    pub fn new(id: SessionId, config: SessionConfig, reconciler: Arc<dyn Reconciler>) -> Self {
        let scheduler = RenderScheduler::new(config.scheduler.clone());
        let calls = ClientCallBridge::new(config.client_call_timeout);
        let frame_cap = config.frame_cap;
        Self {
            id,
            config,
            tree: ComponentTree::shared(),
            handlers: HandlerRegistry::shared(),
            scheduler,
            reconciler,
            calls,
            inner: Mutex::new(Inner {
                state: ProtocolState::Fresh,
                next_seq: 1,
                last_init_seq: 0,
                last_ack: 0,
                client_seq: 0,
                buffer: FrameBuffer::new(frame_cap),
                chain: frame::CHAIN_SEED,
                pending_nav: None,
                transport: None,
                last_touched: Instant::now(),
            }),
        }
    }

    /// This session's identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Shared handle to the component tree.
    pub fn tree(&self) -> SharedTree {
        Arc::clone(&self.tree)
    }

    /// Shared handle to the handler registry.
    pub fn handlers(&self) -> SharedRegistry {
        Arc::clone(&self.handlers)
    }

    /// Bridge for renders that block on a client response.
    pub fn client_calls(&self) -> ClientCallBridge {
        self.calls.clone()
    }

    /// Mount a component; new nodes start dirty and render on the next
    /// flush.
    pub fn mount(&self, parent: Option<ComponentId>, identity: NodeIdentity) -> ComponentId {
        self.tree
            .lock()
            .expect("tree lock poisoned")
            .mount(parent, identity)
    }

    /// Mark a component dirty outside the hook path (e.g. server push).
    pub fn mark_dirty(&self, id: ComponentId) -> bool {
        self.tree
            .lock()
            .expect("tree lock poisoned")
            .mark_dirty(id)
    }

    /// Queue a navigation directive for the next flush.
    pub fn navigate(&self, nav: NavDirective) {
        let mut inner = self.lock_inner();
        inner.pending_nav = Some(nav);
        inner.last_touched = Instant::now();
    }

    /// Cooperatively cancel an in-flight render batch.
    pub fn stop_rendering(&self) {
        self.scheduler.stop();
    }

    /// Garbage-collect components no longer referenced by the current
    /// tree, releasing their handler subscriptions.
    ///
    /// `referenced` is the set of leaves the hosting layer still reaches;
    /// their ancestor chains are kept implicitly. Returns the number of
    /// components destroyed. Released handler ids are announced to the
    /// client so it can unbind listeners.
    pub fn sweep_components(&self, referenced: &[ComponentId]) -> usize {
        let mut inner = self.lock_inner();
        inner.last_touched = Instant::now();

        let removed = self
            .tree
            .lock()
            .expect("tree lock poisoned")
            .sweep(referenced);
        let mut released = Vec::new();
        {
            let mut registry = self.handlers.lock().expect("registry lock poisoned");
            for &owner in &removed {
                released.extend(registry.remove_owner(owner));
            }
        }
        self.announce_subscriptions(&mut inner, Vec::new(), released);
        removed.len()
    }

    /// Attach a transport; frames flow immediately, starting with the next
    /// flush. Replay of anything missed requires a client `join`.
    pub fn attach_transport(&self, transport: Box<dyn Transport>) {
        let mut inner = self.lock_inner();
        inner.transport = Some(transport);
        inner.last_touched = Instant::now();
    }

    /// Detach and return the transport, if one was attached. Frames keep
    /// accumulating in the buffer while detached.
    pub fn detach_transport(&self) -> Option<Box<dyn Transport>> {
        let mut inner = self.lock_inner();
        inner.last_touched = Instant::now();
        inner.transport.take()
    }

    /// True when the session has been idle longer than its TTL.
    pub fn expired(&self, now: Instant) -> bool {
        let inner = self.lock_inner();
        now.saturating_duration_since(inner.last_touched) > self.config.ttl
    }

    /// Monitoring counters.
    pub fn stats(&self) -> SessionStats {
        let inner = self.lock_inner();
        SessionStats {
            next_seq: inner.next_seq,
            last_init_seq: inner.last_init_seq,
            last_ack: inner.last_ack,
            client_seq: inner.client_seq,
            buffered: inner.buffer.len(),
            initialized: inner.state == ProtocolState::Initialized,
        }
    }

    /// Render all dirty components and emit at most one frame.
    ///
    /// Emits a frame only when the pass produced patch ops, effects, or a
    /// pending navigation; an empty pass consumes no sequence number.
    pub fn flush(&self) -> SessionResult<FlushOutcome> {
        let mut inner = self.lock_inner();
        self.flush_locked(&mut inner)
    }

    /// Apply a client event to its registered handler, then flush.
    ///
    /// A non-zero `client_seq` at or below the session's recorded value is
    /// a duplicate or out-of-order delivery and is silently dropped —
    /// retries stay idempotent.
    pub fn dispatch_event(
        &self,
        id: &HandlerId,
        payload: EventPayload,
        client_seq: u64,
    ) -> SessionResult<DispatchOutcome> {
        let mut inner = self.lock_inner();
        inner.last_touched = Instant::now();

        if client_seq != 0 && client_seq <= inner.client_seq {
            tracing::debug!(session = %self.id, handler = %id, client_seq, "stale event dropped");
            return Ok(DispatchOutcome::Stale);
        }
        if client_seq != 0 {
            inner.client_seq = client_seq;
        }

        {
            let mut registry = self.handlers.lock().expect("registry lock poisoned");
            if let Err(e) = registry.dispatch(id, payload) {
                tracing::debug!(session = %self.id, handler = %id, "dispatch to unknown handler");
                self.report_diagnostic(
                    &mut inner,
                    Diagnostic {
                        kind: DiagnosticKind::ClientCall,
                        message: e.to_string(),
                        component: None,
                    },
                );
                return Err(SessionError::UnknownHandler(id.clone()));
            }
            registry.deliver_pending();
        }

        let outcome = self.flush_locked(&mut inner)?;
        Ok(DispatchOutcome::Delivered(outcome))
    }

    /// The resume decision. See the module docs for the decision table.
    pub fn join(&self, client_version: u64, ack: u64) -> JoinResult {
        let mut inner = self.lock_inner();
        inner.last_touched = Instant::now();

        let ack = ack.min(inner.next_seq - 1);
        let fresh = inner.state == ProtocolState::Fresh;
        if client_version != self.config.version || fresh || ack < inner.last_init_seq {
            tracing::debug!(
                session = %self.id,
                client_version,
                ack,
                fresh,
                "join falls back to init"
            );
            return JoinResult::Init(self.send_init(&mut inner));
        }

        if ack > inner.last_ack {
            inner.last_ack = ack;
        }
        let last_ack = inner.last_ack;
        inner.buffer.prune_through(last_ack);
        inner.check_invariants();

        let from = (ack + 1).max(inner.last_init_seq + 1);
        let replay_needed = from < inner.next_seq;
        let covered = inner.buffer.oldest_seq().is_some_and(|oldest| oldest <= from);
        if replay_needed && !covered {
            tracing::debug!(session = %self.id, from, "replay range pruned, falling back to init");
            return JoinResult::Init(self.send_init(&mut inner));
        }

        let replay = ResumeReplay {
            ack_seq: ack,
            frames: inner.buffer.frames_from(from),
        };
        if let Some(transport) = inner.transport.as_mut() {
            if let Err(e) = transport.send_resume(&replay) {
                tracing::warn!(session = %self.id, error = %e, "resume send failed");
            }
        }
        tracing::debug!(session = %self.id, frames = replay.frames.len(), "resume");
        JoinResult::Resume(replay)
    }

    /// Advance the acknowledged sequence and prune the buffer.
    pub fn ack(&self, seq: u64) {
        let mut inner = self.lock_inner();
        inner.last_touched = Instant::now();
        let capped = seq.min(inner.next_seq - 1);
        if capped > inner.last_ack {
            inner.last_ack = capped;
        }
        let last_ack = inner.last_ack;
        inner.buffer.prune_through(last_ack);
        inner.check_invariants();
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("session lock poisoned")
    }

    fn flush_locked(&self, inner: &mut Inner) -> SessionResult<FlushOutcome> {
        let started = Instant::now();
        inner.last_touched = started;

        let dirty = {
            let tree = self.tree.lock().expect("tree lock poisoned");
            tree.dirty_nodes()
        };
        if dirty.is_empty() && inner.pending_nav.is_none() {
            return Ok(FlushOutcome::default());
        }

        let report = self.scheduler.schedule_components(
            &self.tree,
            &self.handlers,
            self.reconciler.as_ref(),
            &dirty,
        );

        let rendered = report.rendered() as u32;
        let mut outputs = report.outputs;
        // Sibling completion order is nondeterministic; arena order is
        // creation order, so sorting makes frame content reproducible.
        outputs.sort_by_key(|(id, _)| *id);

        let mut patches = Vec::new();
        let mut effects = Vec::new();
        let mut nav = inner.pending_nav.take();
        for (_, output) in outputs {
            patches.extend(output.patches);
            effects.extend(output.effects);
            if output.nav.is_some() {
                nav = output.nav;
            }
        }

        self.report_faults(inner, &report.faults);
        self.announce_subscriptions(inner, report.subscribed, report.released);

        if patches.is_empty() && effects.is_empty() && nav.is_none() {
            return Ok(FlushOutcome {
                seq: None,
                faults: report.faults,
            });
        }

        let seq = inner.next_seq;
        let metrics = RenderMetrics {
            render_micros: started.elapsed().as_micros() as u64,
            components_rendered: rendered,
            patch_count: patches.len() as u32,
            faults: report.faults.len() as u32,
        };
        let frame = Frame::sealed(seq, patches, effects, nav, metrics, inner.chain);
        inner.chain = frame.checksum;
        inner.next_seq += 1;
        inner.buffer.push(frame.clone());
        inner.check_invariants();
        tracing::debug!(session = %self.id, seq, patches = frame.patches.len(), "frame emitted");

        if let Some(transport) = inner.transport.as_mut() {
            transport.send_frame(&frame)?;
        }

        Ok(FlushOutcome {
            seq: Some(seq),
            faults: report.faults,
        })
    }

    /// Build, record, and send a full init snapshot.
    ///
    /// Renders any dirty components first so the snapshot (and the handler
    /// list) reflects current state; the pass's patches are superseded by
    /// the snapshot and discarded. Buffered frames at or below the init
    /// sequence can never be replayed again and are pruned.
    fn send_init(&self, inner: &mut Inner) -> InitSnapshot {
        let dirty = {
            let tree = self.tree.lock().expect("tree lock poisoned");
            tree.dirty_nodes()
        };
        if !dirty.is_empty() {
            let report = self.scheduler.schedule_components(
                &self.tree,
                &self.handlers,
                self.reconciler.as_ref(),
                &dirty,
            );
            self.report_faults(inner, &report.faults);
        }

        let view = self.reconciler.snapshot(&self.tree, &self.handlers);
        let handler_ids = self
            .handlers
            .lock()
            .expect("registry lock poisoned")
            .handler_ids();

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.last_init_seq = seq;
        inner.state = ProtocolState::Initialized;
        inner.chain = frame::chain_next(frame::CHAIN_SEED, seq, &[]);
        inner.buffer.prune_through(seq);
        inner.check_invariants();

        let snapshot = InitSnapshot {
            seq,
            version: self.config.version,
            statics: view.statics,
            dynamics: view.dynamics,
            handlers: handler_ids,
            location: view.location,
            chain: inner.chain,
        };
        tracing::debug!(session = %self.id, seq, "init snapshot");
        if let Some(transport) = inner.transport.as_mut() {
            if let Err(e) = transport.send_init(&snapshot) {
                tracing::warn!(session = %self.id, error = %e, "init send failed");
            }
        }
        snapshot
    }

    fn report_faults(&self, inner: &mut Inner, faults: &[RenderFault]) {
        for fault in faults {
            match self.config.diagnostics {
                DiagnosticsMode::Development => {
                    self.report_diagnostic(
                        inner,
                        Diagnostic {
                            kind: match fault.kind {
                                FaultKind::Error => DiagnosticKind::RenderError,
                                FaultKind::Panic => DiagnosticKind::RenderPanic,
                            },
                            message: fault.message.clone(),
                            component: Some(fault.node.to_string()),
                        },
                    );
                }
                DiagnosticsMode::Production => {
                    tracing::warn!(session = %self.id, fault = %fault, "render fault");
                }
            }
        }
    }

    fn report_diagnostic(&self, inner: &mut Inner, diagnostic: Diagnostic) {
        if self.config.diagnostics != DiagnosticsMode::Development {
            return;
        }
        if let Some(transport) = inner.transport.as_mut() {
            if let Err(e) = transport.send_error(&diagnostic) {
                tracing::warn!(session = %self.id, error = %e, "diagnostic send failed");
            }
        }
    }

    fn announce_subscriptions(
        &self,
        inner: &mut Inner,
        subscribed: Vec<HandlerId>,
        released: Vec<HandlerId>,
    ) {
        if subscribed.is_empty() && released.is_empty() {
            return;
        }
        let control = PubsubControl {
            subscribed: subscribed.iter().map(|id| id.to_string()).collect(),
            released: released.iter().map(|id| id.to_string()).collect(),
        };
        if let Some(transport) = inner.transport.as_mut() {
            if let Err(e) = transport.send_pubsub_control(&control) {
                tracing::warn!(session = %self.id, error = %e, "pubsub control send failed");
            }
        }
    }
}
