//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects cells, computations,
//! watchers and async handles. It owns the dependency graph and implements
//! the pull side of the push/pull algorithm.
//!
//! # How It Works
//!
//! 1. When a cell or computation is read, the runtime records the edge (and
//!    the version seen) on the current consumer.
//!
//! 2. When a cell's value changes, the scheduler marks every transitive
//!    dependent dirty. Nothing recomputes yet.
//!
//! 3. When a dirty computation is read, the runtime re-validates it: each
//!    recorded dependency is brought up to date in order, and the first one
//!    whose version moved triggers a recompute. If none moved, the node goes
//!    back to clean without running its body.
//!
//! 4. Watchers dirtied by a write are queued and settled once the write (or
//!    the outermost batch) completes, so listeners only see settled values.
//!
//! 5. Async handles woken by their futures are queued in an inbox and take
//!    their next step at the following flush, before watchers settle.
//!
//! # Thread Safety
//!
//! The runtime is thread-local and single-threaded by construction: every
//! primitive is `!Send`. Evaluation is cooperative and never preempted.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::context::{ReactiveContext, ScopeGuard};
use crate::error::{ReactiveError, Result};
use crate::graph::{Evaluate, InstallMode, Node, NodeId, NodeKind, NodeState, Scheduler, WatchTransition};

thread_local! {
    static RUNTIME: RuntimeState = RuntimeState::new();
}

/// Per-node storage for primitives created inside a computation (relays),
/// matched by call order within a run.
#[derive(Default)]
struct OwnedSlots {
    items: Vec<Rc<dyn Any>>,
    cursor: usize,
}

/// Keys of handles woken since the last flush. Shared with wakers, which
/// may fire on any thread.
pub(crate) type Inbox = Arc<Mutex<IndexSet<u64>>>;

/// Something that takes its next async step when woken.
pub(crate) trait Resume {
    fn resume(&self);
}

struct RuntimeState {
    graph: RefCell<Scheduler>,
    /// Releases requested while the graph was borrowed.
    deferred_release: RefCell<Vec<NodeId>>,
    /// Watcher roots waiting for listener notification.
    pending_notify: RefCell<IndexSet<NodeId>>,
    hooks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    owned: RefCell<HashMap<NodeId, OwnedSlots>>,
    /// Async handles that can be stepped from a wakeup, by key.
    resumable: RefCell<HashMap<u64, Weak<dyn Resume>>>,
    next_resume_key: Cell<u64>,
    inbox: Inbox,
    /// Evaluations and async steps currently on the stack.
    busy: Cell<u32>,
    batch_depth: Cell<u32>,
    flushing: Cell<bool>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            graph: RefCell::new(Scheduler::new()),
            deferred_release: RefCell::new(Vec::new()),
            pending_notify: RefCell::new(IndexSet::new()),
            hooks: RefCell::new(VecDeque::new()),
            owned: RefCell::new(HashMap::new()),
            resumable: RefCell::new(HashMap::new()),
            next_resume_key: Cell::new(0),
            inbox: Inbox::default(),
            busy: Cell::new(0),
            batch_depth: Cell::new(0),
            flushing: Cell::new(false),
        }
    }
}

/// Entry points for inspecting and batching the thread's reactive graph.
pub struct Runtime;

impl Runtime {
    /// Number of live nodes (cells, computations, handles) on this thread.
    pub fn node_count() -> usize {
        with_graph(|graph| graph.node_count())
    }

    /// Check if reads are currently being tracked.
    pub fn is_tracking() -> bool {
        ReactiveContext::is_active()
    }

    /// Get the computation reads are currently attributed to, if any.
    pub fn current_consumer() -> Option<NodeId> {
        ReactiveContext::current_consumer()
    }

    /// Watch count of a node, mostly useful in tests and diagnostics.
    pub fn watch_count(id: NodeId) -> Option<u32> {
        with_graph(|graph| graph.get_node(id).map(Node::watch_count))
    }

    pub fn state(id: NodeId) -> Option<NodeState> {
        with_graph(|graph| graph.get_node(id).map(Node::state))
    }
}

/// Run `f` with watcher notifications deferred until the outermost batch
/// ends. Writes and dirty propagation still happen immediately.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    struct BatchGuard;
    impl Drop for BatchGuard {
        fn drop(&mut self) {
            let _ = RUNTIME.try_with(|rt| rt.batch_depth.set(rt.batch_depth.get() - 1));
        }
    }

    RUNTIME.with(|rt| rt.batch_depth.set(rt.batch_depth.get() + 1));
    let result = {
        let _guard = BatchGuard;
        f()
    };
    flush_if_idle();
    result
}

pub(crate) fn with_graph<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    RUNTIME.with(|rt| f(&rt.graph.borrow()))
}

pub(crate) fn with_graph_mut<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    RUNTIME.with(|rt| f(&mut rt.graph.borrow_mut()))
}

/// Register a node owned by a typed primitive.
pub(crate) fn register(kind: NodeKind, label: Option<Rc<str>>, owner: Option<Weak<dyn Evaluate>>) -> NodeId {
    let mut node = Node::new(kind).with_label(label);
    if let Some(owner) = owner {
        node = node.with_owner(owner);
    }
    with_graph_mut(|graph| graph.add_node(node))
}

/// Attach the typed owner after construction (owners are built with
/// `Rc::new_cyclic` and need their id first).
pub(crate) fn set_owner(id: NodeId, owner: Weak<dyn Evaluate>) {
    with_graph_mut(|graph| {
        if let Some(node) = graph.get_node_mut(id) {
            node.owner = Some(owner);
        }
    });
}

/// Release a node whose owner was dropped.
pub(crate) fn release(id: NodeId) {
    let released = RUNTIME.try_with(|rt| match rt.graph.try_borrow_mut() {
        Ok(graph) => {
            drop(graph);
            true
        }
        Err(_) => {
            rt.deferred_release.borrow_mut().push(id);
            false
        }
    });
    if released == Ok(true) {
        release_now(id);
    }
}

fn release_now(id: NodeId) {
    // A node released while watched still owes its owner the `1 -> 0` hook
    // and its dependencies their watch.
    let (owner, transitions, dependents) = with_graph_mut(|graph| {
        let mut owner = None;
        let mut transitions = Vec::new();
        if let Some(node) = graph.get_node(id) {
            if node.watch_count > 0 {
                owner = node.owner.as_ref().and_then(Weak::upgrade);
                let deps: SmallVec<[NodeId; 8]> = node.dependencies.keys().copied().collect();
                for dep in deps {
                    transitions.extend(graph.unwatch(dep));
                }
            }
        }
        let dependents = graph.remove_node(id);
        (owner, transitions, dependents)
    });
    trace!(node = ?id, dependents = dependents.len(), "released node");

    let propagation = with_graph_mut(|graph| graph.mark_dirty(dependents));
    queue_notify(propagation.notify);

    let owned = RUNTIME.with(|rt| rt.owned.borrow_mut().remove(&id));
    drop(owned);
    RUNTIME.with(|rt| rt.pending_notify.borrow_mut().swap_remove(&id));

    if let Some(owner) = owner {
        let _busy = BusyGuard::enter();
        owner.on_unwatched();
    }
    run_transitions(transitions);
}

fn drain_deferred_releases() {
    loop {
        let next = RUNTIME.with(|rt| rt.deferred_release.borrow_mut().pop());
        match next {
            Some(id) => release_now(id),
            None => break,
        }
    }
}

/// Record a read of `id` on the current consumer, at its current version.
pub(crate) fn track_read(id: NodeId) {
    if !ReactiveContext::is_active() {
        return;
    }
    if let Some(version) = with_graph(|graph| graph.version(id)) {
        ReactiveContext::track_dependency(id, version);
    }
}

/// A source changed: bump its version, dirty its dependents and notify
/// watchers once settled.
pub(crate) fn notify_changed(id: NodeId) {
    let propagation = with_graph_mut(|graph| graph.mark_changed(id));
    if propagation.dirtied > 0 {
        trace!(source = ?id, dirtied = propagation.dirtied, "propagated write");
    }
    queue_notify(propagation.notify);
    flush_if_idle();
}

fn queue_notify(ids: impl IntoIterator<Item = NodeId>) {
    RUNTIME.with(|rt| rt.pending_notify.borrow_mut().extend(ids));
}

pub(crate) fn label_of(id: NodeId) -> String {
    with_graph(|graph| {
        graph
            .get_node(id)
            .map(|node| node.describe(id))
            .unwrap_or_else(|| format!("{id:?}"))
    })
}

fn owner_of(id: NodeId) -> Option<Rc<dyn Evaluate>> {
    with_graph(|graph| {
        graph
            .get_node(id)
            .and_then(|node| node.owner.as_ref())
            .and_then(Weak::upgrade)
    })
}

/// Bring a computation up to date, recomputing only if a dependency moved.
pub(crate) fn update_if_needed(id: NodeId) -> Result<()> {
    let snapshot = with_graph(|graph| {
        graph
            .get_node(id)
            .map(|node| (node.kind, node.state, node.computed))
    });
    let Some((kind, state, computed)) = snapshot else {
        return Ok(());
    };
    if kind != NodeKind::Derived {
        return Ok(());
    }

    match state {
        NodeState::Clean => Ok(()),
        NodeState::Computing => {
            let node = label_of(id);
            warn!(%node, "cyclic computation");
            Err(ReactiveError::cyclic(node))
        }
        NodeState::Dirty if !computed => recompute(id),
        NodeState::Dirty => {
            let _busy = BusyGuard::enter();
            let deps: SmallVec<[(NodeId, u64); 8]> = with_graph_mut(|graph| {
                graph.set_state(id, NodeState::Computing);
                graph
                    .get_node(id)
                    .map(|node| node.dependencies.iter().map(|(dep, seen)| (*dep, *seen)).collect())
                    .unwrap_or_default()
            });
            // A dependency that unwinds leaves this node dirty, not stuck
            // in `Computing`.
            let mut guard = EvaluationGuard { id, armed: true };

            for (dep, seen) in deps {
                if let Err(err) = update_if_needed(dep) {
                    guard.armed = false;
                    with_graph_mut(|graph| graph.set_state(id, NodeState::Dirty));
                    return Err(err);
                }
                if with_graph(|graph| graph.version(dep)) != Some(seen) {
                    guard.armed = false;
                    return recompute(id);
                }
            }

            guard.armed = false;
            with_graph_mut(|graph| graph.finish_evaluation(id, false));
            Ok(())
        }
    }
}

/// Resets a node to dirty if evaluation unwinds.
struct EvaluationGuard {
    id: NodeId,
    armed: bool,
}

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = RUNTIME.try_with(|rt| {
            if let Ok(mut graph) = rt.graph.try_borrow_mut() {
                graph.set_state(self.id, NodeState::Dirty);
            }
        });
    }
}

fn recompute(id: NodeId) -> Result<()> {
    let owner = with_graph_mut(|graph| {
        graph.set_state(id, NodeState::Computing);
        if let Some(node) = graph.get_node_mut(id) {
            node.stale = false;
        }
        graph
            .get_node(id)
            .and_then(|node| node.owner.as_ref())
            .and_then(Weak::upgrade)
    });
    let Some(owner) = owner else {
        with_graph_mut(|graph| graph.finish_evaluation(id, false));
        return Ok(());
    };

    RUNTIME.with(|rt| {
        if let Some(slots) = rt.owned.borrow_mut().get_mut(&id) {
            slots.cursor = 0;
        }
    });
    let mut guard = EvaluationGuard { id, armed: true };

    let (changed, deps) = {
        let _busy = BusyGuard::enter();
        let _scope = owner.scope().map(ScopeGuard::enter);
        let ctx = ReactiveContext::enter(Some(id));
        let changed = owner.evaluate();
        (changed, ctx.finish())
    };
    guard.armed = false;

    let dep_count = deps.len();
    let transitions = with_graph_mut(|graph| {
        let transitions = graph.install_dependencies(id, deps, InstallMode::Replace);
        graph.finish_evaluation(id, changed);
        transitions
    });
    trace!(node = %label_of(id), changed, deps = dep_count, "recomputed");

    run_transitions(transitions);
    run_hooks();
    drop(owner);
    Ok(())
}

/// Merge dependencies collected by a resumed async step into its node.
pub(crate) fn extend_dependencies(id: NodeId, deps: indexmap::IndexMap<NodeId, u64>) {
    if deps.is_empty() {
        return;
    }
    let transitions = with_graph_mut(|graph| graph.install_dependencies(id, deps, InstallMode::Extend));
    run_transitions(transitions);
}

/// Run activation hooks for watch transitions. Notifications raised by the
/// hooks are flushed by the caller.
pub(crate) fn run_transitions(transitions: Vec<WatchTransition>) {
    if transitions.is_empty() {
        return;
    }
    let _busy = BusyGuard::enter();
    // Unwatches run dependencies first, so nothing is collected while a
    // dependency still owes it an `on_unwatched`.
    let (watched, unwatched): (Vec<_>, Vec<_>) = transitions
        .into_iter()
        .partition(|transition| matches!(transition, WatchTransition::Watched(_)));
    for transition in watched.into_iter().chain(unwatched.into_iter().rev()) {
        match transition {
            WatchTransition::Watched(id) => {
                if let Some(owner) = owner_of(id) {
                    owner.on_watched();
                }
            }
            WatchTransition::Unwatched(id) => {
                if let Some(owner) = owner_of(id) {
                    owner.on_unwatched();
                }
            }
        }
    }
}

/// Start watching a root (watcher) node: compute it, then hold a watch on
/// it and everything it reads.
pub(crate) fn watch_root(id: NodeId) {
    let result = update_if_needed(id);
    if let Err(err) = &result {
        debug!(node = %label_of(id), %err, "watcher armed on failed value");
    }
    let transitions = with_graph_mut(|graph| {
        if let Some(node) = graph.get_node_mut(id) {
            node.notify = true;
        }
        graph.watch(id)
    });
    run_transitions(transitions);
    flush_if_idle();
}

pub(crate) fn unwatch_root(id: NodeId) {
    let transitions = RUNTIME.try_with(|rt| match rt.graph.try_borrow_mut() {
        Ok(mut graph) => {
            let transitions = graph.unwatch(id);
            if let Some(node) = graph.get_node_mut(id) {
                node.notify = node.watch_count > 0;
            }
            transitions
        }
        Err(_) => Vec::new(),
    });
    if let Ok(transitions) = transitions {
        run_transitions(transitions);
    }
}

/// Queue a callback to run after the current evaluation finishes.
pub(crate) fn queue_hook(hook: impl FnOnce() + 'static) {
    RUNTIME.with(|rt| rt.hooks.borrow_mut().push_back(Box::new(hook)));
}

fn run_hooks() {
    if is_busy() {
        return;
    }
    loop {
        let next = RUNTIME.with(|rt| rt.hooks.borrow_mut().pop_front());
        match next {
            Some(hook) => hook(),
            None => break,
        }
    }
}

fn is_busy() -> bool {
    RUNTIME.with(|rt| rt.busy.get() > 0)
}

/// Marks an async step or evaluation as in progress.
pub(crate) struct BusyGuard;

impl BusyGuard {
    pub(crate) fn enter() -> Self {
        RUNTIME.with(|rt| rt.busy.set(rt.busy.get() + 1));
        Self
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let _ = RUNTIME.try_with(|rt| rt.busy.set(rt.busy.get().saturating_sub(1)));
    }
}

/// Settle queued watchers, unless an evaluation or batch is in progress.
pub(crate) fn flush_if_idle() {
    let idle = RUNTIME.with(|rt| rt.busy.get() == 0 && rt.batch_depth.get() == 0 && !rt.flushing.get());
    if !idle {
        return;
    }

    RUNTIME.with(|rt| rt.flushing.set(true));
    struct FlushGuard;
    impl Drop for FlushGuard {
        fn drop(&mut self) {
            let _ = RUNTIME.try_with(|rt| rt.flushing.set(false));
        }
    }
    let _guard = FlushGuard;

    let mut resumed = HashSet::new();
    loop {
        drain_deferred_releases();
        let stepped = resume_woken(&mut resumed);
        run_hooks();
        let next = RUNTIME.with(|rt| rt.pending_notify.borrow_mut().shift_remove_index(0));
        match next {
            Some(id) => {
                if let Some(owner) = owner_of(id) {
                    owner.settle();
                }
            }
            None if stepped => {}
            None => break,
        }
    }
}

/// Register a handle for wakeups. Returns its key and the inbox its wakers
/// post to.
pub(crate) fn register_resumable(target: Weak<dyn Resume>) -> (u64, Inbox) {
    RUNTIME.with(|rt| {
        let key = rt.next_resume_key.get();
        rt.next_resume_key.set(key + 1);
        rt.resumable.borrow_mut().insert(key, target);
        (key, Arc::clone(&rt.inbox))
    })
}

pub(crate) fn unregister_resumable(key: u64) {
    let _ = RUNTIME.try_with(|rt| {
        if let Ok(mut resumable) = rt.resumable.try_borrow_mut() {
            resumable.remove(&key);
        }
    });
}

/// Called by a waker on the runtime's own thread, after posting its key:
/// step woken handles now if nothing is on the stack. Otherwise the next
/// flush picks them up.
pub(crate) fn wake_resumable() {
    let free = RUNTIME
        .try_with(|rt| rt.graph.try_borrow_mut().is_ok() && rt.resumable.try_borrow().is_ok())
        .unwrap_or(false);
    if free {
        flush_if_idle();
    }
}

/// Step every handle woken since the last pass, each at most once per
/// flush. A handle that wakes itself again waits for the next flush.
fn resume_woken(resumed: &mut HashSet<u64>) -> bool {
    let woken: Vec<u64> = RUNTIME.with(|rt| {
        let mut inbox = rt.inbox.lock();
        let fresh = inbox.iter().copied().filter(|key| !resumed.contains(key)).collect();
        inbox.retain(|key| resumed.contains(key));
        fresh
    });

    let mut stepped = false;
    for key in woken {
        resumed.insert(key);
        let target = RUNTIME.with(|rt| rt.resumable.borrow().get(&key).and_then(Weak::upgrade));
        if let Some(target) = target {
            trace!(key, "resuming woken handle");
            target.resume();
            stepped = true;
        }
    }
    stepped
}

/// Claim the next owned slot of the current consumer, creating it with
/// `make` on first use. Returns the value and whether it was reused.
pub(crate) fn claim_owned<T: Any>(make: impl FnOnce() -> Rc<T>) -> (Rc<T>, bool) {
    let Some(consumer) = ReactiveContext::current_consumer() else {
        return (make(), false);
    };

    let existing = RUNTIME.with(|rt| {
        let mut owned = rt.owned.borrow_mut();
        let slots = owned.entry(consumer).or_default();
        let index = slots.cursor;
        slots.cursor += 1;
        (index, slots.items.get(index).cloned())
    });

    let (index, item) = existing;
    if let Some(item) = item {
        if let Ok(reused) = item.downcast::<T>() {
            return (reused, true);
        }
    }

    let created = make();
    let replaced = RUNTIME.with(|rt| {
        let mut owned = rt.owned.borrow_mut();
        let slots = owned.entry(consumer).or_default();
        let erased: Rc<dyn Any> = created.clone();
        if index < slots.items.len() {
            Some(std::mem::replace(&mut slots.items[index], erased))
        } else {
            slots.items.push(erased);
            None
        }
    });
    drop(replaced);
    (created, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        runs: Cell<u32>,
    }

    impl Evaluate for Counter {
        fn evaluate(&self) -> bool {
            self.runs.set(self.runs.get() + 1);
            true
        }
    }

    #[test]
    fn recompute_runs_owner_once_until_dirtied() {
        let counter = Rc::new(Counter { runs: Cell::new(0) });
        let weak: Weak<dyn Evaluate> = Rc::downgrade(&counter) as Weak<dyn Evaluate>;
        let id = register(NodeKind::Derived, None, Some(weak));

        update_if_needed(id).unwrap();
        update_if_needed(id).unwrap();
        assert_eq!(counter.runs.get(), 1);
        assert_eq!(Runtime::state(id), Some(NodeState::Clean));

        // Dirty without any moved dependency: re-validated, not recomputed.
        with_graph_mut(|graph| graph.set_state(id, NodeState::Dirty));
        update_if_needed(id).unwrap();
        assert_eq!(counter.runs.get(), 1);

        release(id);
        assert!(Runtime::state(id).is_none());
    }

    struct Stepper {
        steps: Cell<u32>,
    }

    impl Resume for Stepper {
        fn resume(&self) {
            self.steps.set(self.steps.get() + 1);
        }
    }

    #[test]
    fn woken_keys_resume_once_then_clear() {
        let stepper = Rc::new(Stepper { steps: Cell::new(0) });
        let target: Weak<dyn Resume> = Rc::downgrade(&stepper) as Weak<dyn Resume>;
        let (key, inbox) = register_resumable(target);

        inbox.lock().insert(key);
        inbox.lock().insert(key);
        flush_if_idle();
        assert_eq!(stepper.steps.get(), 1);

        unregister_resumable(key);
        inbox.lock().insert(key);
        flush_if_idle();
        assert_eq!(stepper.steps.get(), 1);
        assert!(inbox.lock().is_empty());
    }

    #[test]
    fn batch_defers_flush() {
        let ran = batch(|| {
            assert!(RUNTIME.with(|rt| rt.batch_depth.get()) == 1);
            7
        });
        assert_eq!(ran, 7);
        assert_eq!(RUNTIME.with(|rt| rt.batch_depth.get()), 0);
    }

    #[test]
    fn claim_owned_without_consumer_always_creates() {
        let (a, reused_a) = claim_owned(|| Rc::new(1u8));
        let (b, reused_b) = claim_owned(|| Rc::new(1u8));
        assert!(!reused_a && !reused_b);
        assert!(!Rc::ptr_eq(&a, &b));
    }
}
