//! Watchers and subscriptions.
//!
//! A watcher is the boundary between the graph and outside code (a UI
//! adapter, a logger, a test). It wraps a computation; while it has at
//! least one listener it holds a watch on that computation, which keeps
//! relays active and nodes out of reach of garbage collection.
//!
//! Listeners run once the write that dirtied the watcher has settled, and
//! only if the watcher's value actually changed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::equality::Equals;
use super::runtime;
use crate::config::ReactiveOptions;
use crate::error::{ReactiveError, Result};
use crate::graph::{Evaluate, NodeId, NodeKind};
use crate::scope::Scope;

/// Unique identifier for a listener.
///
/// Each listener gets a unique ID when it is added. The ID is used to remove
/// it again without disturbing the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Listener = Rc<dyn Fn()>;

/// An observed computation with change listeners.
pub struct Watcher<T> {
    inner: Rc<WatcherNode<T>>,
}

struct WatcherNode<T> {
    id: NodeId,
    compute: Box<dyn Fn() -> Result<T>>,
    equals: Equals<T>,
    value: RefCell<Option<Result<T>>>,
    listeners: RefCell<Vec<(SubscriberId, Listener)>>,
    /// Version of the node when listeners were last called.
    notified: Cell<u64>,
    scope: Scope,
}

/// Create a watcher over `compute` with structural equality.
pub fn watcher<T, F>(compute: F) -> Watcher<T>
where
    T: PartialEq + 'static,
    F: Fn() -> Result<T> + 'static,
{
    watcher_with(compute, ReactiveOptions::new())
}

/// Create a watcher with explicit options. Only `equals` and `desc`/`id`
/// apply.
pub fn watcher_with<T, F>(compute: F, options: ReactiveOptions<(), T>) -> Watcher<T>
where
    T: 'static,
    F: Fn() -> Result<T> + 'static,
{
    let label = options.label();
    let inner = Rc::new_cyclic(|weak: &Weak<WatcherNode<T>>| {
        let owner: Weak<dyn Evaluate> = weak.clone();
        WatcherNode {
            id: runtime::register(NodeKind::Derived, label, Some(owner)),
            compute: Box::new(compute),
            equals: options.equals,
            value: RefCell::new(None),
            listeners: RefCell::new(Vec::new()),
            notified: Cell::new(0),
            scope: Scope::current(),
        }
    });
    Watcher { inner }
}

impl<T: 'static> Watcher<T> {
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The current value, computed or re-validated as needed.
    pub fn value(&self) -> Result<T>
    where
        T: Clone,
    {
        let outcome = runtime::update_if_needed(self.inner.id);
        runtime::track_read(self.inner.id);
        runtime::flush_if_idle();
        outcome?;
        match &*self.inner.value.borrow() {
            Some(result) => result.clone(),
            None => Err(ReactiveError::unreachable("watcher read before producing a value")),
        }
    }

    /// Register a listener. The first listener arms the watcher.
    ///
    /// The returned subscription removes the listener when dropped.
    pub fn add_listener(&self, listener: impl Fn() + 'static) -> Subscription {
        let id = SubscriberId::new();
        let first = {
            let mut listeners = self.inner.listeners.borrow_mut();
            listeners.push((id, Rc::new(listener)));
            listeners.len() == 1
        };

        if first {
            if let Err(err) = runtime::update_if_needed(self.inner.id) {
                debug!(%err, "watcher armed on failed value");
            }
            let version = runtime::with_graph(|graph| graph.version(self.inner.id)).unwrap_or_default();
            self.inner.notified.set(version);
            runtime::watch_root(self.inner.id);
        }

        let node = Rc::downgrade(&self.inner);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(node) = node.upgrade() {
                    node.remove_listener(id);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }
}

impl<T: 'static> WatcherNode<T> {
    fn remove_listener(&self, id: SubscriberId) {
        let last = {
            let mut listeners = self.listeners.borrow_mut();
            let before = listeners.len();
            listeners.retain(|(listener, _)| *listener != id);
            before > 0 && listeners.is_empty()
        };
        if last {
            runtime::unwatch_root(self.id);
            runtime::flush_if_idle();
        }
    }
}

impl<T: 'static> Evaluate for WatcherNode<T> {
    fn evaluate(&self) -> bool {
        let next = (self.compute)();
        let changed = match (&*self.value.borrow(), &next) {
            (Some(Ok(previous)), Ok(next)) => !self.equals.eq(previous, next),
            _ => true,
        };
        if changed {
            let previous = self.value.replace(Some(next));
            drop(previous);
        }
        changed
    }

    fn scope(&self) -> Option<Scope> {
        Some(self.scope.clone())
    }

    fn settle(&self) {
        if let Err(err) = runtime::update_if_needed(self.id) {
            debug!(%err, "watcher settled on failed value");
        }
        let Some(version) = runtime::with_graph(|graph| graph.version(self.id)) else {
            return;
        };
        if version == self.notified.replace(version) {
            return;
        }

        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in listeners {
            listener();
        }
    }
}

impl<T> Drop for WatcherNode<T> {
    fn drop(&mut self) {
        runtime::release(self.id);
    }
}

impl<T> Clone for Watcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Watcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.inner.id)
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}

/// Handle returned by [`Watcher::add_listener`].
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) removes the
/// listener; removing the last listener disarms the watcher.
#[must_use = "dropping a subscription removes its listener"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
