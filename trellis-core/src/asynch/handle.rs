//! Async Handles
//!
//! An [`AsyncHandle`] is both a future and a live reactive value. Awaiting it
//! yields the settled result; reading its flags (`is_pending`, `value`, ...)
//! inside a computation makes that computation depend on it.
//!
//! # Driving
//!
//! The pending run of a handle is polled eagerly once when it starts. After
//! that it is stepped whenever its future wakes it, and also whenever
//! anything polls or inspects the handle. Each step re-enters the consumer
//! and scope saved when the run started, so reads after an `.await` are
//! attributed to the computation that owns the run and see the state as of
//! resumption.
//!
//! A wakeup posts the handle to the runtime's inbox through its
//! [`Notifier`]; the runtime steps it at the next flush (right away if it
//! is idle), then every outside awaiter is woken as well.
//!
//! A run replaced by a newer one is not cancelled: it keeps being stepped,
//! untracked, until it finishes, and its result is thrown away. Superseded
//! runs go away early only with the handle itself.
//!
//! # Versioning
//!
//! Every handle owns a source node in the graph. Settling, or going back to
//! pending, bumps that node so dependents are dirtied like on any write.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};

use futures_util::future::LocalBoxFuture;
use futures_util::task::{waker, ArcWake};
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::error::{ReactiveError, Result};
use crate::graph::{NodeId, NodeKind};
use crate::reactive::runtime::{self, BusyGuard, Inbox, Resume};
use crate::reactive::{Equals, ReactiveContext, ScopeGuard};
use crate::scope::Scope;

/// Settlement state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Resolved,
    Rejected,
}

/// Waker of a handle's runs, and multi-waker for its awaiters.
pub(crate) struct Notifier {
    wakers: Mutex<Vec<Waker>>,
    key: u64,
    inbox: Inbox,
    origin: ThreadId,
}

impl Notifier {
    pub(crate) fn new(key: u64, inbox: Inbox) -> Self {
        Self {
            wakers: Mutex::new(Vec::new()),
            key,
            inbox,
            origin: thread::current().id(),
        }
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|known| known.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn waiting(&self) -> usize {
        self.wakers.lock().len()
    }
}

impl ArcWake for Notifier {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.inbox.lock().insert(arc_self.key);
        // Off-thread wakeups wait in the inbox for the runtime's next flush.
        if thread::current().id() == arc_self.origin {
            runtime::wake_resumable();
        }
        arc_self.wake_all();
    }
}

/// How a step sets up dependency tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Poll inside the frame that is already open (the eager first step of
    /// a computation's run).
    Current,

    /// Push the saved consumer and scope for the duration of the step.
    Restore,
}

/// A pending run. Holding the scope keeps context bindings resolvable
/// until the run finishes.
struct Run<T> {
    future: LocalBoxFuture<'static, Result<T>>,
    consumer: Option<NodeId>,
    scope: Option<Scope>,
}

pub(crate) struct HandleInner<T> {
    source: NodeId,
    status: Cell<Status>,
    value: RefCell<Option<T>>,
    error: RefCell<Option<ReactiveError>>,
    run: RefCell<Option<Run<T>>>,
    /// Superseded runs, stepped until they finish.
    orphans: RefCell<Vec<Run<T>>>,
    generation: Cell<u64>,
    polling: Cell<bool>,
    notifier: Arc<Notifier>,
    equals: Equals<T>,
    /// Keeps a relay driver alive for as long as the handle.
    driver: RefCell<Option<Rc<dyn Any>>>,
}

impl<T> Drop for HandleInner<T> {
    fn drop(&mut self) {
        runtime::unregister_resumable(self.notifier.key);
        runtime::release(self.source);
    }
}

/// Resets the re-entrancy flag when a step ends, even by unwinding.
struct PollingGuard<'a>(&'a Cell<bool>);

impl Drop for PollingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<T: 'static> HandleInner<T> {
    /// Poll the pending run once, if there is one. Restoring steps also
    /// advance superseded runs.
    fn drive(&self, frame: Frame) -> Result<()> {
        if self.polling.get() {
            return Err(ReactiveError::cyclic(runtime::label_of(self.source)));
        }

        let settled = {
            self.polling.set(true);
            let _polling = PollingGuard(&self.polling);
            let _busy = BusyGuard::enter();
            let waker = waker(Arc::clone(&self.notifier));
            let mut cx = Context::from_waker(&waker);

            if frame == Frame::Restore {
                self.drive_orphans(&mut cx);
            }
            let Some(mut run) = self.run.borrow_mut().take() else {
                return Ok(());
            };
            let generation = self.generation.get();

            let poll = match frame {
                Frame::Current => run.future.as_mut().poll(&mut cx),
                Frame::Restore => {
                    let _scope = run.scope.clone().map(ScopeGuard::enter);
                    let ctx = ReactiveContext::enter(run.consumer);
                    let poll = run.future.as_mut().poll(&mut cx);
                    let deps = ctx.finish();
                    if let Some(consumer) = run.consumer {
                        runtime::extend_dependencies(consumer, deps);
                    }
                    poll
                }
            };

            if self.generation.get() != generation {
                // Superseded while polling: the new run is already stored.
                if poll.is_pending() {
                    self.orphans.borrow_mut().push(run);
                }
                return Ok(());
            }
            match poll {
                Poll::Ready(result) => Some(result),
                Poll::Pending => {
                    *self.run.borrow_mut() = Some(run);
                    None
                }
            }
        };

        if let Some(result) = settled {
            self.settle(result);
        }
        Ok(())
    }

    /// Step superseded runs in their saved scope, untracked. Whatever they
    /// produce is dropped.
    fn drive_orphans(&self, cx: &mut Context<'_>) {
        let orphans = std::mem::take(&mut *self.orphans.borrow_mut());
        if orphans.is_empty() {
            return;
        }
        let mut pending = Vec::with_capacity(orphans.len());
        for mut orphan in orphans {
            let _scope = orphan.scope.clone().map(ScopeGuard::enter);
            let _untracked = ReactiveContext::untracked();
            if orphan.future.as_mut().poll(cx).is_pending() {
                pending.push(orphan);
            }
        }
        let mut orphans = self.orphans.borrow_mut();
        pending.append(&mut *orphans);
        *orphans = pending;
    }

    /// Replace the pending run. The previous run, if any, keeps running
    /// but can no longer settle the handle.
    ///
    /// A settled handle goes back to pending but keeps its last value.
    pub(crate) fn begin_run(
        &self,
        future: LocalBoxFuture<'static, Result<T>>,
        consumer: Option<NodeId>,
        scope: Option<Scope>,
        frame: Frame,
    ) {
        self.generation.set(self.generation.get() + 1);
        let superseded = self.run.replace(Some(Run {
            future,
            consumer,
            scope,
        }));
        if let Some(run) = superseded {
            self.orphans.borrow_mut().push(run);
        }

        if self.status.get() != Status::Pending {
            self.status.set(Status::Pending);
            runtime::notify_changed(self.source);
        }
        // Started from inside its own step: the new run is polled next time.
        let _ = self.drive(frame);
    }

    /// Detach the pending run from the handle without settling. It still
    /// runs to completion.
    pub(crate) fn cancel_run(&self) {
        self.generation.set(self.generation.get() + 1);
        let cancelled = self.run.borrow_mut().take();
        if let Some(run) = cancelled {
            self.orphans.borrow_mut().push(run);
        }
    }

    pub(crate) fn settle(&self, result: Result<T>) {
        let changed = match result {
            Ok(value) => {
                // An equal value keeps the previous one; only the status may
                // have moved.
                let same = self
                    .value
                    .borrow()
                    .as_ref()
                    .is_some_and(|old| self.equals.eq(old, &value));
                let was_resolved = self.status.replace(Status::Resolved) == Status::Resolved;
                let cleared = self.error.borrow_mut().take();
                drop(cleared);
                if !same {
                    let previous = self.value.replace(Some(value));
                    drop(previous);
                }
                !(same && was_resolved)
            }
            Err(error) => {
                self.status.set(Status::Rejected);
                let previous = self.error.replace(Some(error));
                drop(previous);
                true
            }
        };

        if changed {
            runtime::notify_changed(self.source);
        }
        self.notifier.wake_all();
    }

    /// Make progress if possible, then record the read.
    fn observe(&self) {
        if !self.polling.get() {
            let _ = self.drive(Frame::Restore);
        }
        runtime::track_read(self.source);
        runtime::flush_if_idle();
    }
}

impl<T: 'static> Resume for HandleInner<T> {
    fn resume(&self) {
        if !self.polling.get() {
            let _ = self.drive(Frame::Restore);
        }
    }
}

/// A deferred value that is also a reactive value.
///
/// Clones share the same underlying handle.
pub struct AsyncHandle<T> {
    inner: Rc<HandleInner<T>>,
}

impl<T: 'static> AsyncHandle<T> {
    pub(crate) fn pending(kind: NodeKind, label: Option<Rc<str>>, equals: Equals<T>) -> Self {
        let source = runtime::register(kind, label, None);
        let inner = Rc::new_cyclic(|weak: &Weak<HandleInner<T>>| {
            let target: Weak<dyn Resume> = weak.clone();
            let (key, inbox) = runtime::register_resumable(target);
            HandleInner {
                source,
                status: Cell::new(Status::Pending),
                value: RefCell::new(None),
                error: RefCell::new(None),
                run: RefCell::new(None),
                orphans: RefCell::new(Vec::new()),
                generation: Cell::new(0),
                polling: Cell::new(false),
                notifier: Arc::new(Notifier::new(key, inbox)),
                equals,
                driver: RefCell::new(None),
            }
        });
        Self { inner }
    }

    /// A handle that is already resolved.
    pub fn resolved(value: T) -> Self {
        let handle = Self::pending(NodeKind::Source, None, Equals::never());
        handle.inner.status.set(Status::Resolved);
        *handle.inner.value.borrow_mut() = Some(value);
        handle
    }

    /// A handle that is already rejected.
    pub fn rejected(error: ReactiveError) -> Self {
        let handle = Self::pending(NodeKind::Source, None, Equals::never());
        handle.inner.status.set(Status::Rejected);
        *handle.inner.error.borrow_mut() = Some(error);
        handle
    }

    /// Adopt a foreign future. It starts running immediately in the current
    /// scope, untracked.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
    {
        let handle = Self::pending(NodeKind::Source, None, Equals::never());
        handle.inner.begin_run(
            future.boxed_local(),
            None,
            Some(Scope::current()),
            Frame::Restore,
        );
        runtime::flush_if_idle();
        handle
    }

    /// Node id of the handle's version cell.
    pub fn id(&self) -> NodeId {
        self.inner.source
    }

    pub fn status(&self) -> Status {
        self.inner.observe();
        self.inner.status.get()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == Status::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == Status::Rejected
    }

    /// Whether a value is available, possibly stale while a new run is
    /// pending.
    pub fn is_ready(&self) -> bool {
        self.inner.observe();
        self.inner.value.borrow().is_some()
    }

    /// The latest resolved value, kept while a re-run is pending.
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.observe();
        self.inner.value.borrow().clone()
    }

    /// The error, if the handle is rejected.
    pub fn error(&self) -> Option<ReactiveError> {
        self.inner.observe();
        match self.inner.status.get() {
            Status::Rejected => self.inner.error.borrow().clone(),
            Status::Pending | Status::Resolved => None,
        }
    }

    /// Number of wakers parked on this handle.
    pub fn waiting(&self) -> usize {
        self.inner.notifier.waiting()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn inner(&self) -> &Rc<HandleInner<T>> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Rc<HandleInner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn attach_driver(&self, driver: Rc<dyn Any>) {
        let previous = self.inner.driver.replace(Some(driver));
        drop(previous);
    }
}

impl<T: Clone + 'static> Future for AsyncHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &self.inner;
        inner.notifier.register(cx.waker());
        if let Err(err) = inner.drive(Frame::Restore) {
            return Poll::Ready(Err(err));
        }
        runtime::track_read(inner.source);

        let outcome = match inner.status.get() {
            Status::Pending => Poll::Pending,
            Status::Resolved => Poll::Ready(
                inner
                    .value
                    .borrow()
                    .clone()
                    .ok_or_else(|| ReactiveError::unreachable("resolved handle without a value")),
            ),
            Status::Rejected => Poll::Ready(Err(inner
                .error
                .borrow()
                .clone()
                .unwrap_or_else(|| ReactiveError::unreachable("rejected handle without an error")))),
        };
        runtime::flush_if_idle();
        outcome
    }
}

impl<T> Clone for AsyncHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Handles compare by identity.
impl<T> PartialEq for AsyncHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: fmt::Debug> fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("id", &self.inner.source)
            .field("status", &self.inner.status.get())
            .field("value", &*self.inner.value.borrow())
            .field("error", &*self.inner.error.borrow())
            .finish()
    }
}
