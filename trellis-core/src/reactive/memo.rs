//! Reactive Functions
//!
//! A reactive function is a memoized derivation. Each distinct argument key
//! gets its own node in the calling scope, caching its last result and the
//! versions of everything it read.
//!
//! # How Reactive Functions Work
//!
//! 1. On first call with a key, the node runs its computation and caches
//!    the result.
//!
//! 2. When called again and nothing it read has changed, the cached result
//!    is returned without running the body.
//!
//! 3. When something it read changes, the node is marked dirty.
//!
//! 4. On the next call, the node re-checks its dependencies in read order
//!    and recomputes only if one of them actually moved.
//!
//! 5. A recompute producing an `equals`-equal value keeps the old value and
//!    version, so nothing downstream recomputes.
//!
//! # Why This Matters
//!
//! This "lazy" approach avoids unnecessary recomputation:
//!
//! - A signal changes
//! - 10 computations depend on it
//! - Only the computations actually read will recompute
//! - Computations that are never read stay dirty (no wasted work)
//!
//! # Async
//!
//! [`reactive_async`] defines a suspendable computation. Its node's value is
//! one stable [`AsyncHandle`]; every recompute starts a new run on that
//! handle and drops the previous one.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;

use super::equality::Equals;
use super::runtime;
use crate::asynch::{AsyncHandle, Frame};
use crate::config::{default_args_key, ParamKeyFn, ReactiveOptions, ShouldGcFn};
use crate::error::{ReactiveError, Result};
use crate::graph::{Evaluate, NodeId, NodeKind};
use crate::scope::{self, DefId, NodeKey, Scope, ScopeOwner, WeakScope};

type Compute<A, T> = Rc<dyn Fn(&A) -> Result<T>>;
type AsyncBody<A, T> = Rc<dyn Fn(A) -> LocalBoxFuture<'static, Result<T>>>;

/// What every definition shares, sync or async.
struct Shape<A, T> {
    id: DefId,
    key: ParamKeyFn<A>,
    equals: Equals<T>,
    label: Option<Rc<str>>,
    should_gc: Option<ShouldGcFn<A>>,
    /// Fixed scope for methods; otherwise the caller's scope.
    scope: Option<Scope>,
}

impl<A: 'static, T: 'static> Shape<A, T> {
    fn new(options: ReactiveOptions<A, T>, scope: Option<Scope>) -> Self
    where
        A: Hash,
    {
        let label = options.label();
        let key = options
            .param_key
            .unwrap_or_else(|| Rc::new(|args: &A| default_args_key(args)));
        Self {
            id: DefId::next(),
            key,
            equals: options.equals,
            label,
            should_gc: options.should_gc,
            scope,
        }
    }

    fn locate(&self, args: &A) -> (Scope, NodeKey) {
        let scope = self.scope.clone().unwrap_or_else(Scope::current);
        (scope, (self.id, (self.key)(args)))
    }
}

/// A memoized synchronous computation, callable with arguments.
pub struct ReactiveFn<A, T> {
    shape: Rc<Shape<A, T>>,
    compute: Compute<A, T>,
}

/// Define a reactive function with default options.
///
/// # Example
///
/// ```rust
/// use trellis_core::{reactive, signal};
///
/// let price = signal(10);
/// let p = price.clone();
/// let total = reactive(move |qty: &u32| Ok(p.get() * qty));
///
/// assert_eq!(total.call(3).unwrap(), 30);
/// price.set(20);
/// assert_eq!(total.call(3).unwrap(), 60);
/// ```
pub fn reactive<A, T, F>(compute: F) -> ReactiveFn<A, T>
where
    A: Hash + 'static,
    T: PartialEq + 'static,
    F: Fn(&A) -> Result<T> + 'static,
{
    reactive_with(compute, ReactiveOptions::new())
}

pub fn reactive_with<A, T, F>(compute: F, options: ReactiveOptions<A, T>) -> ReactiveFn<A, T>
where
    A: Hash + 'static,
    T: 'static,
    F: Fn(&A) -> Result<T> + 'static,
{
    ReactiveFn {
        shape: Rc::new(Shape::new(options, None)),
        compute: Rc::new(compute),
    }
}

/// Define a reactive function whose nodes live in `owner`'s scope,
/// whatever scope it is called from.
pub fn reactive_method<O, A, T, F>(owner: &O, compute: F, options: ReactiveOptions<A, T>) -> ReactiveFn<A, T>
where
    O: ScopeOwner + ?Sized,
    A: Hash + 'static,
    T: 'static,
    F: Fn(&A) -> Result<T> + 'static,
{
    ReactiveFn {
        shape: Rc::new(Shape::new(options, Some(owner.scope().clone()))),
        compute: Rc::new(compute),
    }
}

impl<A: 'static, T: Clone + 'static> ReactiveFn<A, T> {
    /// Read the value for `args`, computing or re-validating as needed.
    ///
    /// Inside a computation this records a dependency on the node.
    pub fn call(&self, args: A) -> Result<T> {
        self.node(args).read()
    }

    /// Whether a node for `args` exists in the scope it would be read from.
    pub fn is_cached(&self, args: &A) -> bool {
        let (scope, key) = self.shape.locate(args);
        scope.contains(&key)
    }

    fn node(&self, args: A) -> Rc<ComputedNode<A, T>> {
        let (scope, key) = self.shape.locate(&args);
        let weak_scope = scope.downgrade();
        scope.get_or_insert_with(key, || {
            Rc::new_cyclic(|weak: &Weak<ComputedNode<A, T>>| {
                let owner: Weak<dyn Evaluate> = weak.clone();
                ComputedNode {
                    id: runtime::register(NodeKind::Derived, self.shape.label.clone(), Some(owner)),
                    key,
                    args,
                    compute: Rc::clone(&self.compute),
                    equals: self.shape.equals.clone(),
                    value: RefCell::new(None),
                    scope: weak_scope,
                    should_gc: self.shape.should_gc.clone(),
                }
            })
        })
    }
}

impl<T: Clone + 'static> ReactiveFn<(), T> {
    pub fn get(&self) -> Result<T> {
        self.call(())
    }
}

impl<A, T> Clone for ReactiveFn<A, T> {
    fn clone(&self) -> Self {
        Self {
            shape: Rc::clone(&self.shape),
            compute: Rc::clone(&self.compute),
        }
    }
}

impl<A, T> fmt::Debug for ReactiveFn<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveFn")
            .field("def", &self.shape.id)
            .field("label", &self.shape.label)
            .finish()
    }
}

/// One cached evaluation of a reactive function.
struct ComputedNode<A, T> {
    id: NodeId,
    key: NodeKey,
    args: A,
    compute: Compute<A, T>,
    equals: Equals<T>,
    value: RefCell<Option<Result<T>>>,
    scope: WeakScope,
    should_gc: Option<ShouldGcFn<A>>,
}

impl<A: 'static, T: Clone + 'static> ComputedNode<A, T> {
    fn read(&self) -> Result<T> {
        let outcome = runtime::update_if_needed(self.id);
        runtime::track_read(self.id);
        runtime::flush_if_idle();
        outcome?;

        match &*self.value.borrow() {
            Some(result) => result.clone(),
            None => Err(ReactiveError::unreachable("computation read before producing a value")),
        }
    }
}

impl<A: 'static, T: 'static> Evaluate for ComputedNode<A, T> {
    fn evaluate(&self) -> bool {
        let next = (self.compute)(&self.args);
        // Errors never compare equal.
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
        self.scope.upgrade()
    }

    fn on_unwatched(&self) {
        scope::collect(&self.scope, self.key, &self.args, self.should_gc.as_ref());
    }
}

impl<A, T> Drop for ComputedNode<A, T> {
    fn drop(&mut self) {
        runtime::release(self.id);
    }
}

/// A memoized suspendable computation. Calls return the node's handle.
pub struct AsyncReactiveFn<A, T> {
    shape: Rc<Shape<A, T>>,
    body: AsyncBody<A, T>,
}

/// Define a suspendable reactive function.
///
/// Reads made before the first `.await` and after every resumption are
/// tracked against the node, so a write to anything read re-runs it.
pub fn reactive_async<A, T, F, Fut>(body: F) -> AsyncReactiveFn<A, T>
where
    A: Hash + Clone + 'static,
    T: PartialEq + 'static,
    F: Fn(A) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    reactive_async_with(body, ReactiveOptions::new())
}

pub fn reactive_async_with<A, T, F, Fut>(body: F, options: ReactiveOptions<A, T>) -> AsyncReactiveFn<A, T>
where
    A: Hash + Clone + 'static,
    T: 'static,
    F: Fn(A) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    AsyncReactiveFn {
        shape: Rc::new(Shape::new(options, None)),
        body: Rc::new(move |args| body(args).boxed_local()),
    }
}

/// Async counterpart of [`reactive_method`].
pub fn reactive_async_method<O, A, T, F, Fut>(
    owner: &O,
    body: F,
    options: ReactiveOptions<A, T>,
) -> AsyncReactiveFn<A, T>
where
    O: ScopeOwner + ?Sized,
    A: Hash + Clone + 'static,
    T: 'static,
    F: Fn(A) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    AsyncReactiveFn {
        shape: Rc::new(Shape::new(options, Some(owner.scope().clone()))),
        body: Rc::new(move |args| body(args).boxed_local()),
    }
}

impl<A: Clone + 'static, T: 'static> AsyncReactiveFn<A, T> {
    /// Get the handle for `args`, starting or re-running it if needed.
    ///
    /// A cyclic read yields an already rejected handle.
    pub fn call(&self, args: A) -> AsyncHandle<T> {
        let node = self.node(args);
        let outcome = runtime::update_if_needed(node.id);
        runtime::track_read(node.id);
        runtime::flush_if_idle();
        match outcome {
            Ok(()) => node.handle.clone(),
            Err(err) => AsyncHandle::rejected(err),
        }
    }

    pub fn is_cached(&self, args: &A) -> bool {
        let (scope, key) = self.shape.locate(args);
        scope.contains(&key)
    }

    fn node(&self, args: A) -> Rc<AsyncComputedNode<A, T>> {
        let (scope, key) = self.shape.locate(&args);
        let weak_scope = scope.downgrade();
        scope.get_or_insert_with(key, || {
            Rc::new_cyclic(|weak: &Weak<AsyncComputedNode<A, T>>| {
                let owner: Weak<dyn Evaluate> = weak.clone();
                let label = self.shape.label.clone();
                AsyncComputedNode {
                    id: runtime::register(NodeKind::Derived, label.clone(), Some(owner)),
                    key,
                    args,
                    body: Rc::clone(&self.body),
                    handle: AsyncHandle::pending(NodeKind::Source, label, self.shape.equals.clone()),
                    scope: weak_scope,
                    should_gc: self.shape.should_gc.clone(),
                }
            })
        })
    }
}

impl<T: 'static> AsyncReactiveFn<(), T> {
    pub fn get(&self) -> AsyncHandle<T> {
        self.call(())
    }
}

impl<A, T> Clone for AsyncReactiveFn<A, T> {
    fn clone(&self) -> Self {
        Self {
            shape: Rc::clone(&self.shape),
            body: Rc::clone(&self.body),
        }
    }
}

impl<A, T> fmt::Debug for AsyncReactiveFn<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncReactiveFn")
            .field("def", &self.shape.id)
            .field("label", &self.shape.label)
            .finish()
    }
}

struct AsyncComputedNode<A, T> {
    id: NodeId,
    key: NodeKey,
    args: A,
    body: AsyncBody<A, T>,
    handle: AsyncHandle<T>,
    scope: WeakScope,
    should_gc: Option<ShouldGcFn<A>>,
}

impl<A: Clone + 'static, T: 'static> Evaluate for AsyncComputedNode<A, T> {
    /// Start a new run on the node's handle. The first step is polled right
    /// here, inside the node's own tracking frame.
    fn evaluate(&self) -> bool {
        let future = (self.body)(self.args.clone());
        self.handle
            .inner()
            .begin_run(future, Some(self.id), self.scope.upgrade(), Frame::Current);
        // The handle itself never changes identity.
        false
    }

    fn scope(&self) -> Option<Scope> {
        self.scope.upgrade()
    }

    fn on_unwatched(&self) {
        scope::collect(&self.scope, self.key, &self.args, self.should_gc.as_ref());
    }
}

impl<A, T> Drop for AsyncComputedNode<A, T> {
    fn drop(&mut self) {
        runtime::release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::reactive::signal;

    #[test]
    fn memoizes_per_key() {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let square = reactive(move |n: &i64| {
            counter.set(counter.get() + 1);
            Ok(n * n)
        });

        for _ in 0..5 {
            assert_eq!(square.call(3).unwrap(), 9);
        }
        assert_eq!(runs.get(), 1);

        assert_eq!(square.call(4).unwrap(), 16);
        assert_eq!(runs.get(), 2);
        assert!(square.is_cached(&3));
        assert!(!square.is_cached(&5));
    }

    #[test]
    fn errors_are_cached_and_returned() {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let failing = reactive(move |_: &()| -> Result<u8> {
            counter.set(counter.get() + 1);
            Err(ReactiveError::computation("bad input"))
        });

        assert!(failing.get().is_err());
        assert!(failing.get().is_err());
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn custom_param_key_shares_nodes() {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let by_len = reactive_with(
            move |s: &String| {
                counter.set(counter.get() + 1);
                Ok(s.len())
            },
            ReactiveOptions::new().param_key(|s: &String| s.len() as u64),
        );

        assert_eq!(by_len.call("abc".into()).unwrap(), 3);
        assert_eq!(by_len.call("xyz".into()).unwrap(), 3);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn method_uses_owner_scope() {
        struct Store {
            scope: Scope,
        }
        impl ScopeOwner for Store {
            fn scope(&self) -> &Scope {
                &self.scope
            }
        }

        let store = Store { scope: Scope::new() };
        let label = reactive_method(&store, |n: &u8| Ok(format!("#{n}")), ReactiveOptions::new());
        let in_root = Scope::root().node_count();

        assert_eq!(label.call(1).unwrap(), "#1");
        assert_eq!(store.scope.node_count(), 1);
        assert_eq!(Scope::root().node_count(), in_root);
    }

    #[test]
    fn equal_recompute_stops_propagation() {
        let input = signal(2);
        let downstream_runs = Rc::new(Cell::new(0));

        let i = input.clone();
        let parity = reactive(move |_: &()| Ok(i.get() % 2));
        let p = parity.clone();
        let counter = downstream_runs.clone();
        let label = reactive(move |_: &()| {
            counter.set(counter.get() + 1);
            Ok(if p.get()? == 0 { "even" } else { "odd" })
        });

        assert_eq!(label.get().unwrap(), "even");
        input.set(4);
        assert_eq!(label.get().unwrap(), "even");
        assert_eq!(downstream_runs.get(), 1);
    }

    #[tokio::test]
    async fn async_node_reuses_handle() {
        let input = signal(1);
        let i = input.clone();
        let doubled = reactive_async(move |_: ()| {
            let i = i.clone();
            async move {
                tokio::task::yield_now().await;
                Ok(i.get() * 2)
            }
        });

        let first = doubled.get();
        assert_eq!(first.clone().await.unwrap(), 2);

        input.set(5);
        let second = doubled.get();
        assert!(first.ptr_eq(&second));
        assert_eq!(second.await.unwrap(), 10);
    }
}
