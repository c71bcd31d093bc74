//! Scopes
//!
//! A scope is an identity and lifetime domain. It owns the computation nodes
//! created inside it, keyed by definition and argument key, and resolves
//! ambient context values by walking its parent chain.
//!
//! Every thread has a root scope. Computations called outside any explicit
//! scope are cached there. Dropping the last handle to a scope drops every
//! node it owns.

mod context;
mod gc;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::reactive::ScopeGuard;

pub use context::{
    clear_global_contexts, context, get_context, set_global_contexts, with_contexts, ContextBinding,
    ContextKey,
};
pub(crate) use context::ContextId;
pub(crate) use gc::collect;

/// Identity of a computation definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DefId(u64);

impl DefId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cache key of a node within a scope: definition plus argument key.
pub(crate) type NodeKey = (DefId, u64);

thread_local! {
    static ROOT: Scope = Scope::new();
}

/// A hierarchical ownership domain for computations and context bindings.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

pub(crate) struct ScopeInner {
    parent: Option<Scope>,
    nodes: RefCell<HashMap<NodeKey, Rc<dyn Any>>>,
    bindings: HashMap<ContextId, Rc<dyn Any>>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let nodes = std::mem::take(self.nodes.get_mut());
        if !nodes.is_empty() {
            debug!(nodes = nodes.len(), "scope dropped");
        }
        drop(nodes);
    }
}

/// Non-owning reference to a scope, held by nodes and suspended tasks.
#[derive(Clone, Default)]
pub(crate) struct WeakScope(Weak<ScopeInner>);

impl WeakScope {
    pub(crate) fn upgrade(&self) -> Option<Scope> {
        self.0.upgrade().map(|inner| Scope { inner })
    }
}

/// Implemented by objects that own a scope, so their methods can be made
/// reactive with [`crate::reactive_method`].
pub trait ScopeOwner {
    fn scope(&self) -> &Scope;
}

impl ScopeOwner for Scope {
    fn scope(&self) -> &Scope {
        self
    }
}

impl Scope {
    /// Create an isolated scope with no parent.
    pub fn new() -> Self {
        Self::with_parent(None, HashMap::new())
    }

    fn with_parent(parent: Option<Scope>, bindings: HashMap<ContextId, Rc<dyn Any>>) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                parent,
                nodes: RefCell::new(HashMap::new()),
                bindings,
            }),
        }
    }

    /// The thread's root scope.
    pub fn root() -> Self {
        ROOT.with(Scope::clone)
    }

    /// The innermost entered scope, or the root.
    pub fn current() -> Self {
        ScopeGuard::current().unwrap_or_else(Self::root)
    }

    /// Create a nested scope whose bindings shadow this one's.
    pub fn child(&self, bindings: impl IntoIterator<Item = ContextBinding>) -> Self {
        let bindings = bindings
            .into_iter()
            .map(|binding| (binding.id, binding.value))
            .collect();
        Self::with_parent(Some(self.clone()), bindings)
    }

    /// Run `f` with this scope current.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = ScopeGuard::enter(self.clone());
        f()
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    /// Number of computation nodes cached directly in this scope.
    pub fn node_count(&self) -> usize {
        self.inner.nodes.borrow().len()
    }

    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope(Rc::downgrade(&self.inner))
    }

    /// Look up the node cached under `key`, creating it with `make` if it
    /// is missing.
    pub(crate) fn get_or_insert_with<N: Any>(&self, key: NodeKey, make: impl FnOnce() -> Rc<N>) -> Rc<N> {
        let existing = self.inner.nodes.borrow().get(&key).cloned();
        if let Some(node) = existing.and_then(|node| node.downcast::<N>().ok()) {
            return node;
        }

        let created = make();
        let replaced = self
            .inner
            .nodes
            .borrow_mut()
            .insert(key, created.clone() as Rc<dyn Any>);
        drop(replaced);
        created
    }

    pub(crate) fn contains(&self, key: &NodeKey) -> bool {
        self.inner.nodes.borrow().contains_key(key)
    }

    pub(crate) fn remove(&self, key: &NodeKey) -> Option<Rc<dyn Any>> {
        self.inner.nodes.borrow_mut().remove(key)
    }

    /// Resolve a context binding by walking from this scope to the root.
    pub(crate) fn lookup(&self, id: ContextId) -> Option<Rc<dyn Any>> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(value) = current.inner.bindings.get(&id) {
                return Some(Rc::clone(value));
            }
            scope = current.parent();
        }
        None
    }

    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("nodes", &self.node_count())
            .field("bindings", &self.inner.bindings.len())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}
