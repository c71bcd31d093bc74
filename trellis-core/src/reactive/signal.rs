//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (computation, watcher
//!    or async step), the read is recorded together with the signal's
//!    current version.
//!
//! 2. When a signal is written with a value that is not `equals`-equal to
//!    the current one, its version is bumped and every transitive dependent
//!    is marked dirty.
//!
//! 3. Dependents recompute lazily, the next time they are read.
//!
//! # Memory Layout
//!
//! Each signal consists of:
//! - A node id in the thread's graph (8 bytes)
//! - The value, behind a `RefCell`
//! - The equality predicate

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::equality::Equals;
use super::runtime;
use crate::config::SignalOptions;
use crate::graph::{NodeId, NodeKind};

/// A reactive signal holding a value of type T.
///
/// Cloning a signal yields another handle to the same cell.
///
/// # Example
///
/// ```rust
/// use trellis_core::signal;
///
/// let count = signal(0);
/// assert_eq!(count.get(), 0);
///
/// // Writing an equal value is not a change.
/// assert!(count.set(5));
/// assert!(!count.set(5));
/// ```
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

struct SignalInner<T> {
    id: NodeId,
    value: RefCell<T>,
    equals: Equals<T>,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        runtime::release(self.id);
    }
}

/// Create a signal with structural equality.
pub fn signal<T: PartialEq + 'static>(value: T) -> Signal<T> {
    Signal::new(value)
}

/// Create a signal with explicit options.
pub fn signal_with<T: 'static>(value: T, options: SignalOptions<T>) -> Signal<T> {
    let id = runtime::register(NodeKind::Source, options.desc, None);
    Signal {
        inner: Rc::new(SignalInner {
            id,
            value: RefCell::new(value),
            equals: options.equals,
        }),
    }
}

impl<T: PartialEq + 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        signal_with(value, SignalOptions::new())
    }
}

impl<T: 'static> Signal<T> {
    /// Get the signal's node id.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also registers the
    /// signal as a dependency of the current computation.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        runtime::track_read(self.inner.id);
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value, tracking the read.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        runtime::track_read(self.inner.id);
        f(&self.inner.value.borrow())
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value without tracking.
    pub fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.borrow())
    }

    /// Set a new value. Returns whether it counted as a change.
    ///
    /// An equal value leaves the version alone and dirties nothing.
    pub fn set(&self, value: T) -> bool {
        let unchanged = self.inner.equals.eq(&self.inner.value.borrow(), &value);
        if unchanged {
            return false;
        }

        let previous = self.inner.value.replace(value);
        drop(previous);
        runtime::notify_changed(self.inner.id);
        true
    }

    /// Update the value using a function of the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let next = f(&self.inner.value.borrow());
        self.set(next)
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}
