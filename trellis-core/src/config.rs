//! Configuration
//!
//! Every primitive is configured through a small builder. The defaults are
//! structural equality, a memo key derived from the arguments' `Hash`, and
//! garbage collection of unwatched computations.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::rc::Rc;

use crate::reactive::Equals;

pub(crate) type ParamKeyFn<A> = Rc<dyn Fn(&A) -> u64>;
pub(crate) type ShouldGcFn<A> = Rc<dyn Fn(&A) -> bool>;

/// Structural memo key for a set of arguments.
pub fn default_args_key<A: Hash + ?Sized>(args: &A) -> u64 {
    let mut hasher = DefaultHasher::new();
    args.hash(&mut hasher);
    hasher.finish()
}

/// Options for [`crate::signal_with`].
pub struct SignalOptions<T> {
    pub(crate) equals: Equals<T>,
    pub(crate) desc: Option<Rc<str>>,
}

impl<T: PartialEq + 'static> SignalOptions<T> {
    pub fn new() -> Self {
        Self::with_equals(Equals::structural())
    }
}

impl<T: PartialEq + 'static> Default for SignalOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SignalOptions<T> {
    pub fn with_equals(equals: Equals<T>) -> Self {
        Self { equals, desc: None }
    }

    pub fn equals(mut self, equals: Equals<T>) -> Self {
        self.equals = equals;
        self
    }

    pub fn desc(mut self, desc: &str) -> Self {
        self.desc = Some(Rc::from(desc));
        self
    }
}

/// Options for reactive functions, sync or async.
pub struct ReactiveOptions<A, T> {
    pub(crate) equals: Equals<T>,
    pub(crate) id: Option<Rc<str>>,
    pub(crate) desc: Option<Rc<str>>,
    pub(crate) param_key: Option<ParamKeyFn<A>>,
    pub(crate) should_gc: Option<ShouldGcFn<A>>,
}

impl<A, T: PartialEq + 'static> ReactiveOptions<A, T> {
    pub fn new() -> Self {
        Self::with_equals(Equals::structural())
    }
}

impl<A, T: PartialEq + 'static> Default for ReactiveOptions<A, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, T> ReactiveOptions<A, T> {
    pub fn with_equals(equals: Equals<T>) -> Self {
        Self {
            equals,
            id: None,
            desc: None,
            param_key: None,
            should_gc: None,
        }
    }

    /// Replace the equality predicate. `Equals::never()` makes every
    /// recompute count as a change.
    pub fn equals(mut self, equals: Equals<T>) -> Self {
        self.equals = equals;
        self
    }

    /// Stable identifier, used for diagnostics only.
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(Rc::from(id));
        self
    }

    /// Human readable description, used in logs and cyclic errors.
    pub fn desc(mut self, desc: &str) -> Self {
        self.desc = Some(Rc::from(desc));
        self
    }

    /// Derive the memo key from the arguments. Calls with equal keys in one
    /// scope share a node.
    pub fn param_key(mut self, key: impl Fn(&A) -> u64 + 'static) -> Self {
        self.param_key = Some(Rc::new(key));
        self
    }

    /// Decide whether an unwatched node is dropped from its scope. Returning
    /// `false` keeps the cached value warm.
    pub fn should_gc(mut self, policy: impl Fn(&A) -> bool + 'static) -> Self {
        self.should_gc = Some(Rc::new(policy));
        self
    }

    pub(crate) fn label(&self) -> Option<Rc<str>> {
        self.desc.clone().or_else(|| self.id.clone())
    }
}

impl<A, T> fmt::Debug for ReactiveOptions<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveOptions")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .field("param_key", &self.param_key.is_some())
            .field("should_gc", &self.should_gc.is_some())
            .finish()
    }
}

/// Options for [`crate::relay_with`].
pub struct RelayOptions<T> {
    pub(crate) equals: Equals<T>,
    pub(crate) desc: Option<Rc<str>>,
}

impl<T: PartialEq + 'static> RelayOptions<T> {
    pub fn new() -> Self {
        Self::with_equals(Equals::structural())
    }
}

impl<T: PartialEq + 'static> Default for RelayOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RelayOptions<T> {
    pub fn with_equals(equals: Equals<T>) -> Self {
        Self { equals, desc: None }
    }

    pub fn desc(mut self, desc: &str) -> Self {
        self.desc = Some(Rc::from(desc));
        self
    }
}

/// Options for [`crate::task_with`].
#[derive(Debug, Default, Clone)]
pub struct TaskOptions {
    pub(crate) desc: Option<Rc<str>>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desc(mut self, desc: &str) -> Self {
        self.desc = Some(Rc::from(desc));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_is_structural() {
        assert_eq!(default_args_key(&(1, "a")), default_args_key(&(1, "a")));
        assert_ne!(default_args_key(&(1, "a")), default_args_key(&(2, "a")));
    }

    #[test]
    fn label_prefers_desc() {
        let opts = ReactiveOptions::<(), i32>::new().id("sum");
        assert_eq!(opts.label().as_deref(), Some("sum"));

        let opts = opts.desc("running total");
        assert_eq!(opts.label().as_deref(), Some("running total"));
    }
}
