//! Equality predicates deciding whether a write or a recompute counts as a
//! change.
//!
//! An equal result keeps the node's version, so nothing downstream is
//! dirtied or recomputed.

use std::fmt;
use std::rc::Rc;

/// Default strict equality using `PartialEq`.
pub fn equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

/// Equality that never holds: every write and recompute is a change.
pub fn never_equals<T>(_: &T, _: &T) -> bool {
    false
}

/// A shareable equality predicate.
pub struct Equals<T>(Rc<dyn Fn(&T, &T) -> bool>);

impl<T> Equals<T> {
    /// Compare with `PartialEq`.
    pub fn structural() -> Self
    where
        T: PartialEq + 'static,
    {
        Self(Rc::new(equals::<T>))
    }

    /// Treat every value as changed (the `equals: false` setting).
    pub fn never() -> Self
    where
        T: 'static,
    {
        Self(Rc::new(never_equals::<T>))
    }

    /// Use a custom predicate.
    pub fn by(predicate: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self(Rc::new(predicate))
    }

    pub fn eq(&self, a: &T, b: &T) -> bool {
        (self.0)(a, b)
    }
}

impl<T> Clone for Equals<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T: PartialEq + 'static> Default for Equals<T> {
    fn default() -> Self {
        Self::structural()
    }
}

impl<T> fmt::Debug for Equals<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Equals(..)")
    }
}
