//! Ambient context values.
//!
//! A context key carries a default. Bindings live on scopes; lookup walks
//! from the current scope to the root, then the thread's global bindings,
//! then falls back to the default.
//!
//! Resolution is structural: it depends on which scope is current, not on
//! any cell. Binding a [`crate::Signal`] makes reads of it reactive as usual.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Scope;

pub(crate) type ContextId = u64;

thread_local! {
    static GLOBALS: RefCell<HashMap<ContextId, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Key for an ambient context value of type `T`.
pub struct ContextKey<T> {
    id: ContextId,
    default: Rc<T>,
}

/// A value bound to a context key, ready to install on a scope.
pub struct ContextBinding {
    pub(crate) id: ContextId,
    pub(crate) value: Rc<dyn Any>,
}

/// Create a new context key with the given default.
pub fn context<T: 'static>(default: T) -> ContextKey<T> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    ContextKey {
        id: COUNTER.fetch_add(1, Ordering::Relaxed),
        default: Rc::new(default),
    }
}

impl<T: 'static> ContextKey<T> {
    /// Bind a value to this key.
    pub fn bind(&self, value: T) -> ContextBinding {
        ContextBinding {
            id: self.id,
            value: Rc::new(value),
        }
    }

    /// Resolve the key in the current scope.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        get_context(self)
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            default: Rc::clone(&self.default),
        }
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey").field("id", &self.id).finish()
    }
}

impl fmt::Debug for ContextBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBinding").field("id", &self.id).finish()
    }
}

/// Resolve `key` from the current scope chain, the global bindings, or its
/// default.
pub fn get_context<T: Clone + 'static>(key: &ContextKey<T>) -> T {
    let bound = Scope::current()
        .lookup(key.id)
        .or_else(|| GLOBALS.with(|globals| globals.borrow().get(&key.id).cloned()));

    bound
        .and_then(|value| value.downcast_ref::<T>().cloned())
        .unwrap_or_else(|| T::clone(&key.default))
}

/// Run `f` in a fresh child of the current scope carrying `bindings`.
///
/// Computations called inside `f` are cached in that child scope and are
/// dropped with it when `f` returns, unless something else keeps it alive.
pub fn with_contexts<R>(bindings: impl IntoIterator<Item = ContextBinding>, f: impl FnOnce() -> R) -> R {
    Scope::current().child(bindings).run(f)
}

/// Install process-wide bindings, consulted after the scope chain.
pub fn set_global_contexts(bindings: impl IntoIterator<Item = ContextBinding>) {
    GLOBALS.with(|globals| {
        let mut globals = globals.borrow_mut();
        for binding in bindings {
            globals.insert(binding.id, binding.value);
        }
    });
}

pub fn clear_global_contexts() {
    let cleared = GLOBALS.with(|globals| std::mem::take(&mut *globals.borrow_mut()));
    drop(cleared);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_when_unbound() {
        let theme = context("light");
        assert_eq!(get_context(&theme), "light");
    }

    #[test]
    fn nearest_binding_wins() {
        let theme = context("light");
        let outer = Scope::new().child([theme.bind("dark")]);
        let inner = outer.child([theme.bind("sepia")]);

        outer.run(|| assert_eq!(theme.get(), "dark"));
        inner.run(|| assert_eq!(theme.get(), "sepia"));
        assert_eq!(theme.get(), "light");
    }

    #[test]
    fn with_contexts_nests() {
        let depth = context(0u32);
        with_contexts([depth.bind(1)], || {
            assert_eq!(depth.get(), 1);
            with_contexts([depth.bind(2)], || assert_eq!(depth.get(), 2));
            assert_eq!(depth.get(), 1);
        });
        assert_eq!(depth.get(), 0);
    }

    #[test]
    fn globals_sit_between_scopes_and_default() {
        let locale = context("en".to_string());
        set_global_contexts([locale.bind("fr".to_string())]);
        assert_eq!(locale.get(), "fr");

        with_contexts([locale.bind("de".to_string())], || assert_eq!(locale.get(), "de"));

        clear_global_contexts();
        assert_eq!(locale.get(), "en");
    }
}
