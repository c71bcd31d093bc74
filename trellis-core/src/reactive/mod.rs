//! Reactive Primitives
//!
//! This module implements the synchronous half of the runtime: signals,
//! reactive functions and watchers, plus the tracking context that ties
//! them together. These primitives form the foundation of Trellis's
//! fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (a reactive function, a watcher or an async
//! step), the read is recorded on the running computation. When the value
//! changes, every dependent is marked dirty.
//!
//! ## Reactive Functions
//!
//! A reactive function is a derived value cached per argument key. It
//! re-evaluates only when one of its dependencies actually changed, and only
//! when it is read.
//!
//! ## Watchers
//!
//! A watcher is where the graph meets the outside world. Listeners added to
//! it are called after writes settle, and while it has listeners it keeps
//! everything it reads watched.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a signal is read, we check if there is an active
//! tracking context and, if so, register the dependency.
//!
//! This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is used by SolidJS, Vue 3, and Leptos.

mod context;
mod equality;
mod memo;
pub(crate) mod runtime;
mod signal;
mod subscriber;

pub use context::{untrack, ReactiveContext, ScopeGuard};
pub use equality::{equals, never_equals, Equals};
pub use memo::{
    reactive, reactive_async, reactive_async_method, reactive_async_with, reactive_method, reactive_with,
    AsyncReactiveFn, ReactiveFn,
};
pub use runtime::{batch, Runtime};
pub use signal::{signal, signal_with, Signal};
pub use subscriber::{watcher, watcher_with, SubscriberId, Subscription, Watcher};
