//! Trellis Core
//!
//! This crate provides the core runtime for the Trellis reactive framework.
//! It implements:
//!
//! - Reactive primitives (signals, memoized reactive functions, watchers)
//! - Incremental, glitch-free recomputation over a dependency graph
//! - Async handles that stay part of the graph across `.await` points
//! - Relays that bridge external sources into the graph while observed
//! - Scopes for memoization identity, ambient context values and GC
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Arena of type-erased nodes, dirty propagation, watch counts
//! - `reactive`: Signals, reactive functions, watchers and the runtime
//! - `asynch`: Async handles, tasks and relays
//! - `scope`: Scopes, context keys and garbage collection
//!
//! Everything is single-threaded: primitives are `!Send` and the graph is
//! thread-local.
//!
//! # Example
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use trellis_core::{reactive, signal, watcher};
//!
//! // Create a signal
//! let count = signal(0);
//!
//! // Create a derived value
//! let c = count.clone();
//! let doubled = reactive(move |_: &()| Ok(c.get() * 2));
//!
//! // Observe it
//! let seen = Rc::new(Cell::new(0));
//! let d = doubled.clone();
//! let w = watcher(move || d.get());
//! let s = seen.clone();
//! let _sub = w.add_listener(move || s.set(s.get() + 1));
//!
//! // Update the signal
//! count.set(5);
//! assert_eq!(doubled.get().unwrap(), 10);
//! assert_eq!(seen.get(), 1);
//! ```

pub mod asynch;
pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod scope;

pub use asynch::{relay, relay_with, task, task_with, AsyncHandle, RelayHooks, StateHandle, Status, Task};
pub use config::{default_args_key, ReactiveOptions, RelayOptions, SignalOptions, TaskOptions};
pub use error::{ReactiveError, Result};
pub use reactive::{
    batch, reactive, reactive_async, reactive_async_method, reactive_async_with, reactive_method, reactive_with,
    signal, signal_with, untrack, watcher, watcher_with, AsyncReactiveFn, Equals, ReactiveFn, Runtime, Signal,
    Subscription, Watcher,
};
pub use scope::{
    clear_global_contexts, context, get_context, set_global_contexts, with_contexts, ContextBinding, ContextKey,
    Scope, ScopeOwner,
};
