//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a cell, computation or
//! async handle is read, the current consumer records it together with the
//! version it observed.
//!
//! # Implementation
//!
//! Two thread-local stacks are kept:
//!
//! - the consumer stack: one frame per running evaluation (or resumed async
//!   step), collecting dependencies
//! - the scope stack: the scope new computations are keyed into and ambient
//!   context values are resolved from
//!
//! Async steps save both tops when they are created and push them again on
//! every resumption, so reads after an `.await` are attributed to the right
//! computation and scope even though other work ran in between.

use std::cell::RefCell;

use indexmap::IndexMap;

use crate::graph::NodeId;
use crate::scope::Scope;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
    static SCOPE_STACK: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
#[derive(Debug)]
struct ContextEntry {
    /// The node dependencies are attributed to. `None` means untracked.
    consumer: Option<NodeId>,
    /// Dependencies collected during this frame, with the version seen.
    dependencies: IndexMap<NodeId, u64>,
}

/// Guard that pops the context when dropped.
///
/// This keeps the context stack balanced even if the computation panics.
pub struct ReactiveContext {
    consumer: Option<NodeId>,
    finished: bool,
}

impl ReactiveContext {
    /// Enter a new reactive context for the given consumer.
    ///
    /// While this context is active, reads register the consumer as a
    /// dependent. The context exits when the returned guard is dropped.
    pub fn enter(consumer: Option<NodeId>) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                consumer,
                dependencies: IndexMap::new(),
            });
        });

        Self {
            consumer,
            finished: false,
        }
    }

    /// Enter a frame that records nothing.
    pub fn untracked() -> Self {
        Self::enter(None)
    }

    /// Check if reads are currently being tracked.
    pub fn is_active() -> bool {
        Self::current_consumer().is_some()
    }

    /// Number of open frames, tracked or not.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }

    /// Get the current consumer, if any.
    pub fn current_consumer() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.consumer))
    }

    /// Record a dependency on `id` at `version`.
    ///
    /// A repeated read in the same frame keeps its first position and
    /// updates the version seen.
    pub fn track_dependency(id: NodeId, version: u64) {
        CONTEXT_STACK.with(|stack| {
            if let Some(entry) = stack.borrow_mut().last_mut() {
                if entry.consumer.is_some() && entry.consumer != Some(id) {
                    entry.dependencies.insert(id, version);
                }
            }
        });
    }

    /// Exit the context and return the dependencies it collected.
    pub fn finish(mut self) -> IndexMap<NodeId, u64> {
        self.finished = true;
        Self::pop(self.consumer)
            .map(|entry| entry.dependencies)
            .unwrap_or_default()
    }

    fn pop(expected: Option<NodeId>) -> Option<ContextEntry> {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Verify we're popping the right context.
            if let Some(entry) = &popped {
                debug_assert_eq!(
                    entry.consumer, expected,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    expected, entry.consumer
                );
            }
            popped
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        if !self.finished {
            Self::pop(self.consumer);
        }
    }
}

/// Guard that makes a scope current until dropped.
pub struct ScopeGuard {
    _private: (),
}

impl ScopeGuard {
    pub fn enter(scope: Scope) -> Self {
        SCOPE_STACK.with(|stack| stack.borrow_mut().push(scope));
        Self { _private: () }
    }

    /// The innermost entered scope, if any.
    pub fn current() -> Option<Scope> {
        SCOPE_STACK.with(|stack| stack.borrow().last().cloned())
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        // `try_with`: scopes may be dropped while thread-locals are torn down.
        let popped = SCOPE_STACK
            .try_with(|stack| stack.borrow_mut().pop())
            .ok()
            .flatten();
        drop(popped);
    }
}

/// Run `f` without recording any dependency.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = ReactiveContext::untracked();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, Scheduler};

    fn ids(count: usize) -> Vec<NodeId> {
        let mut scheduler = Scheduler::new();
        (0..count).map(|_| scheduler.add_node(Node::source())).collect()
    }

    #[test]
    fn context_tracks_consumer() {
        let id = ids(1)[0];

        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current_consumer().is_none());

        {
            let _ctx = ReactiveContext::enter(Some(id));
            assert!(ReactiveContext::is_active());
            assert_eq!(ReactiveContext::current_consumer(), Some(id));
        }

        // Context should be cleaned up after drop
        assert!(!ReactiveContext::is_active());
        assert_eq!(ReactiveContext::depth(), 0);
    }

    #[test]
    fn context_collects_versions_in_read_order() {
        let ids = ids(3);
        let ctx = ReactiveContext::enter(Some(ids[0]));

        ReactiveContext::track_dependency(ids[1], 4);
        ReactiveContext::track_dependency(ids[2], 1);
        ReactiveContext::track_dependency(ids[1], 5);
        // Self reads are never recorded.
        ReactiveContext::track_dependency(ids[0], 9);

        let deps = ctx.finish();
        let collected: Vec<_> = deps.into_iter().collect();
        assert_eq!(collected, vec![(ids[1], 5), (ids[2], 1)]);
    }

    #[test]
    fn nested_contexts_are_isolated() {
        let ids = ids(4);

        let outer = ReactiveContext::enter(Some(ids[0]));
        ReactiveContext::track_dependency(ids[2], 0);
        {
            let inner = ReactiveContext::enter(Some(ids[1]));
            ReactiveContext::track_dependency(ids[3], 0);
            assert_eq!(inner.finish().len(), 1);
        }
        assert_eq!(ReactiveContext::current_consumer(), Some(ids[0]));
        let deps = outer.finish();
        assert!(deps.contains_key(&ids[2]));
        assert!(!deps.contains_key(&ids[3]));
    }

    #[test]
    fn untrack_hides_reads() {
        let ids = ids(2);
        let ctx = ReactiveContext::enter(Some(ids[0]));
        untrack(|| ReactiveContext::track_dependency(ids[1], 0));
        assert!(ctx.finish().is_empty());
    }
}
