//! Watch-count based reclamation.
//!
//! When a scope-owned computation loses its last watcher, the retention
//! policy decides whether it leaves its scope's cache. A reclaimed node is
//! dropped once the last outstanding handle to it goes away, which releases
//! it from the graph and dirties anything still pointing at it.

use tracing::debug;

use super::{NodeKey, WeakScope};
use crate::config::ShouldGcFn;

/// Apply the retention policy to a node that just became unwatched.
///
/// Returns whether the node was removed from its scope.
pub(crate) fn collect<A>(scope: &WeakScope, key: NodeKey, args: &A, policy: Option<&ShouldGcFn<A>>) -> bool {
    if let Some(policy) = policy {
        if !policy(args) {
            debug!(def = ?key.0, "retained unwatched node");
            return false;
        }
    }

    let Some(scope) = scope.upgrade() else {
        return false;
    };
    let removed = scope.remove(&key);
    let reclaimed = removed.is_some();
    if reclaimed {
        debug!(def = ?key.0, key = key.1, "reclaimed unwatched node");
    }
    drop(removed);
    reclaimed
}
