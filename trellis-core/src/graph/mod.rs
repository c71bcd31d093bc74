//! Dependency Graph
//!
//! This module implements the computational dependency graph that tracks
//! relationships between reactive values and computations.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes represent state cells, memoized computations and async handle
//!   version cells
//! - Edges represent dependencies: if A reads B, there is an edge from B to A
//!
//! When a cell changes, we traverse the graph to find all affected nodes and
//! mark them dirty. The runtime then decides, on read, which dirty nodes
//! actually need to recompute.
//!
//! # Design Decisions
//!
//! 1. Nodes live in a single arena addressed by generational ids. Edges store
//!    ids, never owning references, so releasing a node can never be blocked
//!    by a back-reference and stale ids are detectable.
//!
//! 2. The graph holds only type-erased metadata. Typed values live with the
//!    primitive that owns the node.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod node;
mod scheduler;

pub use node::{Node, NodeId, NodeKind, NodeState};
pub(crate) use node::Evaluate;
pub use scheduler::{InstallMode, Propagation, Scheduler, WatchTransition};
