//! Graph Nodes
//!
//! This module defines the type-erased metadata stored for every cell,
//! computation and async handle in the dependency graph. Typed values live
//! outside the graph; a node only records versions, edges, validity state
//! and watch counts.

use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};

/// Generational index of a node in the graph arena.
///
/// A slot may be reused after its node is released; the generation makes a
/// stale id detectable instead of silently aliasing the new occupant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeId {
    /// Get the raw slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}v{})", self.index, self.generation)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A leaf value: signal cells and async handle version cells.
    Source,

    /// A memoized computation. Has dependencies and may have dependents.
    Derived,

    /// The version cell of a relay-backed handle. Behaves like a source but
    /// reacts to watch-count transitions.
    Relay,
}

/// Validity state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The cached value is consistent with the recorded dependency versions.
    Clean,

    /// A dependency was written. The cached value must be re-validated
    /// before it is trusted.
    Dirty,

    /// The node is being re-validated or recomputed on the current
    /// evaluation path.
    Computing,
}

/// Capabilities the runtime needs from the typed owner of a node.
///
/// Implemented by computations, watchers and relays. The graph only keeps a
/// weak reference, so the owner's lifetime decides the node's lifetime.
pub(crate) trait Evaluate {
    /// Run the computation inside the current tracking frame. Returns
    /// whether the cached value changed.
    fn evaluate(&self) -> bool {
        false
    }

    /// The scope evaluation should run in.
    fn scope(&self) -> Option<crate::scope::Scope> {
        None
    }

    fn on_watched(&self) {}

    fn on_unwatched(&self) {}

    /// Called for watcher roots once a write has settled.
    fn settle(&self) {}
}

/// A node in the dependency graph.
pub struct Node {
    pub(crate) kind: NodeKind,

    pub(crate) state: NodeState,

    /// Bumped whenever the value this node stands for changes.
    pub(crate) version: u64,

    /// Whether the node has produced a value at least once.
    pub(crate) computed: bool,

    /// Set when a dependency changes while the node is computing, so the
    /// result is not trusted as clean afterwards.
    pub(crate) stale: bool,

    /// Nodes read during the last evaluation with the version seen, in read
    /// order.
    pub(crate) dependencies: IndexMap<NodeId, u64>,

    /// Nodes that read this node. Tracking only, never ownership.
    pub(crate) dependents: IndexSet<NodeId>,

    /// External watchers plus watched dependents.
    pub(crate) watch_count: u32,

    /// Watcher roots are queued for listener notification when dirtied.
    pub(crate) notify: bool,

    pub(crate) label: Option<Rc<str>>,

    pub(crate) owner: Option<Weak<dyn Evaluate>>,
}

impl Node {
    /// Create a new node with the given kind.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            state: match kind {
                NodeKind::Source | NodeKind::Relay => NodeState::Clean,
                // Start dirty to ensure first computation
                NodeKind::Derived => NodeState::Dirty,
            },
            version: 0,
            computed: !matches!(kind, NodeKind::Derived),
            stale: false,
            dependencies: IndexMap::new(),
            dependents: IndexSet::new(),
            watch_count: 0,
            notify: false,
            label: None,
            owner: None,
        }
    }

    pub fn source() -> Self {
        Self::new(NodeKind::Source)
    }

    pub fn derived() -> Self {
        Self::new(NodeKind::Derived)
    }

    pub(crate) fn with_label(mut self, label: Option<Rc<str>>) -> Self {
        self.label = label;
        self
    }

    pub(crate) fn with_owner(mut self, owner: Weak<dyn Evaluate>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn watch_count(&self) -> u32 {
        self.watch_count
    }

    pub fn is_clean(&self) -> bool {
        self.state == NodeState::Clean
    }

    pub fn dependencies(&self) -> &IndexMap<NodeId, u64> {
        &self.dependencies
    }

    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    /// Label used in diagnostics and cyclic-computation errors.
    pub(crate) fn describe(&self, id: NodeId) -> String {
        match &self.label {
            Some(label) => label.to_string(),
            None => format!("{id:?}"),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies.len())
            .field("dependents", &self.dependents.len())
            .field("watch_count", &self.watch_count)
            .field("label", &self.label)
            .finish()
    }
}
