//! Update Scheduler
//!
//! The scheduler owns the node arena and every edge between nodes. It never
//! runs user code: it only records dependencies, propagates dirtiness and
//! counts watchers. Recomputation is driven by the reactive runtime on read.
//!
//! # Algorithm
//!
//! Writes push, reads pull:
//!
//! 1. When a source changes, its version is bumped and every transitive
//!    dependent is marked `Dirty`. Propagation stops at nodes that are
//!    already dirty, so each node is visited at most once per write.
//! 2. No computation runs during propagation.
//! 3. A later read re-validates a dirty node by comparing the versions it
//!    recorded against the live versions of its dependencies, and only
//!    recomputes when one of them moved.
//!
//! Watch counts are propagated along dependency edges: a watched node holds
//! one watch on each of its dependencies. Transitions `0 -> 1` and `1 -> 0`
//! are reported to the caller, which runs activation hooks once the graph is
//! no longer borrowed.

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeKind, NodeState};

/// A watch-count edge crossing zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTransition {
    Watched(NodeId),
    Unwatched(NodeId),
}

/// How a finished tracking frame installs its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// A full evaluation: the collected set replaces the previous one.
    Replace,

    /// A resumed async step: the collected set is merged into the existing
    /// one.
    Extend,
}

/// Result of propagating a write.
#[derive(Debug, Default)]
pub struct Propagation {
    /// Number of nodes that went from clean to dirty.
    pub dirtied: usize,

    /// Watcher roots that need listener notification after settling.
    pub notify: SmallVec<[NodeId; 4]>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// The update scheduler manages the dependency graph.
pub struct Scheduler {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Scheduler {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    /// Remove a node from the graph.
    ///
    /// Edges pointing at the node from its dependencies are removed. Its
    /// dependents keep their recorded entry, which no longer resolves, so
    /// they recompute and reconnect on their next read. The returned list is
    /// those dependents.
    pub fn remove_node(&mut self, id: NodeId) -> SmallVec<[NodeId; 4]> {
        let Some(node) = self.take(id) else {
            return SmallVec::new();
        };
        self.live -= 1;

        for dep in node.dependencies.keys() {
            if let Some(dep_node) = self.get_node_mut(*dep) {
                dep_node.dependents.swap_remove(&id);
            }
        }

        node.dependents.into_iter().collect()
    }

    fn take(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.node.is_none() {
            return None;
        }
        let node = slot.node.take();
        self.free.push(id.index);
        node
    }

    /// Get a reference to a node, if the id is still live.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    /// Get a mutable reference to a node, if the id is still live.
    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// Current version of a node, `None` once it has been released.
    pub fn version(&self, id: NodeId) -> Option<u64> {
        self.get_node(id).map(|node| node.version)
    }

    pub fn set_state(&mut self, id: NodeId, state: NodeState) {
        if let Some(node) = self.get_node_mut(id) {
            node.state = state;
            if state != NodeState::Computing {
                node.stale = false;
            }
        }
    }

    /// Finish an evaluation: bump the version if the value changed and
    /// settle the state. A node dirtied while computing stays dirty.
    pub fn finish_evaluation(&mut self, id: NodeId, changed: bool) {
        if let Some(node) = self.get_node_mut(id) {
            if changed {
                node.version += 1;
            }
            node.computed = true;
            node.state = if node.stale {
                NodeState::Dirty
            } else {
                NodeState::Clean
            };
            node.stale = false;
        }
    }

    /// Bump a source's version and mark its transitive dependents dirty.
    pub fn mark_changed(&mut self, source: NodeId) -> Propagation {
        let roots: SmallVec<[NodeId; 8]> = match self.get_node_mut(source) {
            Some(node) => {
                node.version += 1;
                node.dependents.iter().copied().collect()
            }
            None => return Propagation::default(),
        };
        self.mark_dirty(roots)
    }

    /// Mark the given nodes and their transitive dependents dirty.
    pub fn mark_dirty(&mut self, roots: impl IntoIterator<Item = NodeId>) -> Propagation {
        let mut outcome = Propagation::default();
        let mut stack: Vec<NodeId> = roots.into_iter().collect();

        while let Some(id) = stack.pop() {
            let Some(node) = self.get_node_mut(id) else {
                continue;
            };
            match node.state {
                NodeState::Dirty => continue,
                NodeState::Computing => {
                    node.stale = true;
                    continue;
                }
                NodeState::Clean => {}
            }
            if node.kind != NodeKind::Derived {
                continue;
            }

            node.state = NodeState::Dirty;
            outcome.dirtied += 1;
            if node.notify {
                outcome.notify.push(id);
            }
            stack.extend(node.dependents.iter().copied());
        }

        outcome
    }

    /// Record the dependencies collected for `id` during a tracking frame.
    ///
    /// New edges are added before stale ones are dropped, so a dependency
    /// that stays watched across a re-run never sees a `1 -> 0 -> 1` flap.
    pub fn install_dependencies(
        &mut self,
        id: NodeId,
        collected: IndexMap<NodeId, u64>,
        mode: InstallMode,
    ) -> Vec<WatchTransition> {
        let Some(node) = self.get_node_mut(id) else {
            return Vec::new();
        };

        let mut added: SmallVec<[NodeId; 8]> = SmallVec::new();
        let mut removed: SmallVec<[NodeId; 8]> = SmallVec::new();

        match mode {
            InstallMode::Replace => {
                for dep in collected.keys() {
                    if !node.dependencies.contains_key(dep) {
                        added.push(*dep);
                    }
                }
                for dep in node.dependencies.keys() {
                    if !collected.contains_key(dep) {
                        removed.push(*dep);
                    }
                }
                node.dependencies = collected;
            }
            InstallMode::Extend => {
                for (dep, version) in collected {
                    if node.dependencies.insert(dep, version).is_none() {
                        added.push(dep);
                    }
                }
            }
        }
        node.dependencies.swap_remove(&id);
        added.retain(|dep| *dep != id);
        removed.retain(|dep| *dep != id);
        let watched = node.watch_count > 0;

        for dep in &added {
            if let Some(dep_node) = self.get_node_mut(*dep) {
                dep_node.dependents.insert(id);
            }
        }
        for dep in &removed {
            if let Some(dep_node) = self.get_node_mut(*dep) {
                dep_node.dependents.swap_remove(&id);
            }
        }

        let mut transitions = Vec::new();
        if watched {
            for dep in added {
                self.watch_into(dep, &mut transitions);
            }
            for dep in removed {
                self.unwatch_into(dep, &mut transitions);
            }
        }
        transitions
    }

    /// Add one watch to `id`, propagating to its dependencies on `0 -> 1`.
    pub fn watch(&mut self, id: NodeId) -> Vec<WatchTransition> {
        let mut transitions = Vec::new();
        self.watch_into(id, &mut transitions);
        transitions
    }

    /// Remove one watch from `id`, propagating to its dependencies on
    /// `1 -> 0`.
    pub fn unwatch(&mut self, id: NodeId) -> Vec<WatchTransition> {
        let mut transitions = Vec::new();
        self.unwatch_into(id, &mut transitions);
        transitions
    }

    fn watch_into(&mut self, id: NodeId, transitions: &mut Vec<WatchTransition>) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(node) = self.get_node_mut(id) else {
                continue;
            };
            node.watch_count += 1;
            if node.watch_count == 1 {
                transitions.push(WatchTransition::Watched(id));
                stack.extend(node.dependencies.keys().copied());
            }
        }
    }

    fn unwatch_into(&mut self, id: NodeId, transitions: &mut Vec<WatchTransition>) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(node) = self.get_node_mut(id) else {
                continue;
            };
            if node.watch_count == 0 {
                continue;
            }
            node.watch_count -= 1;
            if node.watch_count == 0 {
                transitions.push(WatchTransition::Unwatched(id));
                stack.extend(node.dependencies.keys().copied());
            }
        }
    }

    /// Get the total number of live nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.live
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_derived(scheduler: &mut Scheduler) -> NodeId {
        let id = scheduler.add_node(Node::derived());
        scheduler.finish_evaluation(id, true);
        id
    }

    fn edges(scheduler: &mut Scheduler, id: NodeId, deps: &[NodeId]) -> Vec<WatchTransition> {
        let collected = deps
            .iter()
            .map(|dep| (*dep, scheduler.version(*dep).unwrap_or_default()))
            .collect();
        scheduler.install_dependencies(id, collected, InstallMode::Replace)
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut scheduler = Scheduler::new();

        let id1 = scheduler.add_node(Node::source());
        let id2 = scheduler.add_node(Node::derived());
        assert_eq!(scheduler.node_count(), 2);

        scheduler.remove_node(id1);
        assert_eq!(scheduler.node_count(), 1);
        assert!(scheduler.get_node(id1).is_none());
        assert!(scheduler.get_node(id2).is_some());
    }

    #[test]
    fn reused_slot_rejects_stale_id() {
        let mut scheduler = Scheduler::new();
        let old = scheduler.add_node(Node::source());
        scheduler.remove_node(old);

        let new = scheduler.add_node(Node::source());
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(scheduler.get_node(old).is_none());
        assert!(scheduler.version(old).is_none());
    }

    #[test]
    fn install_links_both_directions() {
        let mut scheduler = Scheduler::new();
        let source = scheduler.add_node(Node::source());
        let derived = clean_derived(&mut scheduler);

        edges(&mut scheduler, derived, &[source]);
        assert!(scheduler.get_node(source).unwrap().dependents().contains(&derived));
        assert!(scheduler.get_node(derived).unwrap().dependencies().contains_key(&source));

        edges(&mut scheduler, derived, &[]);
        assert!(!scheduler.get_node(source).unwrap().dependents().contains(&derived));
        assert!(scheduler.get_node(derived).unwrap().dependencies().is_empty());
    }

    #[test]
    fn mark_changed_propagates_once_per_node() {
        let mut scheduler = Scheduler::new();

        // Diamond: source -> (left, right) -> bottom
        let source = scheduler.add_node(Node::source());
        let left = clean_derived(&mut scheduler);
        let right = clean_derived(&mut scheduler);
        let bottom = clean_derived(&mut scheduler);
        edges(&mut scheduler, left, &[source]);
        edges(&mut scheduler, right, &[source]);
        edges(&mut scheduler, bottom, &[left, right]);

        let outcome = scheduler.mark_changed(source);
        assert_eq!(outcome.dirtied, 3);
        assert_eq!(scheduler.version(source), Some(1));
        for id in [left, right, bottom] {
            assert_eq!(scheduler.get_node(id).unwrap().state(), NodeState::Dirty);
        }

        // Already dirty: nothing new to visit.
        let outcome = scheduler.mark_changed(source);
        assert_eq!(outcome.dirtied, 0);
    }

    #[test]
    fn computing_nodes_become_stale() {
        let mut scheduler = Scheduler::new();
        let source = scheduler.add_node(Node::source());
        let derived = clean_derived(&mut scheduler);
        edges(&mut scheduler, derived, &[source]);

        scheduler.set_state(derived, NodeState::Computing);
        scheduler.mark_changed(source);
        scheduler.finish_evaluation(derived, false);

        assert_eq!(scheduler.get_node(derived).unwrap().state(), NodeState::Dirty);
    }

    #[test]
    fn watch_counts_follow_edges() {
        let mut scheduler = Scheduler::new();
        let source = scheduler.add_node(Node::source());
        let middle = clean_derived(&mut scheduler);
        let top = clean_derived(&mut scheduler);
        edges(&mut scheduler, middle, &[source]);
        edges(&mut scheduler, top, &[middle]);

        let transitions = scheduler.watch(top);
        assert_eq!(transitions.len(), 3);
        assert!(transitions.contains(&WatchTransition::Watched(source)));

        // A second watcher does not re-activate anything.
        assert!(scheduler.watch(top).is_empty());
        assert!(scheduler.unwatch(top).is_empty());

        let transitions = scheduler.unwatch(top);
        assert_eq!(transitions.len(), 3);
        assert_eq!(scheduler.get_node(source).unwrap().watch_count(), 0);
    }

    #[test]
    fn rewiring_a_watched_node_moves_watches() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.add_node(Node::source());
        let b = scheduler.add_node(Node::source());
        let top = clean_derived(&mut scheduler);
        edges(&mut scheduler, top, &[a]);
        scheduler.watch(top);

        let transitions = edges(&mut scheduler, top, &[b]);
        assert_eq!(
            transitions,
            vec![WatchTransition::Watched(b), WatchTransition::Unwatched(a)]
        );
    }

    #[test]
    fn removing_a_node_reports_dependents() {
        let mut scheduler = Scheduler::new();
        let source = scheduler.add_node(Node::source());
        let middle = clean_derived(&mut scheduler);
        let top = clean_derived(&mut scheduler);
        edges(&mut scheduler, middle, &[source]);
        edges(&mut scheduler, top, &[middle]);

        let dependents = scheduler.remove_node(middle);
        assert_eq!(dependents.as_slice(), &[top]);
        assert!(scheduler.get_node(source).unwrap().dependents().is_empty());
        // The dangling entry stays so the dependent notices on re-validation.
        assert!(scheduler.get_node(top).unwrap().dependencies().contains_key(&middle));
    }
}
