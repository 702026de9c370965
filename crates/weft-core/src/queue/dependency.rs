//! Dependency graph for managing task dependencies.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! The graph only answers structural questions (who waits for whom, is
//! there a cycle). Whether a dependency is satisfied is decided from task
//! status in the store.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use crate::domain::TaskId;

/// Dependency graph for tracking task dependencies.
///
/// Sets are ordered so that walking dependents is deterministic (ULID
/// order, i.e. roughly creation order).
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on
    edges: HashMap<TaskId, BTreeSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it
    reverse_edges: HashMap<TaskId, BTreeSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// add_dependency(b, a) means "B waits for A":
    /// - edges: B -> {A}
    /// - reverse_edges: A -> {B}
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Remove a dependency: `task` no longer depends on `depends_on`.
    pub fn remove_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Adds all of `task`'s dependencies, unless doing so would close a
    /// cycle. On a cycle nothing is added and the cycle path is returned.
    pub fn try_add_dependencies(
        &mut self,
        task: TaskId,
        depends_on: &[TaskId],
    ) -> Result<(), Vec<TaskId>> {
        for &dep in depends_on {
            self.add_dependency(task, dep);
        }
        if let Some(cycle) = self.detect_cycle_from(task) {
            for &dep in depends_on {
                self.remove_dependency(task, dep);
            }
            return Err(cycle);
        }
        Ok(())
    }

    /// Drops every edge touching `task` (used when the task leaves the
    /// store).
    pub fn remove_task(&mut self, task: TaskId) {
        for dep in self.get_dependencies(task) {
            self.remove_dependency(task, dep);
        }
        for waiter in self.get_waiting_tasks(task) {
            self.remove_dependency(waiter, task);
        }
    }

    pub fn clear(&mut self) {
        self.edges.clear();
        self.reverse_edges.clear();
    }

    /// Tasks that were waiting for `task`.
    ///
    /// Returns every waiter, even those with other unfinished dependencies;
    /// the caller checks whether all dependencies are resolved.
    pub fn get_waiting_tasks(&self, task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Detect a cycle reachable from `start`, returned as a path that starts
    /// and ends on the same task. O(V + E).
    fn detect_cycle_from(&self, start: TaskId) -> Option<Vec<TaskId>> {
        let mut colors = HashMap::new();
        let mut path = Vec::new();
        self.dfs_cycle(start, &mut colors, &mut path)
    }

    fn dfs_cycle(
        &self,
        node: TaskId,
        colors: &mut HashMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        if let Some(deps) = self.edges.get(&node) {
            for &dep in deps {
                match colors.get(&dep) {
                    Some(Color::Gray) => {
                        // back edge: the cycle is the path suffix from `dep`
                        let from = path.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle = path[from..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn id(n: u128) -> TaskId {
        TaskId::from_ulid(Ulid::from(n))
    }

    #[test]
    fn new_graph_is_empty() {
        let graph = DependencyGraph::new();
        assert!(graph.get_dependencies(id(1)).is_empty());
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let mut graph = DependencyGraph::new();
        let (a, b) = (id(1), id(2));

        graph.add_dependency(b, a); // B depends on A

        assert!(graph.get_dependencies(a).is_empty());
        assert_eq!(graph.get_dependencies(b), vec![a]);
        assert_eq!(graph.get_waiting_tasks(a), vec![b]);
    }

    #[test]
    fn remove_dependency_removes_both_edges() {
        let mut graph = DependencyGraph::new();
        let (a, b) = (id(1), id(2));

        graph.add_dependency(b, a);
        graph.remove_dependency(b, a);

        assert!(graph.get_dependencies(b).is_empty());
        assert!(graph.get_waiting_tasks(a).is_empty());
    }

    #[test]
    fn remove_task_drops_incoming_and_outgoing_edges() {
        let mut graph = DependencyGraph::new();
        let (a, b, c) = (id(1), id(2), id(3));
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);

        graph.remove_task(b);

        assert!(graph.get_waiting_tasks(a).is_empty());
        assert!(graph.get_dependencies(c).is_empty());
        assert!(graph.get_dependencies(b).is_empty());
    }

    #[test]
    fn waiting_tasks_are_ordered() {
        let mut graph = DependencyGraph::new();
        let a = id(1);
        for n in [5, 3, 4, 2] {
            graph.add_dependency(id(n), a);
        }
        assert_eq!(
            graph.get_waiting_tasks(a),
            vec![id(2), id(3), id(4), id(5)]
        );
    }

    #[test]
    fn detect_simple_cycle() {
        let mut graph = DependencyGraph::new();
        let (a, b) = (id(1), id(2));

        graph.add_dependency(a, b);

        let cycle = graph.try_add_dependencies(b, &[a]).unwrap_err();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn detect_self_dependency() {
        let mut graph = DependencyGraph::new();
        let a = id(1);
        assert_eq!(graph.try_add_dependencies(a, &[a]), Err(vec![a, a]));
        assert!(graph.get_dependencies(a).is_empty());
    }

    #[test]
    fn detect_longer_cycle() {
        let mut graph = DependencyGraph::new();
        let (a, b, c, d) = (id(1), id(2), id(3), id(4));

        // B -> C -> D -> B, hanging off A
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);
        graph.add_dependency(d, c);

        let cycle = graph.try_add_dependencies(b, &[d]).unwrap_err();
        assert_eq!(cycle.len(), 4);
        assert!(!cycle.contains(&a));
    }

    #[test]
    fn no_cycle_in_chain_diamond_or_lattice() {
        let mut graph = DependencyGraph::new();
        let (a, b, c, d, e) = (id(1), id(2), id(3), id(4), id(5));

        //     A
        //    / \
        //   B   C
        //   |\ /|
        //   | X |
        //   |/ \|
        //   D   E
        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);
        graph.add_dependency(e, b);
        graph.add_dependency(d, c);
        graph.add_dependency(e, c);

        assert!(graph.try_add_dependencies(e, &[a]).is_ok());
        for node in [a, b, c, d, e] {
            assert!(graph.detect_cycle_from(node).is_none());
        }
    }

    #[test]
    fn try_add_rolls_back_on_cycle() {
        let mut graph = DependencyGraph::new();
        let (a, b) = (id(1), id(2));
        graph.add_dependency(b, a);

        let err = graph.try_add_dependencies(a, &[b]).unwrap_err();
        assert_eq!(err, vec![a, b, a]);
        assert!(graph.get_dependencies(a).is_empty());
        assert_eq!(graph.get_dependencies(b), vec![a]);

        assert!(graph.try_add_dependencies(id(3), &[a, b]).is_ok());
        assert_eq!(graph.get_dependencies(id(3)), vec![a, b]);
    }
}
