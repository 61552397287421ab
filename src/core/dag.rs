//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! `DependencyGraph` stores the submitted descriptors as nodes and
//! "must-complete-before" relations as edges. It is built once per batch by
//! the analyzer and is read-only afterwards.

use crate::core::task::{TaskDescriptor, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Why one task must complete before another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyType {
    /// Declared by the caller through `depends_on`.
    Explicit,
    /// Both tasks touch the listed resources.
    ResourceConflict {
        /// Resources both tasks touch.
        resources: Vec<String>,
    },
    /// One task touches a resource statically referencing one the other touches.
    Reference {
        /// Resource touched by the earlier task.
        from: String,
        /// Resource it references, touched by the later task.
        to: String,
    },
}

impl Default for DependencyType {
    fn default() -> Self {
        Self::Explicit
    }
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Explicit => write!(f, "explicit"),
            DependencyType::ResourceConflict { resources } => {
                write!(f, "resources: {}", resources.join(", "))
            }
            DependencyType::Reference { from, to } => write!(f, "reference: {} -> {}", from, to),
        }
    }
}

/// The task dependency graph.
pub struct DependencyGraph {
    graph: DiGraph<TaskDescriptor, DependencyType>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task to the graph.
    ///
    /// If a task with the same id already exists, returns the existing index.
    pub fn add_task(&mut self, task: TaskDescriptor) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency: `from` must complete before `to` can start.
    ///
    /// # Errors
    /// Returns `Validation` if either task is unknown, `CyclicDependency`
    /// naming the cycle if the edge would close one. The graph is left
    /// unchanged on error.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        dep_type: DependencyType,
    ) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // The new edge closes a cycle exactly when `to` already reaches `from`.
        let closes_cycle = has_path_connecting(&self.graph, to_index, from_index, None);
        let edge = self.graph.add_edge(from_index, to_index, dep_type);
        if closes_cycle {
            let cycle = self.find_cycle().unwrap_or_else(|| vec![from.clone(), to.clone()]);
            self.graph.remove_edge(edge);
            return Err(Error::CyclicDependency { cycle });
        }

        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("Task {} not found in graph", id)))
    }

    /// Locate one cycle, returning the ids of the tasks on it in edge order.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        for scc in tarjan_scc(&self.graph) {
            let is_cycle = scc.len() > 1
                || scc
                    .first()
                    .map(|&n| self.graph.find_edge(n, n).is_some())
                    .unwrap_or(false);
            if !is_cycle {
                continue;
            }
            // tarjan_scc yields members in reverse edge order.
            let mut ids: Vec<TaskId> = scc
                .iter()
                .rev()
                .filter_map(|&n| self.graph.node_weight(n).map(|t| t.id.clone()))
                .collect();
            ids.dedup();
            return Some(ids);
        }
        None
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    #[cfg(test)]
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<&DependencyType> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n).map(|t| &t.id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks that must complete before `id`.
    pub fn predecessors(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks waiting on `id`.
    pub fn successors(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every task transitively reachable from `id`, in breadth-first order.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&TaskId> = self.successors(id).into_iter().collect();
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            out.push(next.clone());
            queue.extend(self.successors(next));
        }
        out
    }

    /// Whether every predecessor of `id` is in `completed`.
    pub fn is_ready(&self, id: &TaskId, completed: &HashSet<TaskId>) -> bool {
        self.predecessors(id)
            .into_iter()
            .all(|pred| completed.contains(pred))
    }

    /// All tasks not yet completed whose predecessors are all completed.
    pub fn ready<'a>(&'a self, completed: &HashSet<TaskId>) -> Vec<&'a TaskDescriptor> {
        self.graph
            .node_weights()
            .filter(|task| !completed.contains(&task.id) && self.is_ready(&task.id, completed))
            .collect()
    }

    /// Tasks in an order where each comes after all of its predecessors.
    pub fn topological_order(&self) -> Result<Vec<&TaskDescriptor>> {
        let sorted = toposort(&self.graph, None).map_err(|_| Error::CyclicDependency {
            cycle: self.find_cycle().unwrap_or_default(),
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Descriptors in declaration (insertion) order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.graph.node_weights()
    }

    /// Position of a task in declaration order.
    pub fn declaration_index(&self, id: &TaskId) -> Option<usize> {
        self.task_index.get(id).map(|index| index.index())
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
