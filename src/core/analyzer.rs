//! Dependency analysis for a submitted batch.
//!
//! The analyzer turns a flat list of descriptors into a `DependencyGraph`:
//!
//! 1. explicit `depends_on` edges are added first, so a declared cycle fails
//!    fast with the offending tasks named;
//! 2. tasks whose resource sets intersect, or that touch resources linked by
//!    the one-hop reference map, are grouped into conflict components with a
//!    union-find;
//! 3. members of a multi-task component are chained so they run strictly one
//!    after another, in priority then declaration order.
//!
//! The ordering is taken from a single priority-driven topological pass over
//! the explicit edges, so every chain edge points forward in that order and
//! the final graph cannot contain a cycle.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use petgraph::unionfind::UnionFind;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::dag::{DependencyGraph, DependencyType};
use crate::core::task::{Batch, TaskDescriptor, TaskId};
use crate::error::{Error, Result};

/// A maximal set of tasks whose resource footprints transitively overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictComponent {
    /// Position of the component, ordered by its first declared task.
    pub index: usize,
    /// Members in the order they will execute.
    pub tasks: Vec<TaskId>,
    /// Union of the members' resources.
    pub resources: BTreeSet<String>,
}

impl ConflictComponent {
    /// Whether this component forces sequential execution.
    pub fn is_sequential(&self) -> bool {
        self.tasks.len() > 1
    }
}

/// Result of analyzing a batch.
#[derive(Debug)]
pub struct Analysis {
    pub graph: DependencyGraph,
    pub components: Vec<ConflictComponent>,
    /// Global execution order consistent with every edge in `graph`.
    pub order: Vec<TaskId>,
    component_of: HashMap<TaskId, usize>,
}

impl Analysis {
    pub fn component_of(&self, id: &TaskId) -> Option<&ConflictComponent> {
        self.component_of
            .get(id)
            .and_then(|&index| self.components.get(index))
    }

    /// Whether two tasks were placed in the same conflict component.
    #[cfg(test)]
    pub fn same_component(&self, a: &TaskId, b: &TaskId) -> bool {
        match (self.component_of.get(a), self.component_of.get(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }
}

/// Derives the dependency graph from task resource footprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, batch: &Batch) -> Result<Analysis> {
        validate(batch)?;

        let tasks = &batch.tasks;
        let position: HashMap<&TaskId, usize> =
            tasks.iter().enumerate().map(|(i, t)| (&t.id, i)).collect();

        let mut graph = DependencyGraph::new();
        for task in tasks {
            graph.add_task(task.clone());
        }

        for task in tasks {
            for dep in &task.depends_on {
                if !position.contains_key(dep) {
                    return Err(Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
                graph.add_dependency(dep, &task.id, DependencyType::Explicit)?;
            }
        }

        let order = priority_order(tasks, &position);
        let rank: HashMap<&TaskId, usize> = order.iter().enumerate().map(|(i, id)| (id, i)).collect();

        let mut union = UnionFind::<usize>::new(tasks.len());
        let mut owners: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            for resource in &task.resources {
                owners.entry(resource.as_str()).or_default().push(i);
            }
        }
        for members in owners.values() {
            for pair in members.windows(2) {
                union.union(pair[0], pair[1]);
            }
        }
        for (i, task) in tasks.iter().enumerate() {
            for resource in &task.resources {
                let Some(referenced) = batch.references.get(resource) else {
                    continue;
                };
                for target in referenced {
                    for &j in owners.get(target.as_str()).into_iter().flatten() {
                        if i != j {
                            union.union(i, j);
                        }
                    }
                }
            }
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut group_of_root: HashMap<usize, usize> = HashMap::new();
        for i in 0..tasks.len() {
            let root = union.find(i);
            let group = *group_of_root.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[group].push(i);
        }

        let mut components = Vec::with_capacity(groups.len());
        let mut component_of = HashMap::new();
        for (index, mut members) in groups.into_iter().enumerate() {
            members.sort_by_key(|&i| rank[&tasks[i].id]);

            for pair in members.windows(2) {
                let (before, after) = (&tasks[pair[0]], &tasks[pair[1]]);
                let dep_type = conflict_type(before, after, batch);
                debug!(
                    from = %before.id,
                    to = %after.id,
                    reason = %dep_type,
                    "Sequencing conflicting tasks"
                );
                graph.add_dependency(&before.id, &after.id, dep_type)?;
            }

            let resources = members
                .iter()
                .flat_map(|&i| tasks[i].resources.iter().cloned())
                .collect();
            let ids: Vec<TaskId> = members.iter().map(|&i| tasks[i].id.clone()).collect();
            for id in &ids {
                component_of.insert(id.clone(), index);
            }
            components.push(ConflictComponent {
                index,
                tasks: ids,
                resources,
            });
        }

        // Every edge points forward in `order`; this only guards the invariant.
        graph.topological_order()?;

        info!(
            tasks = graph.task_count(),
            edges = graph.dependency_count(),
            components = components.len(),
            sequential = components.iter().filter(|c| c.is_sequential()).count(),
            "Batch analyzed"
        );

        Ok(Analysis {
            graph,
            components,
            order,
            component_of,
        })
    }
}

fn validate(batch: &Batch) -> Result<()> {
    let mut seen = HashSet::new();
    for task in &batch.tasks {
        task.id.validate()?;
        if !seen.insert(&task.id) {
            return Err(Error::Validation(format!("Duplicate task id: {}", task.id)));
        }
    }
    Ok(())
}

/// Topological order over explicit edges, choosing the highest-priority
/// available task first and breaking ties by declaration order.
fn priority_order(tasks: &[TaskDescriptor], position: &HashMap<&TaskId, usize>) -> Vec<TaskId> {
    let mut in_degree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.depends_on {
            if let Some(&d) = position.get(dep) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut available: BinaryHeap<(i32, Reverse<usize>)> = tasks
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] == 0)
        .map(|(i, t)| (t.priority, Reverse(i)))
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some((_, Reverse(i))) = available.pop() {
        order.push(tasks[i].id.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                available.push((tasks[next].priority, Reverse(next)));
            }
        }
    }
    order
}

fn conflict_type(before: &TaskDescriptor, after: &TaskDescriptor, batch: &Batch) -> DependencyType {
    let shared: Vec<String> = before
        .resources
        .intersection(&after.resources)
        .cloned()
        .collect();
    if !shared.is_empty() {
        return DependencyType::ResourceConflict { resources: shared };
    }

    for (from_task, to_task) in [(before, after), (after, before)] {
        for from in &from_task.resources {
            if let Some(to) = batch
                .references
                .get(from)
                .and_then(|refs| refs.iter().find(|r| to_task.resources.contains(*r)))
            {
                return DependencyType::Reference {
                    from: from.clone(),
                    to: to.clone(),
                };
            }
        }
    }

    // Only transitively connected through other members.
    DependencyType::ResourceConflict {
        resources: Vec::new(),
    }
}
