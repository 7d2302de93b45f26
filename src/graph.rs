//! Dependency graph engine.
//!
//! Builds a directed graph over one tag's flattened task table (subtasks are
//! ordinary nodes), detects cycles with a three-colour depth-first search,
//! classifies broken and cross-tag references, and serves reverse-edge
//! (dependents) lookups from a lazily rebuilt, generation-keyed index.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::id::{Dependency, TagName, TaskId};
use crate::store::StoreState;
use crate::tag::Tag;

/// Result of validating one tag
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub tag: TagName,
    pub has_circular: bool,
    /// Every cycle found, each as a closed path `[a, b, .., a]`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cycles: Vec<Vec<TaskId>>,
    pub broken_dependencies: Vec<BrokenDependency>,
    pub cross_tag_dependencies: Vec<CrossTagDependency>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        !self.has_circular && self.broken_dependencies.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokenReason {
    /// Target does not exist anywhere it could resolve
    Missing,
    /// Target was force-deleted
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenDependency {
    pub task: TaskId,
    pub dependency: Dependency,
    pub reason: BrokenReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossTagDependency {
    pub task: TaskId,
    pub dependency: Dependency,
    pub target_tag: TagName,
}

/// Same-tag adjacency: task -> tasks it depends on
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<TaskId, Vec<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Only references that resolve inside the tag become edges.
    pub fn build(tag: &Tag) -> Self {
        let edges = tag
            .tasks
            .values()
            .map(|task| {
                let targets = task
                    .dependencies
                    .iter()
                    .filter(|dep| dep.target_tag(&tag.name) == &tag.name)
                    .filter(|dep| tag.tasks.contains_key(&dep.id))
                    .map(|dep| dep.id.clone())
                    .collect();
                (task.id.clone(), targets)
            })
            .collect();
        Self { edges }
    }

    pub fn successors(&self, id: &TaskId) -> &[TaskId] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All cycles reachable by one DFS sweep, in id order.
    ///
    /// An edge into an in-progress node closes a cycle; the path is read off
    /// the DFS stack so callers get every node on it, not just the edge.
    pub fn find_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut marks: HashMap<&TaskId, Mark> = HashMap::new();
        let mut cycles = Vec::new();

        for start in self.edges.keys() {
            if marks.contains_key(start) {
                continue;
            }
            marks.insert(start, Mark::InProgress);
            let mut stack: Vec<(&TaskId, usize)> = vec![(start, 0)];

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let idx = top.1;
                top.1 += 1;

                let successors = self.successors(node);
                let Some(next) = successors.get(idx) else {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                };

                match marks.get(next) {
                    None => {
                        marks.insert(next, Mark::InProgress);
                        stack.push((next, 0));
                    }
                    Some(Mark::InProgress) => {
                        if let Some(pos) = stack.iter().position(|(id, _)| *id == next) {
                            let mut cycle: Vec<TaskId> =
                                stack[pos..].iter().map(|(id, _)| (*id).clone()).collect();
                            cycle.push(next.clone());
                            cycles.push(cycle);
                        }
                    }
                    Some(Mark::Done) => {}
                }
            }
        }

        cycles
    }

    pub fn first_cycle(&self) -> Option<Vec<TaskId>> {
        self.find_cycles().into_iter().next()
    }
}

/// Reject a tag whose same-tag dependency relation has a cycle.
pub fn check_acyclic(tag: &Tag) -> Result<()> {
    match DependencyGraph::build(tag).first_cycle() {
        Some(cycle_path) => Err(Error::CircularDependency {
            tag: tag.name.clone(),
            cycle_path,
        }),
        None => Ok(()),
    }
}

/// Validate one tag against the whole store.
pub fn validate(state: &StoreState, tag_name: &TagName) -> Result<ValidationReport> {
    let tag = state.tag(tag_name)?;
    let cycles = DependencyGraph::build(tag).find_cycles();

    let mut broken_dependencies = Vec::new();
    let mut cross_tag_dependencies = Vec::new();

    for task in tag.tasks.values() {
        for dep in &task.dependencies {
            match &dep.tag {
                Some(target_tag) => {
                    if state.contains_task(target_tag, &dep.id) {
                        cross_tag_dependencies.push(CrossTagDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                            target_tag: target_tag.clone(),
                        });
                    } else {
                        broken_dependencies.push(BrokenDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                            reason: BrokenReason::Missing,
                        });
                    }
                }
                None if tag.tasks.contains_key(&dep.id) => {}
                None => match state.find_tag_with_task(&dep.id, tag_name) {
                    Some(target_tag) => cross_tag_dependencies.push(CrossTagDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                        target_tag: target_tag.clone(),
                    }),
                    None => broken_dependencies.push(BrokenDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                        reason: BrokenReason::Missing,
                    }),
                },
            }
        }
        for dep in &task.broken_dependencies {
            broken_dependencies.push(BrokenDependency {
                task: task.id.clone(),
                dependency: dep.clone(),
                reason: BrokenReason::Deleted,
            });
        }
    }

    Ok(ValidationReport {
        tag: tag_name.clone(),
        has_circular: !cycles.is_empty(),
        cycles,
        broken_dependencies,
        cross_tag_dependencies,
    })
}

/// A task that depends on some target
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DependentRef {
    pub tag: TagName,
    pub id: TaskId,
}

impl std::fmt::Display for DependentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tag, self.id)
    }
}

/// Reverse edges into one tag, including explicit references from other tags
#[derive(Debug, Default)]
pub struct DependentsIndex {
    map: HashMap<TaskId, Vec<DependentRef>>,
}

impl DependentsIndex {
    pub fn build(state: &StoreState, target: &TagName) -> Self {
        let mut map: HashMap<TaskId, Vec<DependentRef>> = HashMap::new();
        for (tag_name, tag) in state.tags() {
            for task in tag.tasks.values() {
                for dep in &task.dependencies {
                    if dep.target_tag(tag_name) != target {
                        continue;
                    }
                    map.entry(dep.id.clone()).or_default().push(DependentRef {
                        tag: tag_name.clone(),
                        id: task.id.clone(),
                    });
                }
            }
        }
        for dependents in map.values_mut() {
            dependents.sort();
            dependents.dedup();
        }
        Self { map }
    }

    pub fn dependents(&self, id: &TaskId) -> &[DependentRef] {
        self.map.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Per-tag dependents indexes keyed by the store generation they were built at.
#[derive(Debug, Default)]
pub struct DependentsCache {
    entries: Mutex<HashMap<TagName, (u64, Arc<DependentsIndex>)>>,
}

impl DependentsCache {
    /// Return the index for `tag`, rebuilding it if the store moved on.
    pub fn get(&self, state: &StoreState, tag: &TagName) -> Result<Arc<DependentsIndex>> {
        state.tag(tag)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::OperationFailed("dependents cache lock poisoned".to_string()))?;
        if let Some((generation, index)) = entries.get(tag) {
            if *generation == state.generation() {
                return Ok(Arc::clone(index));
            }
        }
        tracing::debug!(tag = %tag, generation = state.generation(), "rebuilding dependents index");
        entries.retain(|name, _| state.has_tag(name));
        let index = Arc::new(DependentsIndex::build(state, tag));
        entries.insert(tag.clone(), (state.generation(), Arc::clone(&index)));
        Ok(index)
    }

    /// Number of cached indexes (for diagnostics)
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
