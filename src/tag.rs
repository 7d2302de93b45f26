//! Tag manager: isolated task namespaces and operations across them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, LimitKind, Result};
use crate::git;
use crate::graph::{self, DependentRef, DependentsIndex};
use crate::id::{dedup_dependencies, Dependency, TagName, TaskId};
use crate::store::{StatusChangesByTag, Store};
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Master,
    Feature,
    Bugfix,
    Release,
    Experiment,
    Other,
}

impl TagKind {
    /// Guess the kind from conventional name prefixes.
    pub fn infer(name: &TagName) -> Self {
        let name = name.as_str();
        let has_prefix = |prefixes: &[&str]| {
            prefixes
                .iter()
                .any(|prefix| name.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('-')))
        };
        if name == "master" || name == "main" {
            TagKind::Master
        } else if has_prefix(&["feature", "feat"]) {
            TagKind::Feature
        } else if has_prefix(&["bugfix", "fix", "hotfix", "bug"]) {
            TagKind::Bugfix
        } else if has_prefix(&["release", "rel"])
            || (name.starts_with('v') && name[1..].starts_with(|ch: char| ch.is_ascii_digit()))
        {
            TagKind::Release
        } else if has_prefix(&["experiment", "exp", "spike"]) {
            TagKind::Experiment
        } else {
            TagKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::Master => "master",
            TagKind::Feature => "feature",
            TagKind::Bugfix => "bugfix",
            TagKind::Release => "release",
            TagKind::Experiment => "experiment",
            TagKind::Other => "other",
        }
    }
}

impl std::fmt::Display for TagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TagKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(TagKind::Master),
            "feature" => Ok(TagKind::Feature),
            "bugfix" => Ok(TagKind::Bugfix),
            "release" => Ok(TagKind::Release),
            "experiment" => Ok(TagKind::Experiment),
            "other" => Ok(TagKind::Other),
            other => Err(Error::InvalidArgument(format!(
                "unknown tag kind '{other}' (expected master|feature|bugfix|release|experiment|other)"
            ))),
        }
    }
}

/// One namespace of tasks.
///
/// Tasks are kept in a flat table keyed by full id; `BTreeMap` order is the
/// depth-first display order and keeps every subtree contiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: TagName,
    pub kind: TagKind,
    /// Tag this one was copied from; a name only, never followed
    pub parent_tag: Option<TagName>,
    pub git_branch: Option<String>,
    pub description: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub tasks: BTreeMap<TaskId, Task>,
}

impl Tag {
    pub fn new(name: TagName, now: DateTime<Utc>) -> Self {
        Self {
            kind: TagKind::infer(&name),
            name,
            parent_tag: None,
            git_branch: None,
            description: String::new(),
            created: now,
            updated: now,
            tasks: BTreeMap::new(),
        }
    }

    /// Counts derived from the task table
    pub fn metadata(&self) -> TagMetadata {
        let count = |status: TaskStatus| self.tasks.values().filter(|t| t.status == status).count();
        TagMetadata {
            task_count: self.tasks.len(),
            completed_count: count(TaskStatus::Done),
            in_progress_count: count(TaskStatus::InProgress),
            blocked_count: count(TaskStatus::Blocked),
        }
    }

    pub fn next_top_level_id(&self) -> TaskId {
        let max = self
            .tasks
            .keys()
            .filter(|id| id.is_top_level())
            .map(TaskId::last_segment)
            .max()
            .unwrap_or(0);
        TaskId::top(max + 1)
    }

    pub fn next_child_id(&self, parent: &TaskId) -> TaskId {
        let max = self
            .tasks
            .keys()
            .filter(|id| id.is_child_of(parent))
            .map(TaskId::last_segment)
            .max()
            .unwrap_or(0);
        parent.child(max + 1)
    }

    /// `root` followed by all of its descendants, in id order
    pub fn subtree(&self, root: &TaskId) -> Vec<TaskId> {
        self.tasks
            .range(root.clone()..)
            .map(|(id, _)| id)
            .take_while(|id| *id == root || id.is_descendant_of(root))
            .cloned()
            .collect()
    }
}

/// Derived per-tag counts; never stored authoritatively
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TagMetadata {
    pub task_count: usize,
    pub completed_count: usize,
    pub in_progress_count: usize,
    pub blocked_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagSummary {
    pub name: TagName,
    pub kind: TagKind,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tag: Option<TagName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub description: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: TagMetadata,
}

impl TagSummary {
    fn of(tag: &Tag, active: &TagName) -> Self {
        Self {
            name: tag.name.clone(),
            kind: tag.kind,
            active: &tag.name == active,
            parent_tag: tag.parent_tag.clone(),
            git_branch: tag.git_branch.clone(),
            description: tag.description.clone(),
            created: tag.created,
            updated: tag.updated,
            metadata: tag.metadata(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateTagOptions {
    /// Deep-copy this tag's tasks and record it as `parent_tag`
    pub copy_from: Option<TagName>,
    pub description: Option<String>,
    /// Inferred from the name when unset
    pub kind: Option<TagKind>,
    pub git_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteTagReport {
    pub tag: TagName,
    pub removed_tasks: usize,
    /// References from other tags that became broken (forced deletes only)
    pub broken: Vec<DependentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// How `move_tasks` treats same-tag dependencies leaving the moved set.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveOptions {
    /// Move the dependency targets along (transitively)
    pub with_dependencies: bool,
    /// Keep them behind and point at them with `from:id` references
    pub ignore_dependencies: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveReport {
    pub from: TagName,
    pub to: TagName,
    /// Every moved id, requested subtrees and pulled dependencies alike
    pub moved: Vec<TaskId>,
    /// Ids pulled along by `with_dependencies`
    pub pulled: Vec<TaskId>,
    /// References rewritten to keep pointing at the right task
    pub rewritten: Vec<DependentRef>,
    pub status_changes: StatusChangesByTag,
}

impl Store {
    /// Create a tag, optionally as a deep copy of another.
    pub fn create_tag(&self, name: &TagName, options: CreateTagOptions) -> Result<TagSummary> {
        let max_tags = self.config().limits.max_tags;
        self.commit("create_tag", |state| {
            if state.has_tag(name) {
                return Err(Error::DuplicateTag(name.clone()));
            }
            if state.tag_count() >= max_tags {
                return Err(Error::LimitExceeded {
                    kind: LimitKind::Tags,
                    limit: max_tags,
                });
            }

            let now = Utc::now();
            let mut tag = Tag::new(name.clone(), now);
            if let Some(kind) = options.kind {
                tag.kind = kind;
            }
            tag.description = options.description.unwrap_or_default();
            tag.git_branch = options.git_branch;
            if let Some(source) = &options.copy_from {
                tag.tasks = state.tag(source)?.tasks.clone();
                tag.parent_tag = Some(source.clone());
            }

            let summary = TagSummary::of(&tag, state.current_tag());
            state.insert_tag(tag);
            tracing::info!(
                tag = %name,
                copy_from = options.copy_from.as_ref().map(|t| t.as_str()),
                tasks = summary.metadata.task_count,
                "created tag"
            );
            Ok(summary)
        })
    }

    /// Create a tag named after the git branch checked out at `repo_path`.
    pub fn create_tag_from_branch(
        &self,
        repo_path: &Path,
        mut options: CreateTagOptions,
    ) -> Result<TagSummary> {
        let branch = git::current_branch_at(repo_path)?;
        let name = TagName::sanitize(&branch)?;
        if options.description.is_none() {
            options.description = Some(format!("Tasks for branch {branch}"));
        }
        options.git_branch = Some(branch);
        self.create_tag(&name, options)
    }

    /// Delete a tag and all its tasks.
    ///
    /// The active tag cannot be deleted. Explicit references from other tags
    /// make the deletion fail unless `force`, which turns them into broken
    /// markers.
    pub fn delete_tag(&self, name: &TagName, force: bool) -> Result<DeleteTagReport> {
        let policy = self.policy();
        self.commit("delete_tag", |state| {
            state.tag(name)?;
            if state.current_tag() == name {
                return Err(Error::ActiveTagDeletion(name.clone()));
            }

            let index = DependentsIndex::build(state, name);
            let mut inbound: Vec<DependentRef> = state
                .tag(name)?
                .tasks
                .keys()
                .flat_map(|id| index.dependents(id).iter().cloned())
                .filter(|dependent| &dependent.tag != name)
                .collect();
            inbound.sort();
            inbound.dedup();

            if !inbound.is_empty() && !force {
                return Err(Error::DependencyInUse {
                    target: format!("tag {name}"),
                    dependents: inbound.iter().map(ToString::to_string).collect(),
                });
            }

            let backup = self.backup("delete_tag")?;
            let now = Utc::now();
            let removed = state.remove_tag(name)?;

            for dependent in &inbound {
                let task = state.task_mut(&dependent.tag, &dependent.id)?;
                let (dead, live): (Vec<Dependency>, Vec<Dependency>) =
                    std::mem::take(&mut task.dependencies)
                        .into_iter()
                        .partition(|dep| dep.tag.as_ref() == Some(name));
                let mut marked = std::mem::take(&mut task.broken_dependencies);
                marked.extend(dead);
                task.dependencies = live;
                task.broken_dependencies = dedup_dependencies(marked);
                task.updated = now;
            }
            let touched: BTreeSet<&TagName> = inbound.iter().map(|d| &d.tag).collect();
            let touched: Vec<&TagName> = touched.into_iter().collect();
            state.settle(&touched, policy, now)?;

            if force && !inbound.is_empty() {
                tracing::warn!(tag = %name, dependents = inbound.len(), "forced tag delete left broken dependencies");
            }
            tracing::info!(tag = %name, tasks = removed.tasks.len(), "deleted tag");
            Ok(DeleteTagReport {
                tag: name.clone(),
                removed_tasks: removed.tasks.len(),
                broken: inbound,
                backup,
            })
        })
    }

    /// Make `name` the active tag.
    pub fn switch_active(&self, name: &TagName) -> Result<()> {
        self.commit("switch_active", |state| {
            state.tag(name)?;
            state.set_current_tag(name.clone());
            tracing::info!(tag = %name, "switched active tag");
            Ok(())
        })
    }

    /// Rename a tag, rewriting lineage pointers, explicit references and the
    /// active pointer.
    pub fn rename_tag(&self, old: &TagName, new: &TagName) -> Result<()> {
        self.commit("rename_tag", |state| {
            state.tag(old)?;
            if state.has_tag(new) {
                return Err(Error::DuplicateTag(new.clone()));
            }
            let now = Utc::now();

            let mut tag = state.remove_tag(old)?;
            tag.name = new.clone();
            tag.updated = now;
            state.insert_tag(tag);

            let rename = |dep: &mut Dependency| {
                if dep.tag.as_ref() == Some(old) {
                    dep.tag = Some(new.clone());
                    true
                } else {
                    false
                }
            };
            let refers_to_old = |tag: &Tag| {
                tag.parent_tag.as_ref() == Some(old)
                    || tag.tasks.values().any(|task| {
                        task.dependencies
                            .iter()
                            .chain(&task.broken_dependencies)
                            .any(|dep| dep.tag.as_ref() == Some(old))
                    })
            };

            let affected: Vec<TagName> = state
                .tags()
                .filter(|(_, tag)| refers_to_old(tag))
                .map(|(name, _)| name.clone())
                .collect();
            for name in &affected {
                let tag = state.tag_mut(name)?;
                if tag.parent_tag.as_ref() == Some(old) {
                    tag.parent_tag = Some(new.clone());
                }
                for task in tag.tasks.values_mut() {
                    let mut changed = false;
                    for dep in task
                        .dependencies
                        .iter_mut()
                        .chain(task.broken_dependencies.iter_mut())
                    {
                        changed |= rename(dep);
                    }
                    if changed {
                        task.updated = now;
                    }
                }
            }

            if state.current_tag() == old {
                state.set_current_tag(new.clone());
            }
            tracing::info!(from = %old, to = %new, rewritten_tags = affected.len(), "renamed tag");
            Ok(())
        })
    }

    /// Tag summaries in name order, optionally filtered by a glob pattern.
    pub fn list_tags(&self, pattern: Option<&str>) -> Result<Vec<TagSummary>> {
        let pattern = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|err| Error::InvalidArgument(format!("invalid tag pattern: {err}")))?;
        let state = self.snapshot()?;
        Ok(state
            .tags()
            .filter(|(name, _)| {
                pattern
                    .as_ref()
                    .map_or(true, |pattern| pattern.matches(name.as_str()))
            })
            .map(|(_, tag)| TagSummary::of(tag, state.current_tag()))
            .collect())
    }

    /// Move task subtrees from one tag to another.
    pub fn move_tasks(
        &self,
        from: &TagName,
        to: &TagName,
        ids: &[TaskId],
        options: MoveOptions,
    ) -> Result<MoveReport> {
        let policy = self.policy();
        let max_tasks = self.config().limits.max_tasks_per_tag;
        self.commit("move_tasks", |state| {
            if from == to {
                return Err(Error::InvalidArgument(
                    "source and target tag are the same".to_string(),
                ));
            }
            if ids.is_empty() {
                return Err(Error::InvalidArgument("no task ids to move".to_string()));
            }
            let source = state.tag(from)?;
            let target = state.tag(to)?;

            let mut moving: BTreeSet<TaskId> = BTreeSet::new();
            for id in ids {
                if !source.tasks.contains_key(id) {
                    return Err(Error::TaskNotFound {
                        tag: from.clone(),
                        id: id.clone(),
                    });
                }
                moving.extend(source.subtree(id));
            }
            let requested: BTreeSet<TaskId> = moving.clone();

            // Same-tag targets outside the moved set, pulled in to a fixed point
            // when requested.
            let outward = |moving: &BTreeSet<TaskId>| -> BTreeMap<TaskId, Vec<TaskId>> {
                let mut outward: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
                for id in moving {
                    let Some(task) = source.tasks.get(id) else {
                        continue;
                    };
                    for dep in &task.dependencies {
                        if dep.tag.is_none()
                            && !moving.contains(&dep.id)
                            && source.tasks.contains_key(&dep.id)
                        {
                            outward.entry(dep.id.clone()).or_default().push(id.clone());
                        }
                    }
                }
                outward
            };
            let mut leaving = outward(&moving);
            if options.with_dependencies {
                while !leaving.is_empty() {
                    for target_id in leaving.keys() {
                        moving.extend(source.subtree(target_id));
                    }
                    leaving = outward(&moving);
                }
            } else if !leaving.is_empty() && !options.ignore_dependencies {
                return Err(Error::DependencyInUse {
                    target: leaving
                        .keys()
                        .map(|id| format!("{from}:{id}"))
                        .collect::<Vec<_>>()
                        .join(", "),
                    dependents: leaving
                        .values()
                        .flatten()
                        .map(|id| format!("{from}:{id}"))
                        .collect(),
                });
            }

            for id in &moving {
                if target.tasks.contains_key(id) {
                    return Err(Error::DuplicateId {
                        tag: to.clone(),
                        id: id.clone(),
                    });
                }
                if let Some(parent) = id.parent() {
                    if !moving.contains(&parent) && !target.tasks.contains_key(&parent) {
                        return Err(Error::ParentNotFound {
                            tag: to.clone(),
                            parent,
                        });
                    }
                }
            }
            if target.tasks.len() + moving.len() > max_tasks {
                return Err(Error::LimitExceeded {
                    kind: LimitKind::TasksPerTag,
                    limit: max_tasks,
                });
            }

            let pulled: Vec<TaskId> = moving.difference(&requested).cloned().collect();
            let now = Utc::now();
            let mut rewritten = Vec::new();

            // Detach the moved tasks and retarget their references.
            let source = state.tag_mut(from)?;
            let mut moved_tasks: Vec<Task> = moving
                .iter()
                .filter_map(|id| source.tasks.remove(id))
                .collect();
            source.updated = now;
            for task in &mut moved_tasks {
                let mut changed = false;
                for dep in task.dependencies.iter_mut().chain(task.broken_dependencies.iter_mut()) {
                    match &dep.tag {
                        None if !moving.contains(&dep.id) => {
                            dep.tag = Some(from.clone());
                            changed = true;
                        }
                        Some(tag) if tag == to => {
                            dep.tag = None;
                            changed = true;
                        }
                        _ => {}
                    }
                }
                if changed {
                    task.updated = now;
                    rewritten.push(DependentRef {
                        tag: to.clone(),
                        id: task.id.clone(),
                    });
                }
            }

            // Everyone else who pointed at a moved task now points into `to`;
            // explicit references from `to` itself become local.
            for name in state.tag_names() {
                let retarget = if &name == to { None } else { Some(to.clone()) };
                let needs_rewrite = state.tag(&name)?.tasks.values().any(|task| {
                    task.dependencies
                        .iter()
                        .chain(&task.broken_dependencies)
                        .any(|dep| dep.target_tag(&name) == from && moving.contains(&dep.id))
                });
                if !needs_rewrite {
                    continue;
                }
                let tag = state.tag_mut(&name)?;
                for task in tag.tasks.values_mut() {
                    let mut changed = false;
                    for dep in task
                        .dependencies
                        .iter_mut()
                        .chain(task.broken_dependencies.iter_mut())
                    {
                        if dep.target_tag(&name) == from && moving.contains(&dep.id) {
                            dep.tag = retarget.clone();
                            changed = true;
                        }
                    }
                    if changed {
                        task.updated = now;
                        rewritten.push(DependentRef {
                            tag: name.clone(),
                            id: task.id.clone(),
                        });
                    }
                }
            }

            let target = state.tag_mut(to)?;
            for mut task in moved_tasks {
                task.dependencies = dedup_dependencies(std::mem::take(&mut task.dependencies));
                target.tasks.insert(task.id.clone(), task);
            }
            target.updated = now;

            graph::check_acyclic(state.tag(to)?)?;
            graph::check_acyclic(state.tag(from)?)?;

            let mut status_changes = StatusChangesByTag::new();
            for name in [from, to] {
                let changes = state.settle(&[name], policy, now)?;
                if !changes.is_empty() {
                    status_changes.insert(name.clone(), changes);
                }
            }

            rewritten.sort();
            rewritten.dedup();
            let moved: Vec<TaskId> = moving.into_iter().collect();
            tracing::info!(from = %from, to = %to, moved = moved.len(), pulled = pulled.len(), "moved tasks");
            Ok(MoveReport {
                from: from.clone(),
                to: to.clone(),
                moved,
                pulled,
                rewritten,
                status_changes,
            })
        })
    }
}
