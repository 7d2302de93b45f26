//! Task store: tag -> flat task table, single writer, many readers.
//!
//! The committed state is an immutable [`StoreState`] behind an `Arc`. Readers
//! clone the `Arc` and never observe a partial mutation. Writers serialize on
//! one mutex, apply their change to a private copy (tags are `Arc`-shared, so
//! only touched tags are cloned), validate it, and publish it in one swap. A
//! failed validation simply drops the copy, which makes every mutation
//! all-or-nothing.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{Config, LimitsConfig};
use crate::document::Document;
use crate::error::{Error, LimitKind, Result};
use crate::graph::{self, DependentRef, DependentsCache, DependentsIndex, ValidationReport};
use crate::id::{dedup_dependencies, normalize_dependencies, Dependency, TagName, TaskId};
use crate::storage::Storage;
use crate::tag::Tag;
use crate::task::{
    self, check_transition, unmet_hard_dependencies, BlockingPolicy, NewTask, StatusChange, Task,
    TaskFilter, TaskPatch, TaskStatus,
};

/// One committed version of the whole store.
#[derive(Debug, Clone)]
pub struct StoreState {
    tags: BTreeMap<TagName, Arc<Tag>>,
    current_tag: TagName,
    generation: u64,
}

impl StoreState {
    /// Fresh state with an empty active `master` tag
    pub fn new(now: DateTime<Utc>) -> Self {
        let master = TagName::master();
        let mut tags = BTreeMap::new();
        tags.insert(master.clone(), Arc::new(Tag::new(master.clone(), now)));
        Self {
            tags,
            current_tag: master,
            generation: 0,
        }
    }

    pub(crate) fn from_tags(tags: Vec<Tag>, current_tag: TagName) -> Result<Self> {
        let tags: BTreeMap<TagName, Arc<Tag>> = tags
            .into_iter()
            .map(|tag| (tag.name.clone(), Arc::new(tag)))
            .collect();
        if !tags.contains_key(&current_tag) {
            return Err(Error::CorruptDocument(format!(
                "active tag '{current_tag}' does not exist"
            )));
        }
        Ok(Self {
            tags,
            current_tag,
            generation: 0,
        })
    }

    pub fn current_tag(&self) -> &TagName {
        &self.current_tag
    }

    /// Bumped by every committed mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tag(&self, name: &TagName) -> Result<&Tag> {
        self.tags
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| Error::TagNotFound(name.clone()))
    }

    pub fn has_tag(&self, name: &TagName) -> bool {
        self.tags.contains_key(name)
    }

    pub fn tags(&self) -> impl Iterator<Item = (&TagName, &Tag)> {
        self.tags.iter().map(|(name, tag)| (name, tag.as_ref()))
    }

    pub fn tag_names(&self) -> Vec<TagName> {
        self.tags.keys().cloned().collect()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn task(&self, tag: &TagName, id: &TaskId) -> Option<&Task> {
        self.tags.get(tag).and_then(|tag| tag.tasks.get(id))
    }

    pub fn contains_task(&self, tag: &TagName, id: &TaskId) -> bool {
        self.task(tag, id).is_some()
    }

    /// First tag other than `exclude` holding `id`, in tag-name order
    pub fn find_tag_with_task(&self, id: &TaskId, exclude: &TagName) -> Option<&TagName> {
        self.tags
            .iter()
            .find(|(name, tag)| *name != exclude && tag.tasks.contains_key(id))
            .map(|(name, _)| name)
    }

    /// Status of a dependency target as seen from a task in `own`
    pub fn status_of(&self, own: &TagName, dep: &Dependency) -> Option<TaskStatus> {
        self.task(dep.target_tag(own), &dep.id).map(|task| task.status)
    }

    /// `None` means the active tag
    pub fn resolve_tag(&self, tag: Option<&TagName>) -> Result<TagName> {
        let name = tag.unwrap_or(&self.current_tag);
        self.tag(name)?;
        Ok(name.clone())
    }

    pub(crate) fn tag_mut(&mut self, name: &TagName) -> Result<&mut Tag> {
        self.tags
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| Error::TagNotFound(name.clone()))
    }

    pub(crate) fn task_mut(&mut self, tag: &TagName, id: &TaskId) -> Result<&mut Task> {
        self.tag_mut(tag)?
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound {
                tag: tag.clone(),
                id: id.clone(),
            })
    }

    pub(crate) fn insert_tag(&mut self, tag: Tag) {
        self.tags.insert(tag.name.clone(), Arc::new(tag));
    }

    pub(crate) fn remove_tag(&mut self, name: &TagName) -> Result<Tag> {
        self.tags
            .remove(name)
            .map(Arc::unwrap_or_clone)
            .ok_or_else(|| Error::TagNotFound(name.clone()))
    }

    pub(crate) fn set_current_tag(&mut self, name: TagName) {
        self.current_tag = name;
    }

    /// Every dependency of `task` must resolve (self references resolve and
    /// are caught as cycles).
    pub(crate) fn check_dependencies_resolve(&self, tag: &TagName, task: &TaskId) -> Result<()> {
        let Some(entry) = self.task(tag, task) else {
            return Err(Error::TaskNotFound {
                tag: tag.clone(),
                id: task.clone(),
            });
        };
        for dep in &entry.dependencies {
            if !self.contains_task(dep.target_tag(tag), &dep.id) {
                return Err(Error::UnresolvedDependency {
                    tag: tag.clone(),
                    task: task.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Capacity and structure checks applied when a whole state is loaded.
    pub(crate) fn check_limits(&self, limits: &LimitsConfig) -> Result<()> {
        if self.tags.len() > limits.max_tags {
            return Err(Error::LimitExceeded {
                kind: LimitKind::Tags,
                limit: limits.max_tags,
            });
        }
        for tag in self.tags.values() {
            if tag.tasks.len() > limits.max_tasks_per_tag {
                return Err(Error::LimitExceeded {
                    kind: LimitKind::TasksPerTag,
                    limit: limits.max_tasks_per_tag,
                });
            }
            for id in tag.tasks.keys() {
                if id.depth() > limits.max_depth {
                    return Err(Error::LimitExceeded {
                        kind: LimitKind::Depth,
                        limit: limits.max_depth,
                    });
                }
                if let Some(parent) = id.parent() {
                    if !tag.tasks.contains_key(&parent) {
                        return Err(Error::ParentNotFound {
                            tag: tag.name.clone(),
                            parent,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Bring `blocked` in line with dependency state for one tag.
    pub(crate) fn reconcile_tag(
        &mut self,
        name: &TagName,
        policy: BlockingPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<StatusChange>> {
        let changes = {
            let tag = self.tag(name)?;
            task::reconciliation_changes(&tag.tasks, |dep| self.status_of(name, dep), policy)
        };
        if changes.is_empty() {
            return Ok(changes);
        }
        let tag = self.tag_mut(name)?;
        task::apply_status_changes(&mut tag.tasks, &changes, now);
        for change in &changes {
            tracing::debug!(
                tag = %name,
                id = %change.id,
                from = %change.from,
                to = %change.to,
                "reconciled task status"
            );
        }
        Ok(changes)
    }

    /// Reconcile `touched` and, when cross-tag dependencies block, every other
    /// tag as well. Returns the changes made in `touched`.
    pub(crate) fn settle(
        &mut self,
        touched: &[&TagName],
        policy: BlockingPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<StatusChange>> {
        let mut changes = Vec::new();
        for name in touched {
            changes.extend(self.reconcile_tag(name, policy, now)?);
        }
        if policy.cross_tag_blocks {
            for name in self.tag_names() {
                if !touched.contains(&&name) {
                    self.reconcile_tag(&name, policy, now)?;
                }
            }
        }
        Ok(changes)
    }
}

/// Status changes grouped by the tag they happened in
pub type StatusChangesByTag = BTreeMap<TagName, Vec<StatusChange>>;

/// Restartable, lazily filtered view over one tag of a snapshot.
///
/// Holds its own snapshot, so later mutations of the store never show up in
/// an existing listing.
#[derive(Debug, Clone)]
pub struct TaskListing {
    state: Arc<StoreState>,
    tag: TagName,
    filter: TaskFilter,
}

impl TaskListing {
    pub fn tag(&self) -> &TagName {
        &self.tag
    }

    /// Tasks in id (depth-first) order
    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.state
            .tags
            .get(&self.tag)
            .into_iter()
            .flat_map(|tag| tag.tasks.values())
            .filter(move |task| self.filter.matches(task))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn to_vec(&self) -> Vec<Task> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a TaskListing {
    type Item = &'a Task;
    type IntoIter = Box<dyn Iterator<Item = &'a Task> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Outcome of `delete_task`
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub tag: TagName,
    /// The task and all its descendants, in id order
    pub removed: Vec<TaskId>,
    /// Dependents whose references became broken: soft references always,
    /// hard ones only on a forced delete
    pub broken: Vec<DependentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    pub status_changes: Vec<StatusChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum FixAction {
    /// Self reference dropped
    RemovedSelf,
    /// Target exists nowhere; reference dropped
    RemovedMissing,
    /// Plain id that only exists in another tag, rewritten as `tag:id`
    Qualified { target_tag: TagName },
    /// Force-delete marker cleared
    ClearedBroken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyFix {
    pub task: TaskId,
    pub dependency: Dependency,
    #[serde(flatten)]
    pub action: FixAction,
}

/// Outcome of `fix_dependencies`
#[derive(Debug, Clone, Serialize)]
pub struct FixReport {
    pub tag: TagName,
    pub fixes: Vec<DependencyFix>,
    pub status_changes: Vec<StatusChange>,
}

/// The task store.
#[derive(Debug)]
pub struct Store {
    config: Config,
    storage: Option<Storage>,
    state: RwLock<Arc<StoreState>>,
    writer: Mutex<()>,
    dependents: DependentsCache,
    /// Generation last written by `flush`; also serializes flushes
    flushed: Mutex<u64>,
}

fn poisoned(what: &str) -> Error {
    Error::OperationFailed(format!("{what} lock poisoned"))
}

impl Store {
    /// In-memory store with a single empty `master` tag
    pub fn new(config: Config) -> Self {
        Self::with_state(config, None, StoreState::new(Utc::now()))
    }

    fn with_state(config: Config, storage: Option<Storage>, state: StoreState) -> Self {
        let generation = state.generation;
        Self {
            config,
            storage,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            dependents: DependentsCache::default(),
            flushed: Mutex::new(generation),
        }
    }

    /// Store backed by `storage`, loading the document when one exists.
    pub fn open(storage: Storage, config: Config) -> Result<Self> {
        let state = match storage.read_document(config.storage.lock_timeout_ms)? {
            Some(document) => document.into_state(&config)?,
            None => StoreState::new(Utc::now()),
        };
        tracing::debug!(
            path = %storage.tasks_file().display(),
            tags = state.tag_count(),
            "opened task store"
        );
        Ok(Self::with_state(config, Some(storage), state))
    }

    /// Open the store of a project directory with its `.taskdb.toml`.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        let config = Config::load_from_dir(dir)?;
        Self::open(Storage::new(dir.to_path_buf()), config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    pub(crate) fn policy(&self) -> BlockingPolicy {
        self.config.blocking_policy()
    }

    /// Current committed state
    pub fn snapshot(&self) -> Result<Arc<StoreState>> {
        self.state
            .read()
            .map(|state| Arc::clone(&state))
            .map_err(|_| poisoned("state"))
    }

    pub fn current_tag(&self) -> Result<TagName> {
        Ok(self.snapshot()?.current_tag().clone())
    }

    /// True when the committed state differs from the last flushed one
    pub fn is_dirty(&self) -> Result<bool> {
        let flushed = *self.flushed.lock().map_err(|_| poisoned("flush"))?;
        Ok(self.snapshot()?.generation() != flushed)
    }

    /// Run `op` against a private copy of the state and publish it on success.
    pub(crate) fn commit<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreState) -> Result<T>,
    {
        let _writer = self.writer.lock().map_err(|_| poisoned("writer"))?;
        let current = self.snapshot()?;
        let mut next = StoreState::clone(&current);
        let value = f(&mut next)?;
        next.generation = current.generation + 1;
        let generation = next.generation;
        *self.state.write().map_err(|_| poisoned("state"))? = Arc::new(next);
        tracing::debug!(op, generation, "committed");
        Ok(value)
    }

    /// Copy the on-disk document into `backups/` before a destructive change.
    pub(crate) fn backup(&self, reason: &str) -> Result<Option<PathBuf>> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let backup = storage.backup_document(
            self.config.storage.max_backups,
            self.config.storage.lock_timeout_ms,
        )?;
        if let Some(path) = &backup {
            tracing::info!(reason, path = %path.display(), "backed up task document");
        }
        Ok(backup)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Replace the whole state with a validated document.
    pub fn load(&self, document: Document) -> Result<()> {
        let loaded = document.into_state(&self.config)?;
        self.commit("load", |state| {
            *state = loaded;
            Ok(())
        })
    }

    /// The current state as a document
    pub fn save(&self) -> Result<Document> {
        let snapshot = self.snapshot()?;
        Ok(Document::from_state(&snapshot))
    }

    /// Atomically write the current snapshot to disk.
    ///
    /// Does not hold the writer mutex, so mutations proceed while the file is
    /// written. Flushes themselves are serialized.
    pub fn flush(&self) -> Result<PathBuf> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            Error::OperationFailed("store has no backing directory".to_string())
        })?;
        let mut flushed = self.flushed.lock().map_err(|_| poisoned("flush"))?;
        let snapshot = self.snapshot()?;
        let document = Document::from_state(&snapshot);
        let path = storage.write_document(
            &document,
            self.config.storage.lock_timeout_ms,
            |written| written.into_state(&self.config).map(|_| ()),
        )?;
        *flushed = snapshot.generation();
        tracing::info!(
            path = %path.display(),
            generation = snapshot.generation(),
            "flushed task document"
        );
        Ok(path)
    }

    /// `flush` on tokio's blocking pool
    pub async fn flush_async(self: &Arc<Self>) -> Result<PathBuf> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|err| Error::OperationFailed(format!("flush task failed: {err}")))?
    }

    // =========================================================================
    // Task operations
    // =========================================================================

    /// Create a task and return its id.
    pub fn create_task(&self, tag: Option<&TagName>, new: NewTask) -> Result<TaskId> {
        let limits = &self.config.limits;
        let default_priority = self.config.tasks.default_priority;
        let policy = self.policy();

        self.commit("create_task", |state| {
            let tag_name = state.resolve_tag(tag)?;
            let now = Utc::now();

            let id = {
                let tag = state.tag(&tag_name)?;
                let id = match (new.id, new.parent) {
                    (Some(id), Some(parent)) if !id.is_child_of(&parent) => {
                        return Err(Error::InvalidArgument(format!(
                            "task id {id} is not a direct child of {parent}"
                        )));
                    }
                    (Some(id), _) => id,
                    (None, Some(parent)) => tag.next_child_id(&parent),
                    (None, None) => tag.next_top_level_id(),
                };

                if tag.tasks.contains_key(&id) {
                    return Err(Error::DuplicateId {
                        tag: tag_name.clone(),
                        id,
                    });
                }
                if let Some(parent) = id.parent() {
                    if !tag.tasks.contains_key(&parent) {
                        return Err(Error::ParentNotFound {
                            tag: tag_name.clone(),
                            parent,
                        });
                    }
                }
                if id.depth() > limits.max_depth {
                    return Err(Error::LimitExceeded {
                        kind: LimitKind::Depth,
                        limit: limits.max_depth,
                    });
                }
                if tag.tasks.len() >= limits.max_tasks_per_tag {
                    return Err(Error::LimitExceeded {
                        kind: LimitKind::TasksPerTag,
                        limit: limits.max_tasks_per_tag,
                    });
                }
                id
            };

            let mut task = Task::new(id.clone(), new.title, now);
            task.description = new.description;
            task.details = new.details;
            task.test_strategy = new.test_strategy;
            task.priority = new.priority.unwrap_or(default_priority);
            task.dependencies = normalize_dependencies(&tag_name, new.dependencies);

            let tag = state.tag_mut(&tag_name)?;
            tag.tasks.insert(id.clone(), task);
            tag.updated = now;

            state.check_dependencies_resolve(&tag_name, &id)?;
            graph::check_acyclic(state.tag(&tag_name)?)?;
            state.settle(&[&tag_name], policy, now)?;

            tracing::debug!(tag = %tag_name, id = %id, "created task");
            Ok(id)
        })
    }

    /// Apply a partial update; returns the task as committed.
    pub fn update_task(&self, tag: Option<&TagName>, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        let policy = self.policy();
        self.commit("update_task", |state| {
            let tag_name = state.resolve_tag(tag)?;
            let now = Utc::now();
            let deps_changed = patch.dependencies.is_some();

            let task = state.task_mut(&tag_name, id)?;
            if let Some(title) = patch.title {
                task.title = title;
            }
            if let Some(description) = patch.description {
                task.description = description;
            }
            if let Some(details) = patch.details {
                task.details = details;
            }
            if let Some(test_strategy) = patch.test_strategy {
                task.test_strategy = test_strategy;
            }
            if let Some(priority) = patch.priority {
                task.priority = priority;
            }
            if let Some(dependencies) = patch.dependencies {
                task.dependencies = normalize_dependencies(&tag_name, dependencies);
            }
            task.updated = now;
            state.tag_mut(&tag_name)?.updated = now;

            if deps_changed {
                state.check_dependencies_resolve(&tag_name, id)?;
                graph::check_acyclic(state.tag(&tag_name)?)?;
            }
            state.settle(&[&tag_name], policy, now)?;

            if let Some(status) = patch.status {
                transition(state, &tag_name, id, status, policy, now)?;
                state.settle(&[&tag_name], policy, now)?;
            }

            state.task(&tag_name, id).cloned().ok_or_else(|| Error::TaskNotFound {
                tag: tag_name.clone(),
                id: id.clone(),
            })
        })
    }

    /// Explicit status transition. Returns the explicit change followed by
    /// any reconciliation it caused.
    pub fn set_status(
        &self,
        tag: Option<&TagName>,
        id: &TaskId,
        status: TaskStatus,
    ) -> Result<Vec<StatusChange>> {
        let policy = self.policy();
        self.commit("set_status", |state| {
            let tag_name = state.resolve_tag(tag)?;
            let now = Utc::now();
            let mut changes = Vec::new();
            if let Some(change) = transition(state, &tag_name, id, status, policy, now)? {
                changes.push(change);
            }
            changes.extend(state.settle(&[&tag_name], policy, now)?);
            Ok(changes)
        })
    }

    /// Delete a task and its descendants.
    ///
    /// Fails with `DependencyInUse` while tasks outside the subtree hold a hard
    /// dependency on it. With `force` those references move to
    /// `brokenDependencies`; soft references move there without `force`.
    pub fn delete_task(&self, tag: Option<&TagName>, id: &TaskId, force: bool) -> Result<DeleteReport> {
        let policy = self.policy();
        self.commit("delete_task", |state| {
            let tag_name = state.resolve_tag(tag)?;
            let now = Utc::now();

            let removed = {
                let tag = state.tag(&tag_name)?;
                if !tag.tasks.contains_key(id) {
                    return Err(Error::TaskNotFound {
                        tag: tag_name.clone(),
                        id: id.clone(),
                    });
                }
                tag.subtree(id)
            };
            let removed_set: HashSet<&TaskId> = removed.iter().collect();

            let index = DependentsIndex::build(state, &tag_name);
            let mut broken: Vec<DependentRef> = removed
                .iter()
                .flat_map(|target| index.dependents(target).iter().cloned())
                .filter(|dependent| !(dependent.tag == tag_name && removed_set.contains(&dependent.id)))
                .collect();
            broken.sort();
            broken.dedup();

            let in_use: Vec<&DependentRef> = broken
                .iter()
                .filter(|dependent| {
                    state.task(&dependent.tag, &dependent.id).is_some_and(|task| {
                        task.hard_dependencies().any(|dep| {
                            dep.target_tag(&dependent.tag) == &tag_name && removed_set.contains(&dep.id)
                        })
                    })
                })
                .collect();
            if !in_use.is_empty() && !force {
                return Err(Error::DependencyInUse {
                    target: format!("{tag_name}:{id}"),
                    dependents: in_use.iter().map(ToString::to_string).collect(),
                });
            }
            let forced = !in_use.is_empty();

            let backup = if force || removed.len() > 1 {
                self.backup("delete_task")?
            } else {
                None
            };

            let tag = state.tag_mut(&tag_name)?;
            for removed_id in &removed {
                tag.tasks.remove(removed_id);
            }
            tag.updated = now;

            for dependent in &broken {
                let task = state.task_mut(&dependent.tag, &dependent.id)?;
                let (dead, live): (Vec<Dependency>, Vec<Dependency>) = std::mem::take(&mut task.dependencies)
                    .into_iter()
                    .partition(|dep| {
                        dep.target_tag(&dependent.tag) == &tag_name && removed_set.contains(&dep.id)
                    });
                let mut marked = std::mem::take(&mut task.broken_dependencies);
                marked.extend(dead);
                task.dependencies = live;
                task.broken_dependencies = dedup_dependencies(marked);
                task.updated = now;
            }
            if forced {
                tracing::warn!(
                    tag = %tag_name,
                    id = %id,
                    dependents = broken.len(),
                    "forced delete left broken dependencies"
                );
            }

            let mut touched: Vec<&TagName> = vec![&tag_name];
            for dependent in &broken {
                if !touched.contains(&&dependent.tag) {
                    touched.push(&dependent.tag);
                }
            }
            let status_changes = state.settle(&touched, policy, now)?;

            tracing::debug!(tag = %tag_name, id = %id, removed = removed.len(), "deleted task");
            Ok(DeleteReport {
                tag: tag_name.clone(),
                removed,
                broken,
                backup,
                status_changes,
            })
        })
    }

    pub fn get_task(&self, tag: Option<&TagName>, id: &TaskId) -> Result<Option<Task>> {
        let state = self.snapshot()?;
        let tag_name = state.resolve_tag(tag)?;
        Ok(state.task(&tag_name, id).cloned())
    }

    pub fn list_tasks(&self, tag: Option<&TagName>, filter: TaskFilter) -> Result<TaskListing> {
        let state = self.snapshot()?;
        let tag = state.resolve_tag(tag)?;
        Ok(TaskListing { state, tag, filter })
    }

    /// Add one dependency; adding a target that is already present is a no-op.
    pub fn add_dependency(
        &self,
        tag: Option<&TagName>,
        id: &TaskId,
        dependency: Dependency,
    ) -> Result<Vec<StatusChange>> {
        let policy = self.policy();
        self.commit("add_dependency", |state| {
            let tag_name = state.resolve_tag(tag)?;
            let now = Utc::now();
            let dependency = dependency.clone().localized(&tag_name);
            let task = state.task_mut(&tag_name, id)?;
            if task.dependencies.iter().any(|dep| dep.same_target(&dependency)) {
                return Ok(Vec::new());
            }
            task.dependencies.push(dependency);
            task.updated = now;

            state.check_dependencies_resolve(&tag_name, id)?;
            graph::check_acyclic(state.tag(&tag_name)?)?;
            state.settle(&[&tag_name], policy, now)
        })
    }

    /// Remove a dependency (live or broken). Returns whether anything was removed.
    pub fn remove_dependency(
        &self,
        tag: Option<&TagName>,
        id: &TaskId,
        dependency: &Dependency,
    ) -> Result<bool> {
        let policy = self.policy();
        self.commit("remove_dependency", |state| {
            let tag_name = state.resolve_tag(tag)?;
            let now = Utc::now();
            let dependency = dependency.clone().localized(&tag_name);
            let task = state.task_mut(&tag_name, id)?;
            let before = task.dependencies.len() + task.broken_dependencies.len();
            task.dependencies.retain(|dep| !dep.same_target(&dependency));
            task.broken_dependencies.retain(|dep| !dep.same_target(&dependency));
            let removed = task.dependencies.len() + task.broken_dependencies.len() < before;
            if removed {
                task.updated = now;
                state.settle(&[&tag_name], policy, now)?;
            }
            Ok(removed)
        })
    }

    /// Repair a tag's dependency lists.
    pub fn fix_dependencies(&self, tag: Option<&TagName>) -> Result<FixReport> {
        let policy = self.policy();
        self.commit("fix_dependencies", |state| {
            let tag_name = state.resolve_tag(tag)?;
            let now = Utc::now();

            let mut fixes = Vec::new();
            let mut rewrites: Vec<(TaskId, Vec<Dependency>)> = Vec::new();
            {
                let tag = state.tag(&tag_name)?;
                for task in tag.tasks.values() {
                    let mut kept = Vec::with_capacity(task.dependencies.len());
                    let mut changed = false;
                    for dep in &task.dependencies {
                        let action = match &dep.tag {
                            None if dep.id == task.id => Some(FixAction::RemovedSelf),
                            None if tag.tasks.contains_key(&dep.id) => None,
                            None => match state.find_tag_with_task(&dep.id, &tag_name) {
                                Some(target_tag) => Some(FixAction::Qualified {
                                    target_tag: target_tag.clone(),
                                }),
                                None => Some(FixAction::RemovedMissing),
                            },
                            Some(target_tag) if state.contains_task(target_tag, &dep.id) => None,
                            Some(_) => Some(FixAction::RemovedMissing),
                        };
                        match action {
                            None => kept.push(dep.clone()),
                            Some(action) => {
                                if let FixAction::Qualified { target_tag } = &action {
                                    kept.push(Dependency {
                                        tag: Some(target_tag.clone()),
                                        ..dep.clone()
                                    });
                                }
                                changed = true;
                                fixes.push(DependencyFix {
                                    task: task.id.clone(),
                                    dependency: dep.clone(),
                                    action,
                                });
                            }
                        }
                    }
                    for dep in &task.broken_dependencies {
                        changed = true;
                        fixes.push(DependencyFix {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                            action: FixAction::ClearedBroken,
                        });
                    }
                    if changed {
                        rewrites.push((task.id.clone(), dedup_dependencies(kept)));
                    }
                }
            }

            for (id, dependencies) in rewrites {
                let task = state.task_mut(&tag_name, &id)?;
                task.dependencies = dependencies;
                task.broken_dependencies.clear();
                task.updated = now;
            }
            let status_changes = state.settle(&[&tag_name], policy, now)?;

            if !fixes.is_empty() {
                tracing::info!(tag = %tag_name, fixes = fixes.len(), "fixed dependencies");
            }
            Ok(FixReport {
                tag: tag_name,
                fixes,
                status_changes,
            })
        })
    }

    /// The task to work on next.
    ///
    /// Eligible: `pending` or `in-progress`, every blocking dependency done,
    /// and no unfinished subtasks. Preference: in-progress first, then
    /// priority, then fewest dependencies, then lowest id.
    pub fn next_task(&self, tag: Option<&TagName>) -> Result<Option<Task>> {
        let policy = self.policy();
        let state = self.snapshot()?;
        let tag_name = state.resolve_tag(tag)?;
        let tag = state.tag(&tag_name)?;

        let has_open_children = |task: &Task| {
            tag.tasks
                .values()
                .any(|other| other.id.is_child_of(&task.id) && !other.status.is_terminal())
        };

        Ok(tag
            .tasks
            .values()
            .filter(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress))
            .filter(|task| {
                unmet_hard_dependencies(task, |dep| state.status_of(&tag_name, dep), policy)
                    .is_empty()
            })
            .filter(|task| !has_open_children(task))
            .min_by_key(|task| {
                (
                    task.status != TaskStatus::InProgress,
                    task.priority.rank(),
                    task.dependencies.len(),
                    task.id.clone(),
                )
            })
            .cloned())
    }

    // =========================================================================
    // Graph queries
    // =========================================================================

    pub fn validate(&self, tag: Option<&TagName>) -> Result<ValidationReport> {
        let state = self.snapshot()?;
        let tag_name = state.resolve_tag(tag)?;
        graph::validate(&state, &tag_name)
    }

    pub fn validate_all(&self) -> Result<Vec<ValidationReport>> {
        let state = self.snapshot()?;
        state
            .tag_names()
            .iter()
            .map(|name| graph::validate(&state, name))
            .collect()
    }

    /// Tasks depending on `id`, including explicit references from other tags
    pub fn dependents(&self, tag: Option<&TagName>, id: &TaskId) -> Result<Vec<DependentRef>> {
        let state = self.snapshot()?;
        let tag_name = state.resolve_tag(tag)?;
        if !state.contains_task(&tag_name, id) {
            return Err(Error::TaskNotFound {
                tag: tag_name,
                id: id.clone(),
            });
        }
        let index = self.dependents.get(&state, &tag_name)?;
        Ok(index.dependents(id).to_vec())
    }
}

/// Validate and apply one explicit transition inside a commit.
fn transition(
    state: &mut StoreState,
    tag_name: &TagName,
    id: &TaskId,
    to: TaskStatus,
    policy: BlockingPolicy,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>> {
    let from = {
        let task = state.task(tag_name, id).ok_or_else(|| Error::TaskNotFound {
            tag: tag_name.clone(),
            id: id.clone(),
        })?;
        check_transition(task, to, |dep| state.status_of(tag_name, dep), policy)?;
        task.status
    };
    if from == to {
        return Ok(None);
    }
    let task = state.task_mut(tag_name, id)?;
    task.status = to;
    task.updated = now;
    tracing::debug!(tag = %tag_name, id = %id, from = %from, to = %to, "status changed");
    Ok(Some(StatusChange {
        id: id.clone(),
        from,
        to,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).expect("id")
    }

    fn dep(raw: &str) -> Dependency {
        Dependency::parse(raw).expect("dep")
    }

    fn store() -> Store {
        Store::new(Config::default())
    }

    #[test]
    fn store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Store>();
    }

    #[test]
    fn allocates_sequential_ids() {
        let store = store();
        assert_eq!(store.create_task(None, NewTask::new("a")).unwrap(), id("1"));
        assert_eq!(store.create_task(None, NewTask::new("b")).unwrap(), id("2"));
        assert_eq!(
            store
                .create_task(None, NewTask::new("b.1").with_parent(id("2")))
                .unwrap(),
            id("2.1")
        );
        assert_eq!(
            store
                .create_task(None, NewTask::new("b.2").with_parent(id("2")))
                .unwrap(),
            id("2.2")
        );
    }

    #[test]
    fn explicit_ids_are_checked() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();

        let err = store
            .create_task(None, NewTask::new("dup").with_id(id("1")))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId { .. }));

        let err = store
            .create_task(None, NewTask::new("orphan").with_id(id("5.1")))
            .unwrap_err();
        assert!(matches!(err, Error::ParentNotFound { .. }));
    }

    #[test]
    fn default_priority_comes_from_config() {
        let mut config = Config::default();
        config.tasks.default_priority = Priority::Low;
        let store = Store::new(config);
        let id = store.create_task(None, NewTask::new("a")).unwrap();
        assert_eq!(store.get_task(None, &id).unwrap().unwrap().priority, Priority::Low);
    }

    #[test]
    fn depth_limit_counts_segments() {
        let mut config = Config::default();
        config.limits.max_depth = 2;
        let store = Store::new(config);
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("a.1").with_parent(id("1")))
            .unwrap();
        let err = store
            .create_task(None, NewTask::new("a.1.1").with_parent(id("1.1")))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LimitExceeded {
                kind: LimitKind::Depth,
                limit: 2
            }
        ));
    }

    #[test]
    fn task_limit_includes_subtasks() {
        let mut config = Config::default();
        config.limits.max_tasks_per_tag = 2;
        let store = Store::new(config);
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("a.1").with_parent(id("1")))
            .unwrap();
        let err = store.create_task(None, NewTask::new("b")).unwrap_err();
        assert!(matches!(
            err,
            Error::LimitExceeded {
                kind: LimitKind::TasksPerTag,
                ..
            }
        ));
    }

    #[test]
    fn unresolved_dependency_is_rejected() {
        let store = store();
        let err = store
            .create_task(None, NewTask::new("a").depends_on(dep("7")))
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedDependency { .. }));
        assert_eq!(store.list_tasks(None, TaskFilter::default()).unwrap().count(), 0);
    }

    #[test]
    fn new_task_with_pending_dependency_is_blocked() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        let b = store
            .create_task(None, NewTask::new("b").depends_on(dep("1")))
            .unwrap();
        assert_eq!(
            store.get_task(None, &b).unwrap().unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[test]
    fn completing_a_dependency_unblocks() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("b").depends_on(dep("1")))
            .unwrap();

        store.set_status(None, &id("1"), TaskStatus::InProgress).unwrap();
        let changes = store.set_status(None, &id("1"), TaskStatus::Done).unwrap();
        assert_eq!(
            changes,
            vec![
                StatusChange {
                    id: id("1"),
                    from: TaskStatus::InProgress,
                    to: TaskStatus::Done,
                },
                StatusChange {
                    id: id("2"),
                    from: TaskStatus::Blocked,
                    to: TaskStatus::Pending,
                },
            ]
        );

        // Reopening blocks the dependent again.
        store.set_status(None, &id("1"), TaskStatus::Pending).unwrap();
        assert_eq!(
            store.get_task(None, &id("2")).unwrap().unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[test]
    fn blocked_is_never_an_explicit_target() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        let err = store
            .set_status(None, &id("1"), TaskStatus::Blocked)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStatusTransition { .. }));
    }

    #[test]
    fn update_is_all_or_nothing() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("b").depends_on(dep("1")))
            .unwrap();

        let patch = TaskPatch {
            title: Some("renamed".to_string()),
            dependencies: Some(vec![dep("2")]),
            ..TaskPatch::default()
        };
        let err = store.update_task(None, &id("1"), patch).unwrap_err();
        match err {
            Error::CircularDependency { cycle_path, .. } => {
                assert_eq!(cycle_path, vec![id("1"), id("2"), id("1")]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        let task = store.get_task(None, &id("1")).unwrap().unwrap();
        assert_eq!(task.title, "a");
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn update_refreshes_timestamp() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        let before = store.get_task(None, &id("1")).unwrap().unwrap();
        let patch = TaskPatch {
            details: Some("more".to_string()),
            ..TaskPatch::default()
        };
        let after = store.update_task(None, &id("1"), patch).unwrap();
        assert_eq!(after.details, "more");
        assert!(after.updated >= before.updated);
        assert_eq!(after.created, before.created);
    }

    #[test]
    fn delete_cascades_to_descendants() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("a.1").with_parent(id("1")))
            .unwrap();
        store
            .create_task(
                None,
                NewTask::new("a.2")
                    .with_parent(id("1"))
                    .depends_on(dep("1.1")),
            )
            .unwrap();
        store.create_task(None, NewTask::new("b")).unwrap();

        let report = store.delete_task(None, &id("1"), false).unwrap();
        assert_eq!(report.removed, vec![id("1"), id("1.1"), id("1.2")]);
        assert!(report.broken.is_empty());
        let remaining: Vec<TaskId> = store
            .list_tasks(None, TaskFilter::default())
            .unwrap()
            .iter()
            .map(|task| task.id.clone())
            .collect();
        assert_eq!(remaining, vec![id("2")]);
    }

    #[test]
    fn delete_in_use_requires_force() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("b").depends_on(dep("1")))
            .unwrap();

        let err = store.delete_task(None, &id("1"), false).unwrap_err();
        match err {
            Error::DependencyInUse { dependents, .. } => {
                assert_eq!(dependents, vec!["master:2".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let report = store.delete_task(None, &id("1"), true).unwrap();
        assert_eq!(report.broken.len(), 1);
        let b = store.get_task(None, &id("2")).unwrap().unwrap();
        assert!(b.dependencies.is_empty());
        assert_eq!(b.broken_dependencies, vec![dep("1")]);
        assert_eq!(b.status, TaskStatus::Pending);

        let validation = store.validate(None).unwrap();
        assert_eq!(validation.broken_dependencies.len(), 1);
        assert!(!validation.has_circular);
    }

    #[test]
    fn soft_dependents_do_not_hold_a_task() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("b").depends_on(dep("~1")))
            .unwrap();

        let report = store.delete_task(None, &id("1"), false).unwrap();
        assert_eq!(report.removed, vec![id("1")]);
        assert_eq!(report.broken.len(), 1);
        let b = store.get_task(None, &id("2")).unwrap().unwrap();
        assert!(b.dependencies.is_empty());
        assert_eq!(b.broken_dependencies, vec![dep("~1")]);
    }

    #[test]
    fn own_tag_prefix_is_a_local_edge() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("b").depends_on(dep("1")))
            .unwrap();

        let err = store
            .update_task(None, &id("1"), TaskPatch::dependencies(vec![dep("master:2")]))
            .unwrap_err();
        assert!(matches!(err, Error::CircularDependency { .. }));
        let err = store
            .add_dependency(None, &id("1"), dep("master:2"))
            .unwrap_err();
        assert!(matches!(err, Error::CircularDependency { .. }));

        store
            .create_task(None, NewTask::new("c").depends_on(dep("master:1")))
            .unwrap();
        let c = store.get_task(None, &id("3")).unwrap().unwrap();
        assert_eq!(c.dependencies, vec![dep("1")]);
        let validation = store.validate(None).unwrap();
        assert!(validation.cross_tag_dependencies.is_empty());

        assert!(store.remove_dependency(None, &id("3"), &dep("master:1")).unwrap());
    }

    #[test]
    fn unblocked_tasks_return_to_pending() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store.create_task(None, NewTask::new("b")).unwrap();
        store
            .update_task(None, &id("2"), TaskPatch::status(TaskStatus::InProgress))
            .unwrap();

        store.add_dependency(None, &id("2"), dep("1")).unwrap();
        let b = store.get_task(None, &id("2")).unwrap().unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);

        store.remove_dependency(None, &id("2"), &dep("1")).unwrap();
        let b = store.get_task(None, &id("2")).unwrap().unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
    }

    #[test]
    fn listing_is_a_restartable_snapshot() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("a.1").with_parent(id("1")))
            .unwrap();
        let listing = store.list_tasks(None, TaskFilter::default()).unwrap();
        store.create_task(None, NewTask::new("b")).unwrap();

        assert_eq!(listing.count(), 2);
        let first: Vec<_> = listing.iter().map(|t| t.id.to_string()).collect();
        let second: Vec<_> = (&listing).into_iter().map(|t| t.id.to_string()).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["1", "1.1"]);
    }

    #[test]
    fn add_and_remove_dependency() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store.create_task(None, NewTask::new("b")).unwrap();

        let changes = store.add_dependency(None, &id("2"), dep("1")).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(store.add_dependency(None, &id("2"), dep("~1")).unwrap().is_empty());

        let err = store.add_dependency(None, &id("1"), dep("2")).unwrap_err();
        assert!(matches!(err, Error::CircularDependency { .. }));

        assert!(store.remove_dependency(None, &id("2"), &dep("1")).unwrap());
        assert!(!store.remove_dependency(None, &id("2"), &dep("1")).unwrap());
        assert_eq!(
            store.get_task(None, &id("2")).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn next_task_prefers_in_progress_then_priority() {
        let store = store();
        store
            .create_task(None, NewTask::new("low").with_priority(Priority::Low))
            .unwrap();
        store
            .create_task(None, NewTask::new("high").with_priority(Priority::High))
            .unwrap();
        store
            .create_task(
                None,
                NewTask::new("blocked high")
                    .with_priority(Priority::High)
                    .depends_on(dep("1")),
            )
            .unwrap();

        assert_eq!(store.next_task(None).unwrap().unwrap().id, id("2"));

        store.set_status(None, &id("1"), TaskStatus::InProgress).unwrap();
        assert_eq!(store.next_task(None).unwrap().unwrap().id, id("1"));
    }

    #[test]
    fn next_task_skips_parents_with_open_subtasks() {
        let store = store();
        store.create_task(None, NewTask::new("parent")).unwrap();
        store
            .create_task(None, NewTask::new("child").with_parent(id("1")))
            .unwrap();
        assert_eq!(store.next_task(None).unwrap().unwrap().id, id("1.1"));
    }

    #[test]
    fn dependents_index_follows_generation() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        store
            .create_task(None, NewTask::new("b").depends_on(dep("1")))
            .unwrap();
        let dependents = store.dependents(None, &id("1")).unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, id("2"));

        store
            .create_task(None, NewTask::new("c").depends_on(dep("~1")))
            .unwrap();
        assert_eq!(store.dependents(None, &id("1")).unwrap().len(), 2);
        assert!(store.dependents(None, &id("9")).is_err());
    }

    #[test]
    fn dependents_cache_forgets_deleted_tags() {
        let store = store();
        store.create_task(None, NewTask::new("a")).unwrap();
        let scratch = TagName::parse("scratch").unwrap();
        store
            .create_tag(&scratch, crate::tag::CreateTagOptions::default())
            .unwrap();
        store
            .create_task(Some(&scratch), NewTask::new("b"))
            .unwrap();

        store.dependents(None, &id("1")).unwrap();
        store.dependents(Some(&scratch), &id("1")).unwrap();
        assert_eq!(store.dependents.len(), 2);

        store.delete_tag(&scratch, false).unwrap();
        store.dependents(None, &id("1")).unwrap();
        assert_eq!(store.dependents.len(), 1);
    }

    #[test]
    fn flush_without_storage_fails() {
        let err = store().flush().unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));
    }
}
