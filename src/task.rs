//! Task model and status state machine.
//!
//! Tasks live in a flat table per tag keyed by their full hierarchical id;
//! parent/child relationships are derived from the id. The `blocked` status is
//! never set by callers: [`reconcile`] enters and leaves it from dependency
//! state after every dependency- or status-affecting mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{Dependency, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
    Deferred,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Blocked,
        TaskStatus::Deferred,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// `done` and `cancelled` only leave through an explicit reopen
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }

    /// Explicit transitions. `blocked` is never a valid explicit target.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (_, Blocked) => false,
            (Pending, InProgress | Deferred | Cancelled) => true,
            (InProgress, Done | Pending | Deferred | Cancelled) => true,
            (Blocked, Deferred | Cancelled) => true,
            (Deferred, Pending | Cancelled) => true,
            (Done | Cancelled, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown task status '{}' (expected pending|in-progress|done|blocked|deferred|cancelled)",
                    s.trim()
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Lower rank sorts first
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(Error::InvalidArgument(format!(
                "unknown task priority '{other}' (expected high|medium|low)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// References whose target was force-deleted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub broken_dependencies: Vec<Dependency>,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub test_strategy: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: Priority::default(),
            dependencies: Vec::new(),
            broken_dependencies: Vec::new(),
            details: String::new(),
            test_strategy: String::new(),
            created: now,
            updated: now,
        }
    }

    pub fn hard_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|dep| dep.is_hard())
    }
}

/// Input for `Store::create_task`.
///
/// With no `id` the store allocates the next free id, under `parent` when set.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: Option<TaskId>,
    pub parent: Option<TaskId>,
    pub title: String,
    pub description: String,
    pub details: String,
    pub test_strategy: String,
    pub priority: Option<Priority>,
    pub dependencies: Vec<Dependency>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// Partial update for `Store::update_task`; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub details: Option<String>,
    pub test_strategy: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<TaskStatus>,
    pub dependencies: Option<Vec<Dependency>>,
}

impl TaskPatch {
    pub fn dependencies(deps: Vec<Dependency>) -> Self {
        Self {
            dependencies: Some(deps),
            ..Self::default()
        }
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.details.is_none()
            && self.test_strategy.is_none()
            && self.priority.is_none()
            && self.status.is_none()
            && self.dependencies.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub top_level_only: bool,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority != priority {
                return false;
            }
        }
        !self.top_level_only || task.id.is_top_level()
    }
}

/// A status change made by the store, explicit or from reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Controls which dependencies gate `blocked`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingPolicy {
    pub cross_tag_blocks: bool,
}

/// Hard dependencies that are not `done` yet.
///
/// `status_of` returns `None` for targets that do not resolve; those never
/// block (they are reported by validation instead). Soft and broken
/// dependencies never block; cross-tag ones only when the policy says so.
pub fn unmet_hard_dependencies<'a, F>(
    task: &'a Task,
    status_of: F,
    policy: BlockingPolicy,
) -> Vec<&'a Dependency>
where
    F: Fn(&Dependency) -> Option<TaskStatus>,
{
    task.hard_dependencies()
        .filter(|dep| policy.cross_tag_blocks || !dep.is_cross_tag())
        .filter(|dep| matches!(status_of(dep), Some(status) if status != TaskStatus::Done))
        .collect()
}

/// Explicit transition check for `set_status`.
pub fn check_transition<F>(
    task: &Task,
    to: TaskStatus,
    status_of: F,
    policy: BlockingPolicy,
) -> Result<()>
where
    F: Fn(&Dependency) -> Option<TaskStatus>,
{
    if task.status == to {
        return Ok(());
    }
    let invalid = Error::InvalidStatusTransition {
        id: task.id.clone(),
        from: task.status,
        to,
    };
    if !task.status.can_transition_to(to) {
        return Err(invalid);
    }
    if matches!(to, TaskStatus::InProgress | TaskStatus::Done)
        && !unmet_hard_dependencies(task, status_of, policy).is_empty()
    {
        return Err(invalid);
    }
    Ok(())
}

/// Reconciliation pass over one tag's table, computed without mutating it.
///
/// `pending`/`in-progress` tasks with an unmet hard dependency enter
/// `blocked`; `blocked` tasks whose hard dependencies are all met return to
/// `pending`. Same-tag targets are looked up in `tasks`; `external` answers for
/// explicit cross-tag references. Reconciliation never changes which tasks are
/// `done`, so a single pass reaches the fixed point.
pub fn reconciliation_changes<F>(
    tasks: &BTreeMap<TaskId, Task>,
    external: F,
    policy: BlockingPolicy,
) -> Vec<StatusChange>
where
    F: Fn(&Dependency) -> Option<TaskStatus>,
{
    let status_of = |dep: &Dependency| {
        if dep.is_cross_tag() {
            external(dep)
        } else {
            tasks.get(&dep.id).map(|task| task.status)
        }
    };

    tasks
        .values()
        .filter_map(|task| {
            let blocked = !unmet_hard_dependencies(task, &status_of, policy).is_empty();
            let next = match (task.status, blocked) {
                (TaskStatus::Pending | TaskStatus::InProgress, true) => TaskStatus::Blocked,
                (TaskStatus::Blocked, false) => TaskStatus::Pending,
                _ => return None,
            };
            Some(StatusChange {
                id: task.id.clone(),
                from: task.status,
                to: next,
            })
        })
        .collect()
}

pub fn apply_status_changes(
    tasks: &mut BTreeMap<TaskId, Task>,
    changes: &[StatusChange],
    now: DateTime<Utc>,
) {
    for change in changes {
        if let Some(task) = tasks.get_mut(&change.id) {
            task.status = change.to;
            task.updated = now;
        }
    }
}

/// Compute and apply one reconciliation pass.
pub fn reconcile<F>(
    tasks: &mut BTreeMap<TaskId, Task>,
    external: F,
    policy: BlockingPolicy,
    now: DateTime<Utc>,
) -> Vec<StatusChange>
where
    F: Fn(&Dependency) -> Option<TaskStatus>,
{
    let changes = reconciliation_changes(tasks, external, policy);
    apply_status_changes(tasks, &changes, now);
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).expect("id")
    }

    fn table(entries: &[(&str, TaskStatus, &[&str])]) -> BTreeMap<TaskId, Task> {
        let now = Utc::now();
        entries
            .iter()
            .map(|(raw, status, deps)| {
                let mut task = Task::new(id(raw), format!("task {raw}"), now);
                task.status = *status;
                task.dependencies = deps
                    .iter()
                    .map(|dep| Dependency::parse(dep).expect("dep"))
                    .collect();
                (task.id.clone(), task)
            })
            .collect()
    }

    #[test]
    fn status_parses_aliases() {
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!(" Done ".parse::<TaskStatus>().unwrap(), TaskStatus::Done);
        assert!("finished".parse::<TaskStatus>().is_err());
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
    }

    #[test]
    fn transition_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Done));
        assert!(!Pending.can_transition_to(Done));
        assert!(!Done.can_transition_to(InProgress));
        assert!(Done.can_transition_to(Pending));
        assert!(Cancelled.can_transition_to(Pending));
        assert!(Blocked.can_transition_to(Cancelled));
        for from in TaskStatus::ALL {
            assert!(!from.can_transition_to(Blocked));
            if !from.is_terminal() && from != Cancelled {
                assert!(from.can_transition_to(Cancelled), "{from} -> cancelled");
            }
        }
    }

    #[test]
    fn starting_with_unmet_dependency_is_rejected() {
        let tasks = table(&[
            ("1", TaskStatus::Pending, &[]),
            ("2", TaskStatus::Pending, &["1"]),
        ]);
        let status_of = |dep: &Dependency| tasks.get(&dep.id).map(|t| t.status);
        let err = check_transition(
            &tasks[&id("2")],
            TaskStatus::InProgress,
            status_of,
            BlockingPolicy::default(),
        )
        .expect_err("blocked start");
        assert!(matches!(err, Error::InvalidStatusTransition { .. }));
    }

    #[test]
    fn reconcile_blocks_and_unblocks() {
        let mut tasks = table(&[
            ("1", TaskStatus::InProgress, &[]),
            ("2", TaskStatus::Pending, &["1"]),
            ("3", TaskStatus::Pending, &["~1"]),
            ("4", TaskStatus::Deferred, &["1"]),
        ]);
        let changes = reconcile(&mut tasks, |_| None, BlockingPolicy::default(), Utc::now());
        assert_eq!(
            changes,
            vec![StatusChange {
                id: id("2"),
                from: TaskStatus::Pending,
                to: TaskStatus::Blocked,
            }]
        );
        assert_eq!(tasks[&id("3")].status, TaskStatus::Pending);
        assert_eq!(tasks[&id("4")].status, TaskStatus::Deferred);

        tasks.get_mut(&id("1")).unwrap().status = TaskStatus::Done;
        let changes = reconcile(&mut tasks, |_| None, BlockingPolicy::default(), Utc::now());
        assert_eq!(changes.len(), 1);
        assert_eq!(tasks[&id("2")].status, TaskStatus::Pending);
    }

    #[test]
    fn cross_tag_blocking_follows_policy() {
        let mut tasks = table(&[("1", TaskStatus::Pending, &["other:7"])]);
        let external = |_: &Dependency| Some(TaskStatus::Pending);

        let changes = reconcile(&mut tasks, external, BlockingPolicy::default(), Utc::now());
        assert!(changes.is_empty());

        let policy = BlockingPolicy {
            cross_tag_blocks: true,
        };
        let changes = reconcile(&mut tasks, external, policy, Utc::now());
        assert_eq!(changes.len(), 1);
        assert_eq!(tasks[&id("1")].status, TaskStatus::Blocked);
    }

    #[test]
    fn unresolved_targets_do_not_block() {
        let mut tasks = table(&[("2", TaskStatus::Pending, &["9"])]);
        let changes = reconcile(&mut tasks, |_| None, BlockingPolicy::default(), Utc::now());
        assert!(changes.is_empty());
    }

    #[test]
    fn filter_matches_status_priority_and_level() {
        let tasks = table(&[("1", TaskStatus::Pending, &[]), ("1.1", TaskStatus::Done, &[])]);
        let filter = TaskFilter {
            status: Some(TaskStatus::Done),
            ..TaskFilter::default()
        };
        assert!(!filter.matches(&tasks[&id("1")]));
        assert!(filter.matches(&tasks[&id("1.1")]));

        let top = TaskFilter {
            top_level_only: true,
            ..TaskFilter::default()
        };
        assert!(top.matches(&tasks[&id("1")]));
        assert!(!top.matches(&tasks[&id("1.1")]));
    }
}
