//! taskdb task command implementations.

use serde::Serialize;

use crate::cli::GlobalOptions;
use crate::error::Result;
use crate::graph::DependentRef;
use crate::id::{Dependency, TagName, TaskId};
use crate::output::{emit_success, HumanOutput};
use crate::store::DeleteReport;
use crate::tag::{MoveOptions, MoveReport};
use crate::task::{NewTask, Priority, StatusChange, Task, TaskFilter, TaskPatch, TaskStatus};

pub struct AddOptions {
    pub title: String,
    pub parent: Option<String>,
    pub id: Option<String>,
    pub description: Option<String>,
    pub details: Option<String>,
    pub test_strategy: Option<String>,
    pub priority: Option<String>,
    pub deps: Vec<String>,
}

pub struct ListOptions {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub top_level: bool,
}

pub struct UpdateOptions {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub details: Option<String>,
    pub test_strategy: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub deps: Vec<String>,
    pub clear_deps: bool,
}

pub struct MoveArgs {
    pub to: String,
    pub ids: Vec<String>,
    pub with_dependencies: bool,
    pub ignore_dependencies: bool,
}

#[derive(Serialize)]
struct TaskOutput {
    tag: TagName,
    task: Task,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dependents: Vec<DependentRef>,
}

#[derive(Serialize)]
struct TaskListOutput {
    tag: TagName,
    count: usize,
    tasks: Vec<Task>,
}

#[derive(Serialize)]
struct StatusOutput {
    tag: TagName,
    changes: Vec<StatusChange>,
}

#[derive(Serialize)]
struct NextOutput {
    tag: TagName,
    task: Option<Task>,
}

pub(crate) fn parse_deps(raw: &[String]) -> Result<Vec<Dependency>> {
    raw.iter().map(|dep| Dependency::parse(dep)).collect()
}

fn parse_priority(raw: Option<&str>) -> Result<Option<Priority>> {
    raw.map(str::parse).transpose()
}

fn parse_status(raw: Option<&str>) -> Result<Option<TaskStatus>> {
    raw.map(str::parse).transpose()
}

pub(crate) fn push_changes(human: &mut HumanOutput, changes: &[StatusChange]) {
    for change in changes {
        human.push_detail(format!("{}: {} -> {}", change.id, change.from, change.to));
    }
}

fn push_task_summary(human: &mut HumanOutput, task: &Task) {
    human.push_summary("Title", task.title.clone());
    human.push_summary("Status", task.status.to_string());
    human.push_summary("Priority", task.priority.to_string());
    if !task.dependencies.is_empty() {
        let deps: Vec<String> = task.dependencies.iter().map(|d| d.to_string()).collect();
        human.push_summary("Depends on", deps.join(", "));
    }
    if !task.broken_dependencies.is_empty() {
        let deps: Vec<String> = task
            .broken_dependencies
            .iter()
            .map(|d| d.to_string())
            .collect();
        human.push_warning(format!("broken dependencies: {}", deps.join(", ")));
    }
    if !task.description.is_empty() {
        human.push_summary("Description", task.description.clone());
    }
}

pub fn run_add(global: &GlobalOptions, options: AddOptions) -> Result<()> {
    let store = global.open_store()?;
    let tag = global.tag()?;

    let new = NewTask {
        id: options.id.as_deref().map(TaskId::parse).transpose()?,
        parent: options.parent.as_deref().map(TaskId::parse).transpose()?,
        title: options.title,
        description: options.description.unwrap_or_default(),
        details: options.details.unwrap_or_default(),
        test_strategy: options.test_strategy.unwrap_or_default(),
        priority: parse_priority(options.priority.as_deref())?,
        dependencies: parse_deps(&options.deps)?,
    };
    let id = store.create_task(tag.as_ref(), new)?;
    store.flush()?;

    let tag = store.snapshot()?.resolve_tag(tag.as_ref())?;
    let task = store
        .get_task(Some(&tag), &id)?
        .ok_or_else(|| crate::error::Error::TaskNotFound {
            tag: tag.clone(),
            id: id.clone(),
        })?;

    let mut human = HumanOutput::new(format!("Created task {id} in {tag}"));
    push_task_summary(&mut human, &task);
    if task.status == TaskStatus::Blocked {
        human.push_warning("waiting on unfinished dependencies");
    }

    let output = TaskOutput {
        tag,
        task,
        dependents: Vec::new(),
    };
    emit_success(global.output(), "add", &output, Some(&human))
}

pub fn run_show(global: &GlobalOptions, id: &str) -> Result<()> {
    let store = global.open_store()?;
    let id = TaskId::parse(id)?;
    let tag = store.snapshot()?.resolve_tag(global.tag()?.as_ref())?;
    let task = store
        .get_task(Some(&tag), &id)?
        .ok_or_else(|| crate::error::Error::TaskNotFound {
            tag: tag.clone(),
            id: id.clone(),
        })?;
    let dependents = store.dependents(Some(&tag), &id)?;

    let mut human = HumanOutput::new(format!("Task {id} ({tag})"));
    push_task_summary(&mut human, &task);
    if !dependents.is_empty() {
        let refs: Vec<String> = dependents.iter().map(|d| d.to_string()).collect();
        human.push_summary("Required by", refs.join(", "));
    }
    if !task.details.is_empty() {
        human.push_detail(task.details.clone());
    }

    let output = TaskOutput {
        tag,
        task,
        dependents,
    };
    emit_success(global.output(), "show", &output, Some(&human))
}

pub fn run_list(global: &GlobalOptions, options: ListOptions) -> Result<()> {
    let store = global.open_store()?;
    let filter = TaskFilter {
        status: parse_status(options.status.as_deref())?,
        priority: parse_priority(options.priority.as_deref())?,
        top_level_only: options.top_level,
    };
    let listing = store.list_tasks(global.tag()?.as_ref(), filter)?;

    let mut human = HumanOutput::new(format!("Tasks in {}", listing.tag()));
    for task in &listing {
        let indent = "  ".repeat(task.id.depth() - 1);
        human.push_detail(format!(
            "{indent}{} [{}] {} ({})",
            task.id, task.status, task.title, task.priority
        ));
    }
    human.push_summary("Count", listing.count().to_string());

    let output = TaskListOutput {
        tag: listing.tag().clone(),
        count: listing.count(),
        tasks: listing.to_vec(),
    };
    emit_success(global.output(), "list", &output, Some(&human))
}

pub fn run_set_status(global: &GlobalOptions, id: &str, status: &str) -> Result<()> {
    let store = global.open_store()?;
    let id = TaskId::parse(id)?;
    let status: TaskStatus = status.parse()?;
    let tag = store.snapshot()?.resolve_tag(global.tag()?.as_ref())?;
    let changes = store.set_status(Some(&tag), &id, status)?;
    store.flush()?;

    let mut human = HumanOutput::new(format!("Task {id} is now {status}"));
    push_changes(&mut human, &changes);

    let output = StatusOutput { tag, changes };
    emit_success(global.output(), "set-status", &output, Some(&human))
}

pub fn run_update(global: &GlobalOptions, options: UpdateOptions) -> Result<()> {
    let store = global.open_store()?;
    let id = TaskId::parse(&options.id)?;
    let tag = store.snapshot()?.resolve_tag(global.tag()?.as_ref())?;

    let dependencies = if options.clear_deps {
        Some(Vec::new())
    } else if options.deps.is_empty() {
        None
    } else {
        Some(parse_deps(&options.deps)?)
    };
    let patch = TaskPatch {
        title: options.title,
        description: options.description,
        details: options.details,
        test_strategy: options.test_strategy,
        priority: parse_priority(options.priority.as_deref())?,
        status: parse_status(options.status.as_deref())?,
        dependencies,
    };
    if patch.is_empty() {
        return Err(crate::error::Error::InvalidArgument(
            "nothing to update; pass at least one field".to_string(),
        ));
    }

    let task = store.update_task(Some(&tag), &id, patch)?;
    store.flush()?;

    let mut human = HumanOutput::new(format!("Updated task {id}"));
    push_task_summary(&mut human, &task);

    let output = TaskOutput {
        tag,
        task,
        dependents: Vec::new(),
    };
    emit_success(global.output(), "update", &output, Some(&human))
}

pub fn run_remove(global: &GlobalOptions, id: &str, force: bool) -> Result<()> {
    let store = global.open_store()?;
    let id = TaskId::parse(id)?;
    let report: DeleteReport = store.delete_task(global.tag()?.as_ref(), &id, force)?;
    store.flush()?;

    let mut human = HumanOutput::new(format!(
        "Removed {} task(s) from {}",
        report.removed.len(),
        report.tag
    ));
    for removed in &report.removed {
        human.push_detail(format!("removed {removed}"));
    }
    if !report.broken.is_empty() {
        let refs: Vec<String> = report.broken.iter().map(|r| r.to_string()).collect();
        human.push_warning(format!("left broken references in {}", refs.join(", ")));
        human.push_next_step("taskdb dep fix");
    }
    if let Some(backup) = &report.backup {
        human.push_summary("Backup", backup.display().to_string());
    }
    push_changes(&mut human, &report.status_changes);

    emit_success(global.output(), "remove", &report, Some(&human))
}

pub fn run_next(global: &GlobalOptions) -> Result<()> {
    let store = global.open_store()?;
    let tag = store.snapshot()?.resolve_tag(global.tag()?.as_ref())?;
    let task = store.next_task(Some(&tag))?;

    let human = match &task {
        Some(task) => {
            let mut human = HumanOutput::new(format!("Next: {} {}", task.id, task.title));
            push_task_summary(&mut human, task);
            human.push_next_step(format!("taskdb set-status {} in-progress", task.id));
            human
        }
        None => HumanOutput::new(format!("Nothing to work on in {tag}")),
    };

    let output = NextOutput { tag, task };
    emit_success(global.output(), "next", &output, Some(&human))
}

pub fn run_move(global: &GlobalOptions, args: MoveArgs) -> Result<()> {
    let store = global.open_store()?;
    let from = store.snapshot()?.resolve_tag(global.tag()?.as_ref())?;
    let to = TagName::parse(&args.to)?;
    let ids = args
        .ids
        .iter()
        .map(|id| TaskId::parse(id))
        .collect::<Result<Vec<_>>>()?;

    let report: MoveReport = store.move_tasks(
        &from,
        &to,
        &ids,
        MoveOptions {
            with_dependencies: args.with_dependencies,
            ignore_dependencies: args.ignore_dependencies,
        },
    )?;
    store.flush()?;

    let mut human = HumanOutput::new(format!(
        "Moved {} task(s) from {} to {}",
        report.moved.len(),
        report.from,
        report.to
    ));
    if !report.pulled.is_empty() {
        let pulled: Vec<String> = report.pulled.iter().map(|id| id.to_string()).collect();
        human.push_summary("Pulled dependencies", pulled.join(", "));
    }
    if !report.rewritten.is_empty() {
        let refs: Vec<String> = report.rewritten.iter().map(|r| r.to_string()).collect();
        human.push_summary("Rewritten references", refs.join(", "));
    }
    for changes in report.status_changes.values() {
        push_changes(&mut human, changes);
    }

    emit_success(global.output(), "move", &report, Some(&human))
}
