//! taskdb dependency command implementations.

use serde::Serialize;

use crate::cli::task::push_changes;
use crate::cli::GlobalOptions;
use crate::error::{Error, Result};
use crate::graph::ValidationReport;
use crate::id::{Dependency, TagName, TaskId};
use crate::output::{emit_success, HumanOutput};
use crate::store::FixAction;
use crate::task::StatusChange;

#[derive(Serialize)]
struct DepChangeOutput {
    tag: TagName,
    task: TaskId,
    dependency: Dependency,
    changed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    status_changes: Vec<StatusChange>,
}

#[derive(Serialize)]
struct ValidateAllOutput {
    clean: bool,
    tags: Vec<ValidationReport>,
}

pub fn run_add(global: &GlobalOptions, id: &str, dependency: &str) -> Result<()> {
    let store = global.open_store()?;
    let id = TaskId::parse(id)?;
    let dependency = Dependency::parse(dependency)?;
    let tag = store.snapshot()?.resolve_tag(global.tag()?.as_ref())?;

    let before = store.get_task(Some(&tag), &id)?;
    let status_changes = store.add_dependency(Some(&tag), &id, dependency.clone())?;
    let after = store.get_task(Some(&tag), &id)?;
    let changed = before != after;
    if changed {
        store.flush()?;
    }

    let header = if changed {
        format!("Task {id} now depends on {dependency}")
    } else {
        format!("Task {id} already depends on {dependency}")
    };
    let mut human = HumanOutput::new(header);
    push_changes(&mut human, &status_changes);

    let output = DepChangeOutput {
        tag,
        task: id,
        dependency,
        changed,
        status_changes,
    };
    emit_success(global.output(), "dep add", &output, Some(&human))
}

pub fn run_remove(global: &GlobalOptions, id: &str, dependency: &str) -> Result<()> {
    let store = global.open_store()?;
    let id = TaskId::parse(id)?;
    let dependency = Dependency::parse(dependency)?;
    let tag = store.snapshot()?.resolve_tag(global.tag()?.as_ref())?;

    let changed = store.remove_dependency(Some(&tag), &id, &dependency)?;
    if !changed {
        return Err(Error::InvalidArgument(format!(
            "task {id} does not depend on {dependency}"
        )));
    }
    store.flush()?;

    let human = HumanOutput::new(format!("Task {id} no longer depends on {dependency}"));
    let output = DepChangeOutput {
        tag,
        task: id,
        dependency,
        changed,
        status_changes: Vec::new(),
    };
    emit_success(global.output(), "dep remove", &output, Some(&human))
}

fn push_report(human: &mut HumanOutput, report: &ValidationReport) {
    for cycle in &report.cycles {
        let path: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
        human.push_warning(format!("{}: cycle {}", report.tag, path.join(" -> ")));
    }
    for broken in &report.broken_dependencies {
        human.push_warning(format!(
            "{}: task {} has broken dependency {}",
            report.tag, broken.task, broken.dependency
        ));
    }
    for cross in &report.cross_tag_dependencies {
        human.push_detail(format!(
            "{}: task {} depends on {} in {}",
            report.tag, cross.task, cross.dependency, cross.target_tag
        ));
    }
}

pub fn run_validate(global: &GlobalOptions) -> Result<()> {
    let store = global.open_store()?;
    let report = store.validate(global.tag()?.as_ref())?;

    let header = if report.is_clean() {
        format!("Dependencies of {} are valid", report.tag)
    } else {
        format!("Dependencies of {} need attention", report.tag)
    };
    let mut human = HumanOutput::new(header);
    push_report(&mut human, &report);
    if !report.broken_dependencies.is_empty() {
        human.push_next_step("taskdb dep fix");
    }

    emit_success(global.output(), "dep validate", &report, Some(&human))
}

pub fn run_validate_all(global: &GlobalOptions) -> Result<()> {
    let store = global.open_store()?;
    let tags = store.validate_all()?;
    let clean = tags.iter().all(ValidationReport::is_clean);

    let mut human = HumanOutput::new(if clean {
        "All tags are valid"
    } else {
        "Some tags need attention"
    });
    human.push_summary("Tags", tags.len().to_string());
    for report in &tags {
        push_report(&mut human, report);
    }

    let output = ValidateAllOutput { clean, tags };
    emit_success(global.output(), "validate", &output, Some(&human))
}

pub fn run_fix(global: &GlobalOptions) -> Result<()> {
    let store = global.open_store()?;
    let report = store.fix_dependencies(global.tag()?.as_ref())?;
    if !report.fixes.is_empty() {
        store.flush()?;
    }

    let mut human = HumanOutput::new(format!(
        "Applied {} fix(es) in {}",
        report.fixes.len(),
        report.tag
    ));
    for fix in &report.fixes {
        let action = match &fix.action {
            FixAction::RemovedSelf => "removed self reference".to_string(),
            FixAction::RemovedMissing => "removed missing reference".to_string(),
            FixAction::Qualified { target_tag } => format!("qualified as {target_tag}"),
            FixAction::ClearedBroken => "cleared broken reference".to_string(),
        };
        human.push_detail(format!("{} -> {}: {action}", fix.task, fix.dependency));
    }
    push_changes(&mut human, &report.status_changes);

    emit_success(global.output(), "dep fix", &report, Some(&human))
}
