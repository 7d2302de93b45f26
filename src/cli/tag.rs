//! taskdb tag command implementations.

use serde::Serialize;

use crate::cli::GlobalOptions;
use crate::error::Result;
use crate::id::TagName;
use crate::output::{emit_success, HumanOutput};
use crate::tag::{CreateTagOptions, TagSummary};

pub struct AddOptions {
    pub name: Option<String>,
    pub from_branch: bool,
    pub copy_from: Option<String>,
    pub description: Option<String>,
}

#[derive(Serialize)]
struct TagListOutput {
    current: TagName,
    tags: Vec<TagSummary>,
}

#[derive(Serialize)]
struct RenameOutput {
    from: TagName,
    to: TagName,
}

#[derive(Serialize)]
struct UseOutput {
    current: TagName,
}

fn push_tag_summary(human: &mut HumanOutput, tag: &TagSummary) {
    human.push_summary("Kind", tag.kind.to_string());
    human.push_summary("Tasks", tag.metadata.task_count.to_string());
    if let Some(parent) = &tag.parent_tag {
        human.push_summary("Copied from", parent.to_string());
    }
    if let Some(branch) = &tag.git_branch {
        human.push_summary("Branch", branch.clone());
    }
    if !tag.description.is_empty() {
        human.push_summary("Description", tag.description.clone());
    }
}

pub fn run_list(global: &GlobalOptions, pattern: Option<&str>) -> Result<()> {
    let store = global.open_store()?;
    let tags = store.list_tags(pattern)?;
    let current = store.current_tag()?;

    let mut human = HumanOutput::new(format!("{} tag(s)", tags.len()));
    for tag in &tags {
        let marker = if tag.active { "*" } else { " " };
        human.push_detail(format!(
            "{marker} {} ({}) {}/{} done",
            tag.name, tag.kind, tag.metadata.completed_count, tag.metadata.task_count
        ));
    }

    let output = TagListOutput { current, tags };
    emit_success(global.output(), "tag list", &output, Some(&human))
}

pub fn run_add(global: &GlobalOptions, options: AddOptions) -> Result<()> {
    let store = global.open_store()?;
    let create = CreateTagOptions {
        copy_from: options.copy_from.as_deref().map(TagName::parse).transpose()?,
        description: options.description,
        ..CreateTagOptions::default()
    };

    let summary = match options.name {
        Some(name) if !options.from_branch => store.create_tag(&TagName::parse(&name)?, create)?,
        _ => store.create_tag_from_branch(&global.project_dir()?, create)?,
    };
    store.flush()?;

    let mut human = HumanOutput::new(format!("Created tag {}", summary.name));
    push_tag_summary(&mut human, &summary);
    human.push_next_step(format!("taskdb tag use {}", summary.name));

    emit_success(global.output(), "tag add", &summary, Some(&human))
}

pub fn run_copy(
    global: &GlobalOptions,
    source: &str,
    target: &str,
    description: Option<String>,
) -> Result<()> {
    let store = global.open_store()?;
    let summary = store.create_tag(
        &TagName::parse(target)?,
        CreateTagOptions {
            copy_from: Some(TagName::parse(source)?),
            description,
            ..CreateTagOptions::default()
        },
    )?;
    store.flush()?;

    let mut human = HumanOutput::new(format!("Copied {source} to {}", summary.name));
    push_tag_summary(&mut human, &summary);

    emit_success(global.output(), "tag copy", &summary, Some(&human))
}

pub fn run_delete(global: &GlobalOptions, name: &str, force: bool) -> Result<()> {
    let store = global.open_store()?;
    let report = store.delete_tag(&TagName::parse(name)?, force)?;
    store.flush()?;

    let mut human = HumanOutput::new(format!(
        "Deleted tag {} ({} task(s))",
        report.tag, report.removed_tasks
    ));
    if let Some(backup) = &report.backup {
        human.push_summary("Backup", backup.display().to_string());
    }
    if !report.broken.is_empty() {
        let refs: Vec<String> = report.broken.iter().map(|r| r.to_string()).collect();
        human.push_warning(format!("left broken references in {}", refs.join(", ")));
    }

    emit_success(global.output(), "tag delete", &report, Some(&human))
}

pub fn run_use(global: &GlobalOptions, name: &str) -> Result<()> {
    let store = global.open_store()?;
    let name = TagName::parse(name)?;
    store.switch_active(&name)?;
    store.flush()?;

    let human = HumanOutput::new(format!("Active tag is now {name}"));
    emit_success(global.output(), "tag use", &UseOutput { current: name }, Some(&human))
}

pub fn run_rename(global: &GlobalOptions, old: &str, new: &str) -> Result<()> {
    let store = global.open_store()?;
    let from = TagName::parse(old)?;
    let to = TagName::parse(new)?;
    store.rename_tag(&from, &to)?;
    store.flush()?;

    let human = HumanOutput::new(format!("Renamed tag {from} to {to}"));
    emit_success(global.output(), "tag rename", &RenameOutput { from, to }, Some(&human))
}
