//! Command-line interface for taskdb
//!
//! This module defines the CLI structure using clap derive macros.
//! Handlers live in per-area submodules and print through `crate::output`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::Result;
use crate::id::TagName;
use crate::output::OutputOptions;
use crate::store::Store;

mod dep;
mod init;
mod tag;
mod task;

/// taskdb - tagged hierarchical task store
///
/// Tasks live in named tags, nest as dotted subtasks (`3.1.2`), and depend
/// on each other within and across tags.
#[derive(Parser, Debug)]
#[command(name = "taskdb")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Project directory holding `.taskdb/` (defaults to current directory)
    #[arg(long, global = true, env = "TASKDB_DIR")]
    pub dir: Option<PathBuf>,

    /// Tag to operate on (defaults to the active tag)
    #[arg(long, global = true)]
    pub tag: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create `.taskdb/`, a default `.taskdb.toml`, and an empty document
    Init,

    /// Add a task (or a subtask with --parent)
    Add {
        /// Task title
        title: String,

        /// Parent task id; the new task becomes its next subtask
        #[arg(long)]
        parent: Option<String>,

        /// Explicit id instead of the next free one
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        details: Option<String>,

        #[arg(long)]
        test_strategy: Option<String>,

        /// high, medium or low (defaults to tasks.default_priority)
        #[arg(long)]
        priority: Option<String>,

        /// Dependencies such as `2`, `~2`, `feature-x:4` (repeatable)
        #[arg(long = "dep", value_name = "DEP")]
        deps: Vec<String>,
    },

    /// Show one task
    Show {
        id: String,
    },

    /// List tasks of a tag
    List {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        priority: Option<String>,

        /// Only top-level tasks
        #[arg(long)]
        top_level: bool,
    },

    /// Change a task's status
    SetStatus {
        id: String,
        status: String,
    },

    /// Update task fields
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        details: Option<String>,

        #[arg(long)]
        test_strategy: Option<String>,

        #[arg(long)]
        priority: Option<String>,

        #[arg(long)]
        status: Option<String>,

        /// Replace the dependency list (repeatable)
        #[arg(long = "dep", value_name = "DEP")]
        deps: Vec<String>,

        /// Replace the dependency list with an empty one
        #[arg(long, conflicts_with = "deps")]
        clear_deps: bool,
    },

    /// Delete a task and its subtasks
    Remove {
        id: String,

        /// Delete even if other tasks depend on it
        #[arg(long)]
        force: bool,
    },

    /// Dependency management
    #[command(subcommand)]
    Dep(DepCommands),

    /// Next task to work on
    Next,

    /// Validate dependencies of every tag
    Validate,

    /// Tag management
    #[command(subcommand)]
    Tag(TagCommands),

    /// Move tasks (with their subtasks) to another tag
    Move {
        /// Destination tag
        to: String,

        /// Task ids to move from --tag (or the active tag)
        #[arg(required = true)]
        ids: Vec<String>,

        /// Also move the same-tag tasks they depend on
        #[arg(long, conflicts_with = "ignore_dependencies")]
        with_dependencies: bool,

        /// Leave dependencies behind as cross-tag references
        #[arg(long)]
        ignore_dependencies: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum DepCommands {
    /// Add a dependency to a task
    Add {
        id: String,
        dependency: String,
    },

    /// Remove a dependency from a task
    Remove {
        id: String,
        dependency: String,
    },

    /// Report cycles, broken and cross-tag references of a tag
    Validate,

    /// Drop self, missing and broken references; qualify cross-tag ones
    Fix,
}

#[derive(Subcommand, Debug)]
pub enum TagCommands {
    /// List tags
    List {
        /// Glob filter such as `feature-*`
        pattern: Option<String>,
    },

    /// Create a tag
    Add {
        /// Tag name (omit with --from-branch)
        #[arg(required_unless_present = "from_branch")]
        name: Option<String>,

        /// Name the tag after the current git branch
        #[arg(long, conflicts_with = "name")]
        from_branch: bool,

        /// Copy all tasks from this tag
        #[arg(long)]
        copy_from: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a tag and its tasks
    Delete {
        name: String,

        /// Delete even if other tags reference it
        #[arg(long)]
        force: bool,
    },

    /// Make a tag the active one
    Use {
        name: String,
    },

    /// Rename a tag, rewriting references to it
    Rename {
        old: String,
        new: String,
    },

    /// Create a tag as a copy of another
    Copy {
        source: String,
        target: String,

        #[arg(long)]
        description: Option<String>,
    },
}

/// Flags shared by every command
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub dir: Option<PathBuf>,
    pub tag: Option<String>,
    pub json: bool,
    pub quiet: bool,
}

impl GlobalOptions {
    pub fn output(&self) -> OutputOptions {
        OutputOptions {
            json: self.json,
            quiet: self.quiet,
        }
    }

    pub fn project_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn open_store(&self) -> Result<Store> {
        Store::open_dir(&self.project_dir()?)
    }

    /// The `--tag` flag, parsed
    pub fn tag(&self) -> Result<Option<TagName>> {
        self.tag.as_deref().map(TagName::parse).transpose()
    }
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let global = GlobalOptions {
            dir: self.dir,
            tag: self.tag,
            json: self.json,
            quiet: self.quiet,
        };

        match self.command {
            Commands::Init => init::run(&global),
            Commands::Add {
                title,
                parent,
                id,
                description,
                details,
                test_strategy,
                priority,
                deps,
            } => task::run_add(
                &global,
                task::AddOptions {
                    title,
                    parent,
                    id,
                    description,
                    details,
                    test_strategy,
                    priority,
                    deps,
                },
            ),
            Commands::Show { id } => task::run_show(&global, &id),
            Commands::List {
                status,
                priority,
                top_level,
            } => task::run_list(
                &global,
                task::ListOptions {
                    status,
                    priority,
                    top_level,
                },
            ),
            Commands::SetStatus { id, status } => task::run_set_status(&global, &id, &status),
            Commands::Update {
                id,
                title,
                description,
                details,
                test_strategy,
                priority,
                status,
                deps,
                clear_deps,
            } => task::run_update(
                &global,
                task::UpdateOptions {
                    id,
                    title,
                    description,
                    details,
                    test_strategy,
                    priority,
                    status,
                    deps,
                    clear_deps,
                },
            ),
            Commands::Remove { id, force } => task::run_remove(&global, &id, force),
            Commands::Next => task::run_next(&global),
            Commands::Move {
                to,
                ids,
                with_dependencies,
                ignore_dependencies,
            } => task::run_move(
                &global,
                task::MoveArgs {
                    to,
                    ids,
                    with_dependencies,
                    ignore_dependencies,
                },
            ),
            Commands::Dep(cmd) => match cmd {
                DepCommands::Add { id, dependency } => dep::run_add(&global, &id, &dependency),
                DepCommands::Remove { id, dependency } => {
                    dep::run_remove(&global, &id, &dependency)
                }
                DepCommands::Validate => dep::run_validate(&global),
                DepCommands::Fix => dep::run_fix(&global),
            },
            Commands::Validate => dep::run_validate_all(&global),
            Commands::Tag(cmd) => match cmd {
                TagCommands::List { pattern } => tag::run_list(&global, pattern.as_deref()),
                TagCommands::Add {
                    name,
                    from_branch,
                    copy_from,
                    description,
                } => tag::run_add(
                    &global,
                    tag::AddOptions {
                        name,
                        from_branch,
                        copy_from,
                        description,
                    },
                ),
                TagCommands::Delete { name, force } => tag::run_delete(&global, &name, force),
                TagCommands::Use { name } => tag::run_use(&global, &name),
                TagCommands::Rename { old, new } => tag::run_rename(&global, &old, &new),
                TagCommands::Copy {
                    source,
                    target,
                    description,
                } => tag::run_copy(&global, &source, &target, description),
            },
        }
    }
}
