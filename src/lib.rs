//! taskdb - tagged hierarchical task store
//!
//! Tasks are grouped into named tags, nest as dotted subtasks (`3.1.2`) and
//! depend on each other within a tag or across tags (`feature-x:4`). The
//! store keeps `blocked` consistent with dependency state, rejects cycles,
//! and persists everything as one versioned JSON document.
//!
//! # Module Organization
//!
//! - `cli`: Command-line interface using clap
//! - `config`: Configuration loading from `.taskdb.toml`
//! - `document`: Versioned on-disk document and schema migrations
//! - `error`: Error types and result aliases
//! - `git`: Branch lookup for branch-named tags
//! - `graph`: Cycle detection, validation and reverse dependency index
//! - `id`: Task ids, tag names and dependency references
//! - `lock`: File locking and atomic writes
//! - `output`: Human and JSON command output
//! - `storage`: On-disk layout, locked document I/O and backups
//! - `store`: The concurrent task store and task operations
//! - `tag`: Tags and tag-level operations
//! - `task`: Task records, statuses and blocking rules

pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod git;
pub mod graph;
pub mod id;
pub mod lock;
pub mod output;
pub mod storage;
pub mod store;
pub mod tag;
pub mod task;

pub use error::{Error, Result};
pub use id::{Dependency, TagName, TaskId};
pub use store::Store;
pub use task::{Priority, Task, TaskStatus};
