//! Error types for taskdb
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad id or tag grammar, missing task/tag, bad config)
//! - 3: Blocked by policy (cycle, dependency in use, limits, active tag)
//! - 4: Operation failed (I/O, schema version, lock, corrupt document)

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::id::{Dependency, TagName, TaskId};
use crate::task::TaskStatus;

/// Exit codes for the taskdb CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const POLICY_BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Which configured capacity a mutation would exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Tags,
    TasksPerTag,
    Depth,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LimitKind::Tags => "tags",
            LimitKind::TasksPerTag => "tasks per tag",
            LimitKind::Depth => "subtask depth",
        };
        f.write_str(label)
    }
}

/// Main error type for taskdb operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid task id '{input}': {reason}")]
    InvalidId { input: String, reason: String },

    #[error("Invalid tag name '{input}': {reason}")]
    InvalidTagName { input: String, reason: String },

    #[error("Task {id} already exists in tag {tag}")]
    DuplicateId { tag: TagName, id: TaskId },

    #[error("Tag already exists: {0}")]
    DuplicateTag(TagName),

    #[error("Tag not found: {0}")]
    TagNotFound(TagName),

    #[error("Task {id} not found in tag {tag}")]
    TaskNotFound { tag: TagName, id: TaskId },

    #[error("Parent task {parent} not found in tag {tag}")]
    ParentNotFound { tag: TagName, parent: TaskId },

    #[error("Task {task} in tag {tag} depends on unknown task {dependency}")]
    UnresolvedDependency {
        tag: TagName,
        task: TaskId,
        dependency: Dependency,
    },

    #[error("Not a git repository: {0}")]
    RepoNotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Policy blocks (exit code 3)
    #[error("Circular dependency in tag {tag}: {}", format_path(cycle_path))]
    CircularDependency {
        tag: TagName,
        cycle_path: Vec<TaskId>,
    },

    #[error("{target} is still required by {}", format_refs(dependents))]
    DependencyInUse {
        target: String,
        dependents: Vec<String>,
    },

    #[error("Limit exceeded: at most {limit} {kind}")]
    LimitExceeded { kind: LimitKind, limit: usize },

    #[error("Cannot delete active tag {0}; switch to another tag first")]
    ActiveTagDeletion(TagName),

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    // Operation failures (exit code 4)
    #[error("Unsupported schema version {found} (this build reads up to {supported})")]
    SchemaVersion { found: u64, supported: u64 },

    #[error("Corrupt task document: {0}")]
    CorruptDocument(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_refs(refs: &[String]) -> String {
    refs.join(", ")
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidId { .. }
            | Error::InvalidTagName { .. }
            | Error::DuplicateId { .. }
            | Error::DuplicateTag(_)
            | Error::TagNotFound(_)
            | Error::TaskNotFound { .. }
            | Error::ParentNotFound { .. }
            | Error::UnresolvedDependency { .. }
            | Error::RepoNotFound(_)
            | Error::InvalidConfig(_)
            | Error::InvalidArgument(_) => exit_codes::USER_ERROR,

            // Policy blocks
            Error::CircularDependency { .. }
            | Error::DependencyInUse { .. }
            | Error::LimitExceeded { .. }
            | Error::ActiveTagDeletion(_)
            | Error::InvalidStatusTransition { .. } => exit_codes::POLICY_BLOCKED,

            // Operation failures
            Error::SchemaVersion { .. }
            | Error::CorruptDocument(_)
            | Error::Git(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured details for machine-readable output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::CircularDependency { tag, cycle_path } => Some(serde_json::json!({
                "tag": tag,
                "cycle_path": cycle_path,
            })),
            Error::DependencyInUse { target, dependents } => Some(serde_json::json!({
                "target": target,
                "dependents": dependents,
            })),
            Error::LimitExceeded { kind, limit } => Some(serde_json::json!({
                "kind": kind,
                "limit": limit,
            })),
            Error::SchemaVersion { found, supported } => Some(serde_json::json!({
                "found": found,
                "supported": supported,
            })),
            _ => None,
        }
    }
}

/// Result type alias for taskdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
