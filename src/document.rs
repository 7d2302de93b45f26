//! Versioned persistence document and schema migrations.
//!
//! The on-disk form is one JSON object: reserved `_schemaVersion` and
//! `_currentTag` keys plus one key per tag. Tasks are nested (subtasks under
//! their parent) in the document and flat in memory.
//!
//! Older layouts are upgraded step by step before deserialization:
//! - v1: `{ "tasks": [...] }`, a single untagged list
//! - v2: `{ "<tag>": { "tasks": [...], "metadata": {...} } }`, numeric subtask
//!   ids relative to the parent, numeric dependencies
//! - v3: the current layout

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph;
use crate::id::{normalize_dependencies, Dependency, TagName, TaskId};
use crate::store::StoreState;
use crate::tag::{Tag, TagKind};
use crate::task::{Priority, Task, TaskStatus};

pub const CURRENT_SCHEMA_VERSION: u64 = 3;

const SCHEMA_VERSION_KEY: &str = "_schemaVersion";
const CURRENT_TAG_KEY: &str = "_currentTag";
const RESERVED_PREFIX: char = '_';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_schemaVersion")]
    pub schema_version: u64,
    #[serde(rename = "_currentTag")]
    pub current_tag: TagName,
    #[serde(flatten)]
    pub tags: BTreeMap<String, TagRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub metadata: TagMetadataRecord,
}

/// Stored tag metadata. The counts are written for readers of the file and
/// ignored on load; they are always derived from the tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagMetadataRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TagKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tag: Option<TagName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub task_count: usize,
    #[serde(default)]
    pub completed_count: usize,
    #[serde(default)]
    pub in_progress_count: usize,
    #[serde(default)]
    pub blocked_count: usize,
}

impl Default for TagMetadataRecord {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            kind: None,
            parent_tag: None,
            git_branch: None,
            description: String::new(),
            created: now,
            updated: now,
            task_count: 0,
            completed_count: 0,
            in_progress_count: 0,
            blocked_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub broken_dependencies: Vec<Dependency>,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub test_strategy: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<TaskRecord>,
}

impl TaskRecord {
    fn from_task(task: &Task, subtasks: Vec<TaskRecord>) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            priority: task.priority,
            dependencies: task.dependencies.clone(),
            broken_dependencies: task.broken_dependencies.clone(),
            details: task.details.clone(),
            test_strategy: task.test_strategy.clone(),
            created: task.created,
            updated: task.updated,
            subtasks,
        }
    }

    /// Flatten into `out`, checking that every subtask id extends its parent.
    fn flatten_into(
        self,
        tag: &TagName,
        parent: Option<&TaskId>,
        out: &mut BTreeMap<TaskId, Task>,
    ) -> Result<()> {
        let well_placed = match parent {
            Some(parent) => self.id.is_child_of(parent),
            None => self.id.is_top_level(),
        };
        if !well_placed {
            return Err(Error::CorruptDocument(format!(
                "task {} in tag {tag} is nested under {}",
                self.id,
                parent.map_or_else(|| "the tag root".to_string(), |p| format!("task {p}"))
            )));
        }
        if out.contains_key(&self.id) {
            return Err(Error::DuplicateId {
                tag: tag.clone(),
                id: self.id,
            });
        }

        let task = Task {
            id: self.id.clone(),
            title: self.title,
            description: self.description,
            status: self.status,
            priority: self.priority,
            dependencies: normalize_dependencies(tag, self.dependencies),
            broken_dependencies: normalize_dependencies(tag, self.broken_dependencies),
            details: self.details,
            test_strategy: self.test_strategy,
            created: self.created,
            updated: self.updated,
        };
        out.insert(self.id.clone(), task);
        for subtask in self.subtasks {
            subtask.flatten_into(tag, Some(&self.id), out)?;
        }
        Ok(())
    }
}

impl Document {
    /// Parse, upgrading older schema versions.
    pub fn from_json(input: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(input)
            .map_err(|err| Error::CorruptDocument(format!("invalid JSON: {err}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let mut value = migrate(value)?;
        if let Value::Object(map) = &mut value {
            map.retain(|key, _| {
                let keep = !key.starts_with(RESERVED_PREFIX)
                    || key == SCHEMA_VERSION_KEY
                    || key == CURRENT_TAG_KEY;
                if !keep {
                    tracing::debug!(key = %key, "ignoring unknown reserved key");
                }
                keep
            });
        }
        serde_json::from_value(value).map_err(|err| Error::CorruptDocument(err.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Nest a state's flat task tables.
    pub fn from_state(state: &StoreState) -> Self {
        let tags = state
            .tags()
            .map(|(name, tag)| {
                let metadata = tag.metadata();
                let record = TagRecord {
                    tasks: nest(&tag.tasks),
                    metadata: TagMetadataRecord {
                        kind: Some(tag.kind),
                        parent_tag: tag.parent_tag.clone(),
                        git_branch: tag.git_branch.clone(),
                        description: tag.description.clone(),
                        created: tag.created,
                        updated: tag.updated,
                        task_count: metadata.task_count,
                        completed_count: metadata.completed_count,
                        in_progress_count: metadata.in_progress_count,
                        blocked_count: metadata.blocked_count,
                    },
                };
                (name.to_string(), record)
            })
            .collect();
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            current_tag: state.current_tag().clone(),
            tags,
        }
    }

    /// Validate and flatten into a store state.
    ///
    /// Rejects bad tag names, misplaced or duplicate ids, limit violations
    /// and dependency cycles. Unresolved references are kept; validation
    /// reports them.
    pub fn into_state(self, config: &Config) -> Result<StoreState> {
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(Error::SchemaVersion {
                found: self.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        let mut tags = Vec::with_capacity(self.tags.len());
        for (raw_name, record) in self.tags {
            let name = TagName::parse(&raw_name)?;
            let mut tasks = BTreeMap::new();
            for task in record.tasks {
                task.flatten_into(&name, None, &mut tasks)?;
            }
            let metadata = record.metadata;
            tags.push(Tag {
                kind: metadata.kind.unwrap_or_else(|| TagKind::infer(&name)),
                name,
                parent_tag: metadata.parent_tag,
                git_branch: metadata.git_branch,
                description: metadata.description,
                created: metadata.created,
                updated: metadata.updated,
                tasks,
            });
        }

        let state = StoreState::from_tags(tags, self.current_tag)?;
        state.check_limits(&config.limits)?;
        for (_, tag) in state.tags() {
            graph::check_acyclic(tag)?;
        }
        Ok(state)
    }
}

fn nest(tasks: &BTreeMap<TaskId, Task>) -> Vec<TaskRecord> {
    let parents: Vec<Option<TaskId>> = tasks.keys().map(TaskId::parent).collect();
    let mut children: HashMap<Option<&TaskId>, Vec<&Task>> = HashMap::new();
    for (task, parent) in tasks.values().zip(&parents) {
        children.entry(parent.as_ref()).or_default().push(task);
    }

    fn build<'a>(
        parent: Option<&'a TaskId>,
        children: &HashMap<Option<&'a TaskId>, Vec<&'a Task>>,
    ) -> Vec<TaskRecord> {
        children
            .get(&parent)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|&task| TaskRecord::from_task(task, build(Some(&task.id), children)))
                    .collect()
            })
            .unwrap_or_default()
    }

    build(None, &children)
}

/// Schema version of a raw document.
pub fn detect_version(value: &Value) -> Result<u64> {
    let Value::Object(map) = value else {
        return Err(Error::CorruptDocument(
            "document must be a JSON object".to_string(),
        ));
    };
    if let Some(version) = map.get(SCHEMA_VERSION_KEY) {
        return version.as_u64().ok_or_else(|| {
            Error::CorruptDocument(format!("{SCHEMA_VERSION_KEY} must be a non-negative integer"))
        });
    }
    if map.get("tasks").is_some_and(Value::is_array) {
        return Ok(1);
    }
    Ok(2)
}

/// Upgrade a raw document to [`CURRENT_SCHEMA_VERSION`].
pub fn migrate(value: Value) -> Result<Value> {
    let found = detect_version(&value)?;
    if found > CURRENT_SCHEMA_VERSION || found == 0 {
        return Err(Error::SchemaVersion {
            found,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    let mut value = value;
    let mut version = found;
    while version < CURRENT_SCHEMA_VERSION {
        value = match version {
            1 => migrate_v1_to_v2(value)?,
            2 => migrate_v2_to_v3(value)?,
            _ => {
                return Err(Error::SchemaVersion {
                    found,
                    supported: CURRENT_SCHEMA_VERSION,
                })
            }
        };
        version += 1;
    }
    if found < CURRENT_SCHEMA_VERSION {
        tracing::warn!(from = found, to = CURRENT_SCHEMA_VERSION, "migrated task document");
    }
    Ok(value)
}

/// Wrap the legacy untagged list into tag `master`.
pub fn migrate_v1_to_v2(value: Value) -> Result<Value> {
    let Value::Object(mut map) = value else {
        return Err(Error::CorruptDocument(
            "document must be a JSON object".to_string(),
        ));
    };
    let tasks = map.remove("tasks").unwrap_or_else(|| Value::Array(Vec::new()));
    let mut master = Map::new();
    master.insert("tasks".to_string(), tasks);
    master.insert("metadata".to_string(), Value::Object(Map::new()));

    let mut out = Map::new();
    out.insert(crate::id::MASTER_TAG.to_string(), Value::Object(master));
    Ok(Value::Object(out))
}

/// Full hierarchical ids, string dependencies, canonical statuses, and the
/// reserved version/active-tag keys.
pub fn migrate_v2_to_v3(value: Value) -> Result<Value> {
    let Value::Object(map) = value else {
        return Err(Error::CorruptDocument(
            "document must be a JSON object".to_string(),
        ));
    };

    let mut out = Map::new();
    let mut current_tag = None;
    for (key, tag) in map {
        if key == CURRENT_TAG_KEY {
            current_tag = Some(tag);
            continue;
        }
        if key.starts_with(RESERVED_PREFIX) {
            continue;
        }
        let Value::Object(mut tag) = tag else {
            return Err(Error::CorruptDocument(format!(
                "tag '{key}' must be an object"
            )));
        };
        if let Some(Value::Array(tasks)) = tag.get_mut("tasks") {
            for task in tasks.iter_mut() {
                upgrade_task(task, None)?;
            }
        }
        out.insert(key, Value::Object(tag));
    }

    out.insert(
        SCHEMA_VERSION_KEY.to_string(),
        Value::from(CURRENT_SCHEMA_VERSION),
    );
    out.insert(
        CURRENT_TAG_KEY.to_string(),
        current_tag.unwrap_or_else(|| Value::from(crate::id::MASTER_TAG)),
    );
    Ok(Value::Object(out))
}

fn legacy_id(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        Value::String(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Rewrite one legacy task (and its subtasks) in place.
///
/// Subtask ids are relative to the parent. Numeric subtask dependencies name
/// siblings; string ones are full ids.
fn upgrade_task(task: &mut Value, parent: Option<&str>) -> Result<()> {
    let Value::Object(map) = task else {
        return Err(Error::CorruptDocument("task must be an object".to_string()));
    };

    let raw_id = map
        .get("id")
        .and_then(legacy_id)
        .ok_or_else(|| Error::CorruptDocument("task without a usable id".to_string()))?;
    let full_id = match parent {
        Some(parent) if !raw_id.contains('.') => format!("{parent}.{raw_id}"),
        _ => raw_id,
    };
    map.insert("id".to_string(), Value::from(full_id.clone()));

    if let Some(Value::Array(deps)) = map.get_mut("dependencies") {
        for dep in deps.iter_mut() {
            let rewritten = match (&*dep, parent) {
                (Value::Number(_), Some(parent)) => legacy_id(dep).map(|n| format!("{parent}.{n}")),
                _ => legacy_id(dep),
            };
            let rewritten = rewritten.ok_or_else(|| {
                Error::CorruptDocument(format!("task {full_id} has an unusable dependency"))
            })?;
            *dep = Value::from(rewritten);
        }
    }

    if let Some(Value::String(status)) = map.get_mut("status") {
        let canonical = match status.trim().to_ascii_lowercase().as_str() {
            "completed" | "complete" => Some("done"),
            "in_progress" | "in progress" | "review" => Some("in-progress"),
            "todo" | "open" => Some("pending"),
            "canceled" => Some("cancelled"),
            _ => None,
        };
        if let Some(canonical) = canonical {
            *status = canonical.to_string();
        }
    }
    if !map.contains_key("status") {
        map.insert("status".to_string(), Value::from("pending"));
    }
    if matches!(map.get("priority"), Some(Value::Null)) {
        map.remove("priority");
    }

    if let Some(Value::Array(subtasks)) = map.get_mut("subtasks") {
        for subtask in subtasks.iter_mut() {
            upgrade_task(subtask, Some(&full_id))?;
        }
    }
    Ok(())
}
