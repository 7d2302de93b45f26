//! Identifier grammar for tasks, tags and dependency references.
//!
//! - Task ids are dot-separated positive integers without leading zeros
//!   (`1`, `1.2`, `1.2.10`). A subtask id is its parent id plus one segment.
//! - Tag names match `^[a-z0-9-]+$`.
//! - Dependency references are `<id>`, `<tag>:<id>` (explicit cross-tag), each
//!   optionally prefixed with `~` for a soft (non-blocking) dependency.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted tag name
pub const MAX_TAG_NAME_LEN: usize = 64;

/// Name of the tag every new store starts with
pub const MASTER_TAG: &str = "master";

const SEGMENT_SEPARATOR: char = '.';
const CROSS_TAG_SEPARATOR: char = ':';
const SOFT_MARKER: char = '~';

/// Hierarchical task id.
///
/// Ordering compares numeric segments left to right with a prefix sorting
/// first, which yields depth-first order: `1 < 1.2 < 1.10 < 2`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    segments: Vec<u32>,
}

impl TaskId {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidId {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("id cannot be empty"));
        }

        let mut segments = Vec::new();
        for segment in input.split(SEGMENT_SEPARATOR) {
            if segment.is_empty() {
                return Err(invalid("empty segment"));
            }
            if !segment.chars().all(|ch| ch.is_ascii_digit()) {
                return Err(invalid("segments must be positive integers"));
            }
            if segment.len() > 1 && segment.starts_with('0') {
                return Err(invalid("segments cannot have leading zeros"));
            }
            let value: u32 = segment
                .parse()
                .map_err(|_| invalid("segment is out of range"))?;
            if value == 0 {
                return Err(invalid("segments start at 1"));
            }
            segments.push(value);
        }

        Ok(Self { segments })
    }

    /// Top-level task id `n`
    pub fn top(n: u32) -> Self {
        Self {
            segments: vec![n.max(1)],
        }
    }

    pub fn segments(&self) -> &[u32] {
        &self.segments
    }

    /// Number of segments; top-level tasks have depth 1
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_top_level(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn last_segment(&self) -> u32 {
        self.segments.last().copied().unwrap_or(1)
    }

    pub fn parent(&self) -> Option<TaskId> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, n: u32) -> TaskId {
        let mut segments = self.segments.clone();
        segments.push(n.max(1));
        Self { segments }
    }

    /// True iff `self` is `parent` with exactly one more trailing segment
    pub fn is_child_of(&self, parent: &TaskId) -> bool {
        self.segments.len() == parent.segments.len() + 1
            && self.segments.starts_with(&parent.segments)
    }

    /// True iff `self` lies strictly below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &TaskId) -> bool {
        self.segments.len() > ancestor.segments.len()
            && self.segments.starts_with(&ancestor.segments)
    }
}

/// `childOf(parentId, childId)` over raw strings.
pub fn child_of(parent: &str, child: &str) -> Result<bool> {
    let parent = TaskId::parse(parent)?;
    let child = TaskId::parse(child)?;
    Ok(child.is_child_of(&parent))
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                write!(f, "{SEGMENT_SEPARATOR}")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskId::parse(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        TaskId::parse(&value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}

/// Validated tag name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagName(String);

impl TagName {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidTagName {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("tag name cannot be empty"));
        }
        if input.len() > MAX_TAG_NAME_LEN {
            return Err(invalid("tag name is too long"));
        }
        if !input
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
        {
            return Err(invalid("only lowercase letters, digits and '-' are allowed"));
        }

        Ok(Self(input.to_string()))
    }

    pub fn master() -> Self {
        Self(MASTER_TAG.to_string())
    }

    /// Derive a tag name from free text such as a git branch name.
    ///
    /// Lowercases, maps every other character to `-`, collapses runs of `-`
    /// and trims them from both ends.
    pub fn sanitize(raw: &str) -> Result<Self> {
        let mut name = String::with_capacity(raw.len());
        for ch in raw.trim().chars() {
            let ch = ch.to_ascii_lowercase();
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
                name.push(ch);
            } else if !name.ends_with('-') {
                name.push('-');
            }
        }
        let trimmed: String = name
            .trim_matches('-')
            .chars()
            .take(MAX_TAG_NAME_LEN)
            .collect();
        TagName::parse(trimmed.trim_end_matches('-')).map_err(|_| Error::InvalidTagName {
            input: raw.to_string(),
            reason: "no usable characters for a tag name".to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TagName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TagName::parse(s)
    }
}

impl TryFrom<String> for TagName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        TagName::parse(&value)
    }
}

impl From<TagName> for String {
    fn from(name: TagName) -> Self {
        name.0
    }
}

/// Whether a dependency gates the dependent's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Must be `done` before the dependent may leave `blocked`
    Hard,
    /// Ordering hint only
    Soft,
}

/// One entry of a task's dependency list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dependency {
    /// Explicit target tag; `None` means the dependent's own tag
    pub tag: Option<TagName>,
    pub id: TaskId,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn parse(input: &str) -> Result<Self> {
        let (kind, rest) = match input.strip_prefix(SOFT_MARKER) {
            Some(rest) => (DependencyKind::Soft, rest),
            None => (DependencyKind::Hard, input),
        };
        let (tag, id) = match rest.split_once(CROSS_TAG_SEPARATOR) {
            Some((tag, id)) => (Some(TagName::parse(tag)?), TaskId::parse(id)?),
            None => (None, TaskId::parse(rest)?),
        };
        Ok(Self { tag, id, kind })
    }

    pub fn hard(id: TaskId) -> Self {
        Self {
            tag: None,
            id,
            kind: DependencyKind::Hard,
        }
    }

    pub fn soft(id: TaskId) -> Self {
        Self {
            tag: None,
            id,
            kind: DependencyKind::Soft,
        }
    }

    pub fn cross_tag(tag: TagName, id: TaskId) -> Self {
        Self {
            tag: Some(tag),
            id,
            kind: DependencyKind::Hard,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.kind == DependencyKind::Hard
    }

    pub fn is_cross_tag(&self) -> bool {
        self.tag.is_some()
    }

    /// Tag the target lives in, given the dependent's tag
    pub fn target_tag<'a>(&'a self, own: &'a TagName) -> &'a TagName {
        self.tag.as_ref().unwrap_or(own)
    }

    /// Same target regardless of kind
    pub fn same_target(&self, other: &Dependency) -> bool {
        self.tag == other.tag && self.id == other.id
    }

    /// Drop an explicit tag that names the dependent's own tag.
    pub fn localized(self, own: &TagName) -> Self {
        match &self.tag {
            Some(tag) if tag == own => Self { tag: None, ..self },
            _ => self,
        }
    }
}

/// Localize `own:id` references, then collapse duplicates.
pub fn normalize_dependencies(own: &TagName, deps: Vec<Dependency>) -> Vec<Dependency> {
    dedup_dependencies(deps.into_iter().map(|dep| dep.localized(own)).collect())
}

/// Collapse duplicate targets keeping the first occurrence.
pub fn dedup_dependencies(deps: Vec<Dependency>) -> Vec<Dependency> {
    let mut out: Vec<Dependency> = Vec::with_capacity(deps.len());
    for dep in deps {
        if !out.iter().any(|existing| existing.same_target(&dep)) {
            out.push(dep);
        }
    }
    out
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == DependencyKind::Soft {
            write!(f, "{SOFT_MARKER}")?;
        }
        if let Some(tag) = &self.tag {
            write!(f, "{tag}{CROSS_TAG_SEPARATOR}")?;
        }
        write!(f, "{}", self.id)
    }
}

impl FromStr for Dependency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Dependency::parse(s)
    }
}

impl TryFrom<String> for Dependency {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Dependency::parse(&value)
    }
}

impl From<Dependency> for String {
    fn from(dep: Dependency) -> Self {
        dep.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).expect("valid id")
    }

    #[test]
    fn parses_hierarchical_ids() {
        assert_eq!(id("1").segments(), &[1]);
        assert_eq!(id("1.2.10").segments(), &[1, 2, 10]);
        assert_eq!(id("1.2.10").to_string(), "1.2.10");
        assert_eq!(id("3.4").depth(), 2);
    }

    #[test]
    fn rejects_malformed_ids() {
        for raw in ["", "0", "01", "1.", ".1", "1..2", "a", "1.x", "-1", "1.0", "99999999999"] {
            let err = TaskId::parse(raw).expect_err(raw);
            assert!(matches!(err, Error::InvalidId { .. }), "{raw}: {err:?}");
        }
    }

    #[test]
    fn ids_sort_numerically_per_segment() {
        let mut ids = vec![id("2"), id("1.10"), id("1"), id("1.2")];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(rendered, vec!["1", "1.2", "1.10", "2"]);
    }

    #[test]
    fn child_of_requires_exactly_one_extra_segment() {
        assert!(child_of("1", "1.1").unwrap());
        assert!(child_of("1.2", "1.2.3").unwrap());
        assert!(!child_of("1", "1.1.1").unwrap());
        assert!(!child_of("1", "2.1").unwrap());
        assert!(!child_of("1.1", "1").unwrap());
        assert!(child_of("x", "1.1").is_err());
    }

    #[test]
    fn parent_and_descendants() {
        assert_eq!(id("1.2.3").parent(), Some(id("1.2")));
        assert_eq!(id("1").parent(), None);
        assert_eq!(id("4").child(2), id("4.2"));
        assert!(id("1.2.3").is_descendant_of(&id("1")));
        assert!(!id("1").is_descendant_of(&id("1")));
        assert!(!id("10.1").is_descendant_of(&id("1")));
    }

    #[test]
    fn tag_names_follow_grammar() {
        assert!(TagName::parse("feature-x").is_ok());
        assert!(TagName::parse("v2").is_ok());
        for raw in ["", "Feature", "feat_x", "feat x", "_meta", "a/b"] {
            let err = TagName::parse(raw).expect_err(raw);
            assert!(matches!(err, Error::InvalidTagName { .. }));
        }
        assert!(TagName::parse(&"a".repeat(MAX_TAG_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn sanitize_turns_branch_names_into_tags() {
        assert_eq!(
            TagName::sanitize("feature/User_Auth").unwrap().as_str(),
            "feature-user-auth"
        );
        assert_eq!(TagName::sanitize("--Fix--123--").unwrap().as_str(), "fix-123");
        assert!(TagName::sanitize("///").is_err());
    }

    #[test]
    fn dependency_grammar() {
        let local = Dependency::parse("2").unwrap();
        assert_eq!(local, Dependency::hard(id("2")));

        let soft = Dependency::parse("~1.3").unwrap();
        assert_eq!(soft.kind, DependencyKind::Soft);
        assert!(!soft.is_cross_tag());

        let cross = Dependency::parse("feature-x:4").unwrap();
        assert_eq!(cross.tag.as_ref().map(|t| t.as_str()), Some("feature-x"));
        assert!(cross.is_hard());

        for raw in ["~feature-x:4.1", "2", "~3", "master:1"] {
            assert_eq!(Dependency::parse(raw).unwrap().to_string(), raw);
        }

        assert!(Dependency::parse("Bad:1").is_err());
        assert!(Dependency::parse("x:").is_err());
        assert!(Dependency::parse("~").is_err());
    }

    #[test]
    fn dedup_keeps_first_target() {
        let deps = vec![
            Dependency::parse("2").unwrap(),
            Dependency::parse("~2").unwrap(),
            Dependency::parse("other:2").unwrap(),
            Dependency::parse("2").unwrap(),
        ];
        let deduped = dedup_dependencies(deps);
        let rendered: Vec<String> = deduped.iter().map(|d| d.to_string()).collect();
        assert_eq!(rendered, vec!["2", "other:2"]);
    }

    #[test]
    fn own_tag_references_become_local() {
        let master = TagName::master();
        let deps = vec![
            Dependency::parse("master:2").unwrap(),
            Dependency::parse("2").unwrap(),
            Dependency::parse("~master:3").unwrap(),
            Dependency::parse("other:2").unwrap(),
        ];
        let rendered: Vec<String> = normalize_dependencies(&master, deps)
            .iter()
            .map(|d| d.to_string())
            .collect();
        assert_eq!(rendered, vec!["2", "~3", "other:2"]);
    }

    #[test]
    fn serde_uses_string_forms() {
        let json = serde_json::to_string(&id("1.2")).unwrap();
        assert_eq!(json, "\"1.2\"");
        let dep: Dependency = serde_json::from_str("\"~master:3\"").unwrap();
        assert_eq!(dep.to_string(), "~master:3");
        assert!(serde_json::from_str::<TaskId>("\"1.0\"").is_err());
    }
}
