//! Configuration loading and management
//!
//! Handles parsing of `.taskdb.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::task::{BlockingPolicy, Priority};

/// File name of the project configuration
pub const CONFIG_FILE: &str = ".taskdb.toml";

/// Hard ceiling for `limits.max_depth`
pub const MAX_DEPTH_CEILING: usize = 32;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Capacity limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Task defaults
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Dependency semantics
    #[serde(default)]
    pub dependencies: DependenciesConfig,

    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Capacity limits enforced on every mutation and on load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Counts subtasks too
    #[serde(default = "default_max_tasks_per_tag")]
    pub max_tasks_per_tag: usize,

    /// Maximum number of id segments (`1.2.3` has depth 3)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_tags() -> usize {
    64
}

fn default_max_tasks_per_tag() -> usize {
    2000
}

fn default_max_depth() -> usize {
    10
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tags: default_max_tags(),
            max_tasks_per_tag: default_max_tasks_per_tag(),
            max_depth: default_max_depth(),
        }
    }
}

/// Tasks configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Priority for tasks created without one
    #[serde(default)]
    pub default_priority: Priority,
}

/// Dependency configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependenciesConfig {
    /// Whether unmet cross-tag hard dependencies put a task in `blocked`
    #[serde(default)]
    pub cross_tag_blocks: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Backups kept under `.taskdb/backups/`; older ones are pruned
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_lock_timeout_ms() -> u64 {
    crate::lock::DEFAULT_LOCK_TIMEOUT_MS
}

fn default_max_backups() -> usize {
    20
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            max_backups: default_max_backups(),
        }
    }
}

impl Config {
    /// Load configuration from a `.taskdb.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a project directory, or return defaults when
    /// no config file exists. An invalid file is an error.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn blocking_policy(&self) -> BlockingPolicy {
        BlockingPolicy {
            cross_tag_blocks: self.dependencies.cross_tag_blocks,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.validate()
    }
}

impl LimitsConfig {
    fn validate(&self) -> Result<()> {
        if self.max_tags == 0 {
            return Err(Error::InvalidConfig(
                "limits.max_tags must be > 0".to_string(),
            ));
        }
        if self.max_tasks_per_tag == 0 {
            return Err(Error::InvalidConfig(
                "limits.max_tasks_per_tag must be > 0".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(Error::InvalidConfig(
                "limits.max_depth must be > 0".to_string(),
            ));
        }
        if self.max_depth > MAX_DEPTH_CEILING {
            return Err(Error::InvalidConfig(format!(
                "limits.max_depth must be <= {MAX_DEPTH_CEILING}"
            )));
        }
        Ok(())
    }
}
