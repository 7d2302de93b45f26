//! On-disk layout of a task database
//!
//! ```text
//! <root>/
//!   .taskdb.toml                 # Optional configuration
//!   .taskdb/
//!     tasks.json                 # The versioned task document
//!     tasks.json.lock            # Advisory lock guarding tasks.json
//!     backups/
//!       tasks-<timestamp>-<ulid>.json
//! ```
//!
//! Every read and write of `tasks.json` holds the lock. Writes go through a
//! verified temp file so readers never observe a partial document.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use ulid::Ulid;

use crate::config::CONFIG_FILE;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::lock::{self, FileLock};

/// Name of the data directory under the project root
pub const DATA_DIR: &str = ".taskdb";

const TASKS_FILE: &str = "tasks.json";
const BACKUPS_DIR: &str = "backups";
const BACKUP_PREFIX: &str = "tasks-";

/// Paths and locked I/O for one project directory
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the `.taskdb/` directory
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.data_dir().join(TASKS_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        lock::lock_path_for(&self.tasks_file())
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir().join(BACKUPS_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Create the data directories. Returns false if they already existed.
    pub fn init(&self) -> Result<bool> {
        let fresh = !self.is_initialized();
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.backups_dir())?;
        Ok(fresh)
    }

    pub fn is_initialized(&self) -> bool {
        self.data_dir().is_dir()
    }

    // =========================================================================
    // Document I/O (locked)
    // =========================================================================

    /// Read and migrate the task document, or `None` if none was written yet.
    pub fn read_document(&self, timeout_ms: u64) -> Result<Option<Document>> {
        let path = self.tasks_file();
        let _lock = FileLock::acquire(self.lock_file(), timeout_ms)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Io(err)),
        };
        Document::from_json(&content).map(Some)
    }

    /// Atomically replace the task document.
    ///
    /// The written bytes are parsed back and handed to `verify` before the
    /// rename; a rejection leaves the previous document in place.
    pub fn write_document<F>(&self, document: &Document, timeout_ms: u64, verify: F) -> Result<PathBuf>
    where
        F: FnOnce(Document) -> Result<()>,
    {
        let path = self.tasks_file();
        let json = document.to_json_pretty()?;
        let _lock = FileLock::acquire(self.lock_file(), timeout_ms)?;
        lock::write_atomic_verified(&path, json.as_bytes(), |bytes| {
            let text = std::str::from_utf8(bytes)
                .map_err(|err| Error::CorruptDocument(format!("written document: {err}")))?;
            verify(Document::from_json(text)?)
        })?;
        Ok(path)
    }

    // =========================================================================
    // Backups
    // =========================================================================

    /// Copy the current document into `backups/`, pruning the oldest copies
    /// beyond `max_backups`. Returns `None` when there is nothing to back up
    /// or backups are disabled.
    pub fn backup_document(&self, max_backups: usize, timeout_ms: u64) -> Result<Option<PathBuf>> {
        if max_backups == 0 {
            return Ok(None);
        }
        let _lock = FileLock::acquire(self.lock_file(), timeout_ms)?;
        let content = match fs::read(self.tasks_file()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Io(err)),
        };

        let name = format!(
            "{BACKUP_PREFIX}{}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            Ulid::new().to_string().to_ascii_lowercase()
        );
        let path = self.backups_dir().join(name);
        lock::write_atomic(&path, &content)?;

        // Backups from the same millisecond sort by their random ulid suffix,
        // so the copy just written is never a pruning candidate.
        let older: Vec<PathBuf> = self
            .list_backups()?
            .into_iter()
            .filter(|existing| existing != &path)
            .collect();
        let keep = max_backups - 1;
        if older.len() > keep {
            for stale in &older[..older.len() - keep] {
                fs::remove_file(stale)?;
                tracing::debug!(path = %stale.display(), "pruned backup");
            }
        }
        Ok(Some(path))
    }

    /// Backup files, oldest first
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let dir = self.backups_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::Io(err)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_backup = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(".json"));
            if is_backup {
                backups.push(path);
            }
        }
        // Names start with a fixed-width UTC timestamp.
        backups.sort();
        Ok(backups)
    }
}

/// Ignore the lock file and backups in `<root>/.gitignore`.
pub fn ensure_gitignore(root: &Path) -> io::Result<()> {
    let gitignore_path = root.join(".gitignore");
    let patterns = [
        format!("/{DATA_DIR}/{TASKS_FILE}.lock"),
        format!("/{DATA_DIR}/{BACKUPS_DIR}/"),
    ];

    let existing = if gitignore_path.exists() {
        fs::read_to_string(&gitignore_path)?
    } else {
        String::new()
    };

    let missing: Vec<&String> = patterns
        .iter()
        .filter(|pattern| !existing.lines().any(|line| line.trim() == pattern.as_str()))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&gitignore_path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# taskdb local state")?;
    for pattern in missing {
        writeln!(file, "{pattern}")?;
    }
    Ok(())
}
