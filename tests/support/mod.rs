#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use git2::Repository;
use serde_json::Value;
use taskdb::config::Config;
use taskdb::storage::Storage;
use taskdb::store::Store;
use tempfile::TempDir;

pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        Self { dir }
    }

    /// A project that is also a git repository checked out on `branch`
    pub fn with_git_branch(branch: &str) -> Result<Self, git2::Error> {
        let project = Self::new();
        let repo = Repository::init(project.path())?;
        repo.set_head(&format!("refs/heads/{branch}"))?;
        Ok(project)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn storage(&self) -> Storage {
        Storage::new(self.path().to_path_buf())
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.storage().tasks_file()
    }

    pub fn write_config(&self, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.path().join(".taskdb.toml");
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Write a raw task document, bypassing the store.
    pub fn write_document(&self, document: &Value) -> std::io::Result<()> {
        let path = self.tasks_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(document)?)
    }

    pub fn read_document(&self) -> Result<Value, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(self.tasks_file())?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn open_store(&self) -> taskdb::Result<Store> {
        Store::open_dir(self.path())
    }

    pub fn open_store_with(&self, config: Config) -> taskdb::Result<Store> {
        Store::open(self.storage(), config)
    }

    pub fn taskdb(&self) -> Command {
        let mut cmd = Command::cargo_bin("taskdb").expect("binary");
        cmd.current_dir(self.path());
        cmd.env_remove("TASKDB_DIR");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Run a command with `--json` and return the parsed envelope.
    pub fn json(&self, args: &[&str]) -> Value {
        let output = self
            .taskdb()
            .args(args)
            .arg("--json")
            .output()
            .expect("run taskdb");
        serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
            panic!(
                "taskdb {args:?} printed invalid JSON ({err}): {}",
                String::from_utf8_lossy(&output.stdout)
            )
        })
    }
}
