//! taskdb init command implementation
//!
//! Creates `.taskdb/`, a default `.taskdb.toml`, and an empty task document.

use std::path::{Path, PathBuf};

use crate::cli::GlobalOptions;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::storage::{self, Storage};
use crate::store::Store;

#[derive(serde::Serialize)]
struct InitReport {
    dir: PathBuf,
    created: InitCreated,
    updated: InitUpdated,
}

#[derive(serde::Serialize)]
struct InitCreated {
    config: bool,
    data_dir: bool,
    document: bool,
}

#[derive(serde::Serialize)]
struct InitUpdated {
    gitignore: bool,
}

pub fn run(global: &GlobalOptions) -> Result<()> {
    let dir = global.project_dir()?;
    let storage = Storage::new(dir.clone());

    let created_config = ensure_config(&storage.config_file())?;
    let created_data_dir = storage.init()?;
    let created_document = if storage.tasks_file().exists() {
        false
    } else {
        let store = Store::open(storage.clone(), Config::load_from_dir(&dir)?)?;
        store.flush()?;
        true
    };
    let updated_gitignore = ensure_gitignore(&dir)?;

    let report = InitReport {
        dir: dir.clone(),
        created: InitCreated {
            config: created_config,
            data_dir: created_data_dir,
            document: created_document,
        },
        updated: InitUpdated {
            gitignore: updated_gitignore,
        },
    };

    let mut created_items = Vec::new();
    if created_config {
        created_items.push(".taskdb.toml");
    }
    if created_data_dir {
        created_items.push(".taskdb/");
    }
    if created_document {
        created_items.push(".taskdb/tasks.json");
    }

    let header = if created_items.is_empty() && !updated_gitignore {
        "taskdb init: nothing to do"
    } else {
        "taskdb init: initialized project"
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("dir", dir.display().to_string());
    human.push_summary(
        "created",
        if created_items.is_empty() {
            "none".to_string()
        } else {
            created_items.join(", ")
        },
    );
    if updated_gitignore {
        human.push_summary("updated", ".gitignore");
    }
    human.push_next_step("taskdb add \"<title>\"");

    emit_success(global.output(), "init", &report, Some(&human))
}

fn ensure_config(path: &Path) -> Result<bool> {
    if path.exists() {
        if !path.is_file() {
            return Err(Error::OperationFailed(format!(
                "config path exists but is not a file: {}",
                path.display()
            )));
        }
        return Ok(false);
    }

    Config::default().save(path)?;
    Ok(true)
}

fn ensure_gitignore(dir: &Path) -> Result<bool> {
    let path = dir.join(".gitignore");
    if path.exists() && !path.is_file() {
        return Err(Error::OperationFailed(format!(
            ".gitignore exists but is not a file: {}",
            path.display()
        )));
    }
    let before = std::fs::read_to_string(&path).unwrap_or_default();
    storage::ensure_gitignore(dir)?;
    let after = std::fs::read_to_string(&path)?;
    Ok(before != after)
}
