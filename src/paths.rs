//! Filesystem layout resolution
//!
//! Resolves the two per-project directory trees (`.tasks/` for the Task
//! Store, `.claw_town/` for everything else) and the global
//! `~/.claw-town/config.json` project-base map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Env var overriding the project directory
pub const ENV_PROJECT_DIR: &str = "CLAW_TOWN_PROJECT_DIR";
/// Env var overriding the task store directory
pub const ENV_TASKS_DIR: &str = "CLAW_TOWN_TASKS_DIR";

/// `~/.claw-town/config.json` — maps project name to its base directory
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub project_bases: HashMap<String, PathBuf>,
}

impl GlobalConfig {
    /// Path to the global config file
    pub fn path() -> PathBuf {
        directories::BaseDirs::new().map_or_else(
            || PathBuf::from("/tmp/.claw-town/config.json"),
            |dirs| dirs.home_dir().join(".claw-town").join("config.json"),
        )
    }

    /// Load the global config, returning defaults if it doesn't exist or is malformed.
    ///
    /// Malformed JSON on a state file is treated as empty, not fatal.
    pub fn load() -> Self {
        let path = Self::path();
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Resolve the base directory for a named project, falling back to `default`
    /// and then to the current working directory.
    pub fn base_dir(&self, project: &str) -> PathBuf {
        self.project_bases
            .get(project)
            .or_else(|| self.project_bases.get("default"))
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Resolve the project directory: `CLAW_TOWN_PROJECT_DIR` env var, else cwd.
pub fn project_dir() -> PathBuf {
    std::env::var(ENV_PROJECT_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// `.claw_town/` state directory for a project (tasks.json, events.jsonl, etc.)
pub fn state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".claw_town")
}

/// `.tasks/` task store directory: `CLAW_TOWN_TASKS_DIR` env var, else `<project>/.tasks`.
pub fn tasks_dir(project_dir: &Path) -> PathBuf {
    std::env::var(ENV_TASKS_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| project_dir.join(".tasks"))
}

/// Ensure a directory (and its parents) exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

pub fn events_file(state_dir: &Path) -> PathBuf {
    state_dir.join("events.jsonl")
}

pub fn learning_processed_file(state_dir: &Path) -> PathBuf {
    state_dir.join("learning_processed.json")
}

pub fn activity_log_file(state_dir: &Path) -> PathBuf {
    state_dir.join("activity_log.md")
}

pub fn project_config_file(state_dir: &Path) -> PathBuf {
    state_dir.join("config.json")
}

pub fn agents_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("agents")
}

pub fn locks_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("locks")
}

pub fn outbox_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("outbox")
}

pub fn inbox_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("inbox")
}

pub fn tasks_json_file(state_dir: &Path) -> PathBuf {
    state_dir.join("tasks.json")
}

pub fn tasks_json_lock_file(state_dir: &Path) -> PathBuf {
    state_dir.join(".tasks.json.lock")
}

pub fn sync_cache_file(state_dir: &Path) -> PathBuf {
    state_dir.join(".sync_cache.json")
}

pub fn counter_file(tasks_dir: &Path) -> PathBuf {
    tasks_dir.join("counter.json")
}

pub fn counter_lock_file(tasks_dir: &Path) -> PathBuf {
    tasks_dir.join(".counter.lock")
}

pub fn task_file(tasks_dir: &Path, t_number: &str) -> PathBuf {
    tasks_dir.join(format!("{t_number}.json"))
}

pub fn task_lock_file(tasks_dir: &Path, t_number: &str) -> PathBuf {
    tasks_dir.join(format!(".{t_number}.lock"))
}
