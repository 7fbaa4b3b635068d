//! Per-project configuration — `<project>/.claw_town/config.json`.
//!
//! A loose JSON config object: every field is optional with a sensible
//! default, so a hand-edited or partially written config file never
//! fails to load.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::Result;
use crate::paths;

/// Per-project operational config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Skip interactive permission prompts when spawning agents.
    #[serde(default)]
    pub skip_permissions: bool,
    /// Run agents in unattended "yolo" mode (no confirmation gates).
    #[serde(default)]
    pub yolo_mode: bool,
    /// Allow multiple agents to run concurrently rather than one at a time.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Seconds of pane inactivity before the Supervisor Loop nudges an
    /// agent.
    #[serde(default = "default_nudge_interval")]
    pub nudge_interval_seconds: u64,
}

fn default_parallel() -> bool {
    true
}

fn default_nudge_interval() -> u64 {
    900
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            skip_permissions: false,
            yolo_mode: false,
            parallel: default_parallel(),
            nudge_interval_seconds: default_nudge_interval(),
        }
    }
}

impl ProjectConfig {
    /// Load `<project>/.claw_town/config.json`, falling back to defaults
    /// if the file is absent or malformed.
    pub fn load(state_dir: &Path) -> Self {
        let path = paths::project_config_file(state_dir);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Persist the config, creating `.claw_town/` if needed.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        paths::ensure_dir(state_dir)?;
        let path = paths::project_config_file(state_dir);
        crate::locking::atomic_write_json(&path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = ProjectConfig::load(dir.path());
        assert!(!cfg.skip_permissions);
        assert_eq!(cfg.nudge_interval_seconds, 900);
    }

    #[test]
    fn malformed_config_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(paths::project_config_file(dir.path()), "{not json").unwrap();
        let cfg = ProjectConfig::load(dir.path());
        assert!(cfg.parallel);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut cfg = ProjectConfig::default();
        cfg.skip_permissions = true;
        cfg.nudge_interval_seconds = 60;
        cfg.save(dir.path()).unwrap();
        let loaded = ProjectConfig::load(dir.path());
        assert!(loaded.skip_permissions);
        assert_eq!(loaded.nudge_interval_seconds, 60);
    }
}
