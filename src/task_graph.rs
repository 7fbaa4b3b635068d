//! Task Graph — `tasks.json`, the cross-project cached view of the backlog
//! plus orchestrator bookkeeping.
//!
//! One JSON document per project, keyed by T-number, with a one-way
//! schema migration applied on every load and an RAII `locked_update`
//! guard that only persists changes when the caller's closure succeeds.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::locking::{atomic_write_json, with_exclusive_lock};
use crate::paths;

/// Operational status of a known task within the graph.
pub const VALID_STATES: &[&str] = &[
    "orchestrator",
    "working",
    "idle",
    "stuck",
    "pending",
    "completed",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownTask {
    /// Cached fields: kept in sync by the Sync Engine from the local task file.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    /// Operational fields: owned by the supervisor/registry, not the sync engine.
    #[serde(default = "default_pending")]
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent_window: Option<String>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_pending() -> String {
    "pending".to_string()
}
fn default_created_by() -> String {
    "claw-town".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskGraph {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub root_task: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub gsd_url: Option<String>,
    #[serde(default)]
    pub gsd_project_id: Option<String>,
    #[serde(default)]
    pub last_dag_walk: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_gsd_poll: Option<DateTime<Utc>>,
    #[serde(default)]
    pub known_tasks: HashMap<String, KnownTask>,
}

/// Migrate a single known_tasks entry in place: field renames and defaults.
fn migrate_entry(raw: &mut Value) {
    let Value::Object(map) = raw else { return };

    if let Some(window) = map.remove("window") {
        map.entry("agent_window").or_insert(window);
    }
    if let Some(state) = map.remove("state") {
        if !map.contains_key("status") && !map.contains_key("agent_state") {
            map.insert("status".to_string(), state);
        }
    }
    if let Some(agent_state) = map.remove("agent_state") {
        map.entry("status").or_insert(agent_state);
    }
    map.remove("agent");

    map.entry("title".to_string()).or_insert(Value::Null);
    map.entry("blocked_by".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    map.entry("status".to_string())
        .or_insert_with(|| Value::String("pending".to_string()));
    map.entry("name".to_string()).or_insert(Value::Null);
    map.entry("agent_window".to_string()).or_insert(Value::Null);
    map.entry("created_by".to_string())
        .or_insert_with(|| Value::String("claw-town".to_string()));
    map.entry("last_synced".to_string()).or_insert(Value::Null);
}

/// One-way migration applied on every load: renames fields, re-keys
/// numeric/legacy entries onto their T-number, promotes a legacy top-level
/// `tasks` array. Entries with no discoverable T-number are dropped (this
/// is a known, accepted data-loss path — see DESIGN.md's Open Question
/// resolution).
fn migrate_data(mut data: Value) -> Value {
    let Value::Object(ref mut root) = data else {
        return data;
    };

    let mut migrated_tasks: serde_json::Map<String, Value> = serde_json::Map::new();
    if let Some(Value::Object(known)) = root.remove("known_tasks") {
        for (key, mut entry) in known {
            if key.starts_with('T') {
                migrate_entry(&mut entry);
                migrated_tasks.insert(key, entry);
            } else if let Value::Object(ref obj) = entry {
                let t_number = obj
                    .get("t_number")
                    .or_else(|| obj.get("task_number"))
                    .and_then(Value::as_str)
                    .filter(|s| s.starts_with('T'))
                    .map(str::to_string);
                if let Some(t_number) = t_number {
                    migrate_entry(&mut entry);
                    migrated_tasks.insert(t_number, entry);
                }
                // else: dropped, no T-number to re-key onto.
            }
        }
    }

    if let Some(Value::Array(legacy_tasks)) = root.remove("tasks") {
        for mut entry in legacy_tasks {
            if let Value::Object(ref obj) = entry {
                let t_number = obj
                    .get("t_number")
                    .or_else(|| obj.get("task_number"))
                    .or_else(|| obj.get("id"))
                    .and_then(Value::as_str)
                    .filter(|s| s.starts_with('T'))
                    .map(str::to_string);
                if let Some(t_number) = t_number {
                    if !migrated_tasks.contains_key(&t_number) {
                        migrate_entry(&mut entry);
                        migrated_tasks.insert(t_number, entry);
                    }
                }
            }
        }
    }

    root.insert("known_tasks".to_string(), Value::Object(migrated_tasks));
    for key in ["project", "root_task", "working_dir", "gsd_url", "gsd_project_id", "last_dag_walk", "last_gsd_poll"] {
        root.entry(key).or_insert(Value::Null);
    }

    data
}

/// Load the graph for `state_dir`, returning an empty document if the
/// file doesn't exist. Migration happens in memory; it is only persisted
/// when the caller subsequently saves.
pub fn load(state_dir: &Path) -> Result<TaskGraph> {
    let path = paths::tasks_json_file(state_dir);
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Ok(TaskGraph::default());
    };
    let raw: Value = serde_json::from_str(&content)?;
    let migrated = migrate_data(raw);
    Ok(serde_json::from_value(migrated)?)
}

/// Atomically persist the graph under an exclusive lock.
pub fn save(state_dir: &Path, graph: &TaskGraph) -> Result<()> {
    let lock_path = paths::tasks_json_lock_file(state_dir);
    let path = paths::tasks_json_file(state_dir);
    with_exclusive_lock(&lock_path, || atomic_write_json(&path, graph))
}

/// Load, let `mutate` modify the graph, then save — all under one
/// exclusive lock. If `mutate` returns `Err`, nothing is persisted: the
/// lock is still released, but the write never happens.
pub fn locked_update<T>(
    state_dir: &Path,
    mutate: impl FnOnce(&mut TaskGraph) -> Result<T>,
) -> Result<T> {
    let lock_path = paths::tasks_json_lock_file(state_dir);
    let path = paths::tasks_json_file(state_dir);
    with_exclusive_lock(&lock_path, || {
        let mut graph = {
            let Ok(content) = std::fs::read_to_string(&path) else {
                return run_and_save(&path, TaskGraph::default(), mutate);
            };
            let raw: Value = serde_json::from_str(&content)?;
            serde_json::from_value(migrate_data(raw))?
        };
        let result = mutate(&mut graph);
        match result {
            Ok(value) => {
                atomic_write_json(&path, &graph)?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    })
}

fn run_and_save<T>(
    path: &Path,
    mut graph: TaskGraph,
    mutate: impl FnOnce(&mut TaskGraph) -> Result<T>,
) -> Result<T> {
    let result = mutate(&mut graph)?;
    atomic_write_json(path, &graph)?;
    Ok(result)
}

/// Insert a task if it isn't already present (idempotent).
pub fn add_task(
    state_dir: &Path,
    t_number: &str,
    title: Option<&str>,
    status: &str,
    agent_window: Option<&str>,
    created_by: &str,
) -> Result<()> {
    locked_update(state_dir, |graph| {
        graph.known_tasks.entry(t_number.to_string()).or_insert(KnownTask {
            title: title.map(str::to_string),
            blocked_by: Vec::new(),
            last_synced: None,
            status: status.to_string(),
            name: None,
            agent_window: agent_window.map(str::to_string),
            created_by: created_by.to_string(),
        });
        Ok(())
    })
}

/// Update operational fields for a known task. Returns `false` if the task
/// isn't present. Errors if `status` is given and invalid.
pub fn update_agent(
    state_dir: &Path,
    t_number: &str,
    status: Option<&str>,
    name: Option<&str>,
    agent_window: Option<&str>,
) -> Result<bool> {
    if let Some(status) = status {
        if !VALID_STATES.contains(&status) {
            return Err(crate::errors::ClawTownError::Validation {
                field: "status",
                value: status.to_string(),
                allowed: VALID_STATES.join(", "),
            });
        }
    }
    locked_update(state_dir, |graph| {
        let Some(entry) = graph.known_tasks.get_mut(t_number) else {
            return Ok(false);
        };
        if let Some(status) = status {
            entry.status = status.to_string();
        }
        if let Some(name) = name {
            entry.name = Some(name.to_string());
        }
        if let Some(window) = agent_window {
            entry.agent_window = Some(window.to_string());
        }
        Ok(true)
    })
}

/// Update the Sync Engine's cached fields (title/blocked_by), stamping
/// `last_synced`. Returns `false` if the task isn't present.
pub fn update_cached_fields(
    state_dir: &Path,
    t_number: &str,
    title: Option<&str>,
    status: Option<&str>,
    blocked_by: Option<&[String]>,
) -> Result<bool> {
    locked_update(state_dir, |graph| {
        let Some(entry) = graph.known_tasks.get_mut(t_number) else {
            return Ok(false);
        };
        entry.last_synced = Some(Utc::now());
        if let Some(title) = title {
            entry.title = Some(title.to_string());
        }
        if let Some(status) = status {
            entry.status = status.to_string();
        }
        if let Some(blocked_by) = blocked_by {
            entry.blocked_by = blocked_by.to_vec();
        }
        Ok(true)
    })
}

/// Remove a known task. Returns whether it was present.
pub fn remove_task(state_dir: &Path, t_number: &str) -> Result<bool> {
    locked_update(state_dir, |graph| Ok(graph.known_tasks.remove(t_number).is_some()))
}

/// Add `blocker` to each target's cached `blocked_by` list, skipping
/// targets not present in the graph. Returns a warning per skipped target.
pub fn add_blocking_relationships(
    state_dir: &Path,
    blocker: &str,
    targets: &[String],
) -> Result<Vec<String>> {
    locked_update(state_dir, |graph| {
        let mut warnings = Vec::new();
        for target in targets {
            if target.is_empty() {
                continue;
            }
            match graph.known_tasks.get_mut(target) {
                Some(entry) => {
                    if !entry.blocked_by.iter().any(|b| b == blocker) {
                        entry.blocked_by.push(blocker.to_string());
                    }
                }
                None => warnings.push(format!(
                    "Target task {target} not found in tasks.json, skipping"
                )),
            }
        }
        Ok(warnings)
    })
}

pub fn set_root_task(state_dir: &Path, root_task: &str) -> Result<()> {
    locked_update(state_dir, |graph| {
        graph.root_task = Some(root_task.to_string());
        Ok(())
    })
}

pub fn set_working_dir(state_dir: &Path, working_dir: &str) -> Result<()> {
    locked_update(state_dir, |graph| {
        graph.working_dir = Some(working_dir.to_string());
        Ok(())
    })
}

pub fn working_dir(state_dir: &Path) -> Result<Option<String>> {
    Ok(load(state_dir)?.working_dir)
}

pub fn set_gsd_config(state_dir: &Path, gsd_url: Option<&str>, gsd_project_id: Option<&str>) -> Result<()> {
    locked_update(state_dir, |graph| {
        if let Some(url) = gsd_url {
            graph.gsd_url = Some(url.to_string());
        }
        if let Some(id) = gsd_project_id {
            graph.gsd_project_id = Some(id.to_string());
        }
        Ok(())
    })
}

pub fn update_dag_walk_timestamp(state_dir: &Path) -> Result<()> {
    locked_update(state_dir, |graph| {
        graph.last_dag_walk = Some(Utc::now());
        Ok(())
    })
}

pub fn update_gsd_poll_timestamp(state_dir: &Path) -> Result<()> {
    locked_update(state_dir, |graph| {
        graph.last_gsd_poll = Some(Utc::now());
        Ok(())
    })
}

/// Result of [`create_task_full`]: the new task plus whatever blocking
/// relationships were (or weren't) wired up.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskFullResult {
    pub t_number: String,
    pub title: String,
    pub blocked_by: Vec<String>,
    pub blocking: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocking_errors: Vec<String>,
}

/// End-to-end task creation: Task Store `create` (tagged `{claw-town,
/// claw-town-<project>, …}` plus any caller-supplied tags) -> wire
/// `blocked_by` (the new task is the blocked side) and `blocking` (the new
/// task is the blocker) relationships via `add_blocking` -> insert the
/// result into `known_tasks` -> update each `blocking` target's cached
/// `blocked_by` list.
pub fn create_task_full(
    tasks_dir: &Path,
    state_dir: &Path,
    project: &str,
    title: &str,
    description: Option<&str>,
    blocked_by: &[String],
    blocking: &[String],
    name: Option<&str>,
    tags: &[String],
    status: &str,
) -> Result<CreateTaskFullResult> {
    let mut tag_set: Vec<String> = vec!["claw-town".to_string(), format!("claw-town-{project}")];
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !tag_set.iter().any(|existing| existing == tag) {
            tag_set.push(tag.to_string());
        }
    }

    let task = crate::task_store::create(tasks_dir, title, description, &tag_set, None)?;
    let t_number = task.t_number;

    let mut blocking_errors = Vec::new();
    for blocker in blocked_by {
        let blocker = blocker.trim();
        if blocker.is_empty() {
            continue;
        }
        if let Err(e) = crate::task_store::add_blocking(tasks_dir, blocker, &t_number) {
            blocking_errors.push(format!("Failed to add blocking {blocker} -> {t_number}: {e}"));
        }
    }
    for target in blocking {
        let target = target.trim();
        if target.is_empty() {
            continue;
        }
        if let Err(e) = crate::task_store::add_blocking(tasks_dir, &t_number, target) {
            blocking_errors.push(format!("Failed to add blocking {t_number} -> {target}: {e}"));
        }
    }

    let title_owned = title.to_string();
    let blocked_by_owned = blocked_by.to_vec();
    let name_owned = name.map(str::to_string);
    let status_owned = status.to_string();
    locked_update(state_dir, |graph| {
        graph.known_tasks.entry(t_number.clone()).or_insert(KnownTask {
            title: Some(title_owned.clone()),
            blocked_by: blocked_by_owned.clone(),
            last_synced: None,
            status: status_owned.clone(),
            name: name_owned.clone(),
            agent_window: None,
            created_by: "claw-town".to_string(),
        });
        Ok(())
    })?;

    if !blocking.is_empty() {
        let warnings = add_blocking_relationships(state_dir, &t_number, blocking)?;
        blocking_errors.extend(warnings);
    }

    Ok(CreateTaskFullResult {
        t_number,
        title: title.to_string(),
        blocked_by: blocked_by.to_vec(),
        blocking: blocking.to_vec(),
        name: name.map(str::to_string),
        blocking_errors,
    })
}

/// Initialize a project's graph: if one exists, only fills currently-unset
/// fields (idempotent "set if unset"); otherwise creates a fresh document
/// and, if `root_task` is given, seeds its orchestrator entry.
pub fn initialize(
    state_dir: &Path,
    project: &str,
    root_task: Option<&str>,
    working_dir: Option<&str>,
) -> Result<()> {
    locked_update(state_dir, |graph| {
        let is_fresh = graph.project.is_none() && graph.known_tasks.is_empty();
        if is_fresh {
            graph.project = Some(project.to_string());
            graph.working_dir = working_dir.map(str::to_string);
            if let Some(root) = root_task {
                graph.root_task = Some(root.to_string());
                graph.known_tasks.insert(
                    root.to_string(),
                    KnownTask {
                        title: None,
                        blocked_by: Vec::new(),
                        last_synced: None,
                        status: "orchestrator".to_string(),
                        name: None,
                        agent_window: Some(format!("claw-town-{project}:orchestrator")),
                        created_by: "claw-town".to_string(),
                    },
                );
            }
        } else {
            if graph.project.is_none() {
                graph.project = Some(project.to_string());
            }
            if graph.root_task.is_none() {
                if let Some(root) = root_task {
                    graph.root_task = Some(root.to_string());
                }
            }
            if graph.working_dir.is_none() {
                if let Some(wd) = working_dir {
                    graph.working_dir = Some(wd.to_string());
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn initialize_seeds_orchestrator_entry() {
        let dir = TempDir::new().unwrap();
        initialize(dir.path(), "demo", Some("T001"), Some("/tmp/demo")).unwrap();
        let graph = load(dir.path()).unwrap();
        assert_eq!(graph.root_task.as_deref(), Some("T001"));
        let root_entry = graph.known_tasks.get("T001").unwrap();
        assert_eq!(root_entry.status, "orchestrator");
        assert_eq!(root_entry.agent_window.as_deref(), Some("claw-town-demo:orchestrator"));
    }

    #[test]
    fn migration_renames_legacy_fields() {
        let dir = TempDir::new().unwrap();
        let path = paths::tasks_json_file(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            &path,
            serde_json::json!({
                "known_tasks": {
                    "T001": {"window": "claw-town-demo:orch", "state": "working"}
                }
            })
            .to_string(),
        )
        .unwrap();

        let graph = load(dir.path()).unwrap();
        let entry = graph.known_tasks.get("T001").unwrap();
        assert_eq!(entry.agent_window.as_deref(), Some("claw-town-demo:orch"));
        assert_eq!(entry.status, "working");
    }

    #[test]
    fn create_task_full_wires_blocking_and_cached_fields() {
        let dir = TempDir::new().unwrap();
        let tasks_dir = dir.path().join(".tasks");
        initialize(dir.path(), "demo", None, None).unwrap();

        let blocker = crate::task_store::create(&tasks_dir, "blocker", None, &[], None).unwrap();
        add_task(dir.path(), &blocker.t_number, Some("blocker"), "pending", None, "human").unwrap();

        let result = create_task_full(
            &tasks_dir,
            dir.path(),
            "demo",
            "new task",
            None,
            &[blocker.t_number.clone()],
            &[],
            Some("worker-1"),
            &["custom".to_string()],
            "pending",
        )
        .unwrap();

        let created = crate::task_store::get(&tasks_dir, &result.t_number).unwrap();
        assert!(created.tags.contains(&"claw-town".to_string()));
        assert!(created.tags.contains(&"claw-town-demo".to_string()));
        assert!(created.tags.contains(&"custom".to_string()));
        assert!(created.blocked_by.contains(&blocker.t_number));

        let reloaded_blocker = crate::task_store::get(&tasks_dir, &blocker.t_number).unwrap();
        assert!(reloaded_blocker.blocking.contains(&result.t_number));

        let graph = load(dir.path()).unwrap();
        let entry = graph.known_tasks.get(&result.t_number).unwrap();
        assert_eq!(entry.name.as_deref(), Some("worker-1"));
        assert_eq!(entry.blocked_by, vec![blocker.t_number.clone()]);
    }

    #[test]
    fn locked_update_discards_on_error() {
        let dir = TempDir::new().unwrap();
        initialize(dir.path(), "demo", None, None).unwrap();
        let result: Result<()> = locked_update(dir.path(), |graph| {
            graph.project = Some("changed".to_string());
            Err(crate::errors::ClawTownError::NoRootTask)
        });
        assert!(result.is_err());
        let graph = load(dir.path()).unwrap();
        assert_eq!(graph.project.as_deref(), Some("demo"));
    }
}
