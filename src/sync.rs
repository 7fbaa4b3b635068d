//! Sync Engine — reconciles the Task Store (files on disk) against the
//! cached view in the Task Graph (`tasks.json`) and emits a diff report.
//!
//! One cycle: load graph, list task files, diff against the prior
//! `.sync_cache.json`, apply the changes to the graph, overwrite the
//! cache, and emit a `task_sync` event.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ClawTownError, Result};
use crate::event_log::{self, EventType};
use crate::locking::atomic_write_json;
use crate::task_graph::{self, TaskGraph};
use crate::task_store;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SyncCacheEntry {
    status: String,
}

type SyncCache = HashMap<String, SyncCacheEntry>;

fn load_cache(state_dir: &Path) -> SyncCache {
    let path = crate::paths::sync_cache_file(state_dir);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn save_cache(state_dir: &Path, cache: &SyncCache) -> Result<()> {
    let path = crate::paths::sync_cache_file(state_dir);
    atomic_write_json(&path, cache)
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct NewTask {
    pub t_number: String,
    pub title: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusChange {
    pub t_number: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BlockedByChange {
    pub t_number: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
}

/// The diff report for one sync cycle. `description_changes`,
/// `priority_changes`, and `reopened_tasks` are reserved diff categories:
/// the schema declares them but no code path ever fills them in yet.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SyncChanges {
    pub new_tasks: Vec<NewTask>,
    pub removed_tasks: Vec<String>,
    pub status_changes: Vec<StatusChange>,
    pub blocked_by_changes: Vec<BlockedByChange>,
    pub newly_unblocked: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub description_changes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub priority_changes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reopened_tasks: Vec<String>,
}

impl SyncChanges {
    fn is_empty(&self) -> bool {
        self.new_tasks.is_empty()
            && self.removed_tasks.is_empty()
            && self.status_changes.is_empty()
            && self.blocked_by_changes.is_empty()
            && self.newly_unblocked.is_empty()
    }

    /// One-line counts summary, e.g. "2 new, 1 closed, 0 removed".
    pub fn summary_line(&self) -> String {
        format!(
            "{} new, {} status changes, {} removed, {} newly unblocked",
            self.new_tasks.len(),
            self.status_changes.len(),
            self.removed_tasks.len(),
            self.newly_unblocked.len()
        )
    }

    /// Multi-line diff detail, one entry per change.
    pub fn detail_lines(&self) -> String {
        let mut lines = Vec::new();
        for t in &self.new_tasks {
            lines.push(format!("+ {} \"{}\" ({})", t.t_number, t.title, t.status));
        }
        for t in &self.removed_tasks {
            lines.push(format!("- {t}"));
        }
        for c in &self.status_changes {
            lines.push(format!("~ {} {} -> {}", c.t_number, c.from, c.to));
        }
        for c in &self.blocked_by_changes {
            lines.push(format!(
                "~ {} blocked_by {:?} -> {:?}",
                c.t_number, c.from, c.to
            ));
        }
        for t in &self.newly_unblocked {
            lines.push(format!("* {t} newly unblocked"));
        }
        lines.join("\n")
    }
}

/// Run one sync cycle for a project. `project_dir` is the project root
/// (parent of both `.claw_town/` and `.tasks/`).
pub fn sync(project_dir: &Path) -> Result<SyncChanges> {
    let state_dir = crate::paths::state_dir(project_dir);
    let tasks_dir = crate::paths::tasks_dir(project_dir);

    let graph = task_graph::load(&state_dir)?;
    if graph.root_task.is_none() {
        return Err(ClawTownError::NoRootTask);
    }

    let files: HashMap<String, task_store::Task> = task_store::list_all(&tasks_dir)?
        .into_iter()
        .map(|t| (t.t_number.clone(), t))
        .collect();

    let prior_cache = load_cache(&state_dir);
    let changes = compute_changes(&graph, &files, &prior_cache);

    apply_changes(&state_dir, &graph, &files, &changes)?;

    let new_cache: SyncCache = files
        .values()
        .map(|t| {
            (
                t.t_number.clone(),
                SyncCacheEntry { status: t.status.clone() },
            )
        })
        .collect();
    save_cache(&state_dir, &new_cache)?;

    if changes.is_empty() {
        event_log::log_event(&state_dir, EventType::TaskSync, "No changes", None)?;
    } else {
        event_log::log_event(
            &state_dir,
            EventType::TaskSync,
            &changes.summary_line(),
            Some(&changes.detail_lines()),
        )?;
    }

    Ok(changes)
}

fn compute_changes(
    graph: &TaskGraph,
    files: &HashMap<String, task_store::Task>,
    prior_cache: &SyncCache,
) -> SyncChanges {
    let mut changes = SyncChanges::default();

    for (t_number, task) in files {
        if !graph.known_tasks.contains_key(t_number) {
            changes.new_tasks.push(NewTask {
                t_number: t_number.clone(),
                title: task.title.clone(),
                status: task.status.clone(),
            });
        }
    }

    let root = graph.root_task.as_deref();
    for t_number in graph.known_tasks.keys() {
        if Some(t_number.as_str()) == root {
            continue;
        }
        if !files.contains_key(t_number) && prior_cache.contains_key(t_number) {
            changes.removed_tasks.push(t_number.clone());
        }
    }
    changes.removed_tasks.sort();

    let mut closed_this_cycle: Vec<String> = Vec::new();
    for (t_number, task) in files {
        if let Some(cached) = prior_cache.get(t_number) {
            if cached.status != task.status {
                changes.status_changes.push(StatusChange {
                    t_number: t_number.clone(),
                    from: cached.status.clone(),
                    to: task.status.clone(),
                });
                if task.status == "closed" {
                    closed_this_cycle.push(t_number.clone());
                }
            }
        }

        let mut graph_blocked_by = graph
            .known_tasks
            .get(t_number)
            .map(|k| k.blocked_by.clone())
            .unwrap_or_default();
        let mut file_blocked_by = task.blocked_by.clone();
        graph_blocked_by.sort();
        file_blocked_by.sort();
        if graph_blocked_by != file_blocked_by {
            changes.blocked_by_changes.push(BlockedByChange {
                t_number: t_number.clone(),
                from: graph_blocked_by,
                to: file_blocked_by,
            });
        }
    }
    changes
        .status_changes
        .sort_by(|a, b| a.t_number.cmp(&b.t_number));
    changes
        .blocked_by_changes
        .sort_by(|a, b| a.t_number.cmp(&b.t_number));

    for (t_number, task) in files {
        if task.blocked_by.is_empty() {
            continue;
        }
        let all_closed = task.blocked_by.iter().all(|b| {
            files
                .get(b)
                .map(|blocker| blocker.status == "closed")
                .unwrap_or(false)
        });
        let any_closed_this_cycle = task
            .blocked_by
            .iter()
            .any(|b| closed_this_cycle.contains(b));
        if all_closed && any_closed_this_cycle {
            changes.newly_unblocked.push(t_number.clone());
        }
    }
    changes.newly_unblocked.sort();

    changes
}

fn apply_changes(
    state_dir: &Path,
    _graph: &TaskGraph,
    files: &HashMap<String, task_store::Task>,
    changes: &SyncChanges,
) -> Result<()> {
    let closed_this_cycle: std::collections::HashSet<&str> = changes
        .status_changes
        .iter()
        .filter(|c| c.to == "closed")
        .map(|c| c.t_number.as_str())
        .collect();

    task_graph::locked_update(state_dir, |graph| {
        for new in &changes.new_tasks {
            let status = if new.status == "closed" { "completed" } else { "pending" };
            graph.known_tasks.entry(new.t_number.clone()).or_insert(task_graph::KnownTask {
                title: Some(new.title.clone()),
                blocked_by: files.get(&new.t_number).map(|t| t.blocked_by.clone()).unwrap_or_default(),
                last_synced: Some(chrono::Utc::now()),
                status: status.to_string(),
                name: None,
                agent_window: None,
                created_by: "human".to_string(),
            });
        }

        for removed in &changes.removed_tasks {
            graph.known_tasks.remove(removed);
        }

        for t_number in closed_this_cycle.iter() {
            if let Some(entry) = graph.known_tasks.get_mut(*t_number) {
                entry.status = "completed".to_string();
            }
        }

        for change in &changes.blocked_by_changes {
            if let Some(entry) = graph.known_tasks.get_mut(&change.t_number) {
                entry.blocked_by = change.to.clone();
            }
        }

        for (t_number, task) in files {
            if let Some(entry) = graph.known_tasks.get_mut(t_number) {
                entry.title = Some(task.title.clone());
                entry.last_synced = Some(chrono::Utc::now());
            }
        }

        graph.last_dag_walk = Some(chrono::Utc::now());
        Ok(())
    })
}

/// Loop `sync` on a cooperative cancellation interval, checking
/// `should_stop` roughly once a second so shutdown is responsive even
/// between long `interval`s.
pub async fn watch(
    project_dir: &Path,
    interval: Duration,
    mut should_stop: impl FnMut() -> bool,
) -> Result<()> {
    loop {
        if should_stop() {
            return Ok(());
        }
        sync(project_dir)?;

        let mut waited = Duration::ZERO;
        while waited < interval {
            if should_stop() {
                return Ok(());
            }
            let step = Duration::from_secs(1).min(interval - waited);
            tokio::time::sleep(step).await;
            waited += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_project() -> TempDir {
        let dir = TempDir::new().unwrap();
        let state_dir = crate::paths::state_dir(dir.path());
        let tasks_dir = crate::paths::tasks_dir(dir.path());
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::create_dir_all(&tasks_dir).unwrap();
        dir
    }

    #[test]
    fn detects_new_task_and_status_change() {
        let dir = setup_project();
        let tasks_dir = crate::paths::tasks_dir(dir.path());
        let state_dir = crate::paths::state_dir(dir.path());

        let t1 = task_store::create(&tasks_dir, "root task", None, &[], None).unwrap();
        task_graph::initialize(&state_dir, "demo", Some(&t1.t_number), None).unwrap();

        // First sync establishes the cache baseline.
        sync(dir.path()).unwrap();

        let t2 = task_store::create(&tasks_dir, "second task", None, &[], None).unwrap();
        task_store::close(&tasks_dir, &t1.t_number).unwrap();

        let changes = sync(dir.path()).unwrap();
        assert_eq!(changes.new_tasks.len(), 1);
        assert_eq!(changes.new_tasks[0].t_number, t2.t_number);
        assert_eq!(changes.status_changes.len(), 1);
        assert_eq!(changes.status_changes[0].t_number, t1.t_number);
        assert_eq!(changes.status_changes[0].to, "closed");

        let graph = task_graph::load(&state_dir).unwrap();
        assert_eq!(
            graph.known_tasks.get(&t1.t_number).unwrap().status,
            "completed"
        );
    }

    #[test]
    fn second_sync_with_no_change_yields_zero_counts() {
        let dir = setup_project();
        let tasks_dir = crate::paths::tasks_dir(dir.path());
        let state_dir = crate::paths::state_dir(dir.path());

        let t1 = task_store::create(&tasks_dir, "root task", None, &[], None).unwrap();
        task_graph::initialize(&state_dir, "demo", Some(&t1.t_number), None).unwrap();

        sync(dir.path()).unwrap();
        let changes = sync(dir.path()).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn newly_unblocked_requires_closure_in_this_cycle() {
        let dir = setup_project();
        let tasks_dir = crate::paths::tasks_dir(dir.path());
        let state_dir = crate::paths::state_dir(dir.path());

        let root = task_store::create(&tasks_dir, "root", None, &[], None).unwrap();
        let blocker = task_store::create(&tasks_dir, "blocker", None, &[], None).unwrap();
        let blocked = task_store::create(&tasks_dir, "blocked", None, &[], None).unwrap();
        task_store::add_blocking(&tasks_dir, &blocker.t_number, &blocked.t_number).unwrap();
        task_graph::initialize(&state_dir, "demo", Some(&root.t_number), None).unwrap();

        sync(dir.path()).unwrap();
        task_store::close(&tasks_dir, &blocker.t_number).unwrap();
        let changes = sync(dir.path()).unwrap();

        assert_eq!(changes.newly_unblocked, vec![blocked.t_number.clone()]);
    }
}
