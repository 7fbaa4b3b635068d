//! Task Store — the `.tasks/T*.json` backlog.
//!
//! Each task is its own JSON file named `T###.json`. IDs are allocated from
//! a shared `counter.json` guarded by `.counter.lock`; every task file is
//! guarded by its own `.T###.lock`. Generalizes a per-task checklist model
//! (markdown checklist items there become one JSON document per task here).

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ClawTownError, Result};
use crate::locking::{atomic_write_json, with_exclusive_lock};
use crate::paths;

/// Status a task can be in. Legacy synonyms are normalized on write
/// (see [`normalize_status`]).
pub const VALID_STATUSES: &[&str] = &["open", "in_progress", "closed", "blocked"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: u32,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub t_number: String,
    pub title: String,
    #[serde(default = "default_description")]
    pub description: String,
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blocking: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Pipeline stage; `None` for tasks outside the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Pipeline owner role (distinct from `assigned_to`, which is a human/user).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

fn default_description() -> String {
    "No description provided".to_string()
}

/// Normalize a raw status string: lowercase, dash/space -> underscore,
/// then map legacy synonyms.
pub fn normalize_status(raw: &str) -> String {
    let normalized = raw.to_lowercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "no_progress" | "planned" => "open".to_string(),
        other => other.to_string(),
    }
}

/// Format a numeric task id as `T%03d`.
pub fn format_t_number(num: u32) -> String {
    format!("T{num:03}")
}

/// Parse a T-number from loose forms: `T001`, `T1`, `1`.
pub fn parse_t_number(raw: &str) -> Result<String> {
    let trimmed = raw.trim().to_uppercase();
    let digits = trimmed.strip_prefix('T').unwrap_or(&trimmed);
    let num: u32 = digits
        .parse()
        .map_err(|_| ClawTownError::Validation {
            field: "t_number",
            value: raw.to_string(),
            allowed: "T<digits> or a bare integer".to_string(),
        })?;
    Ok(format_t_number(num))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Counter {
    next_id: u32,
}

/// Allocate the next task ID, mutating `counter.json` under `.counter.lock`.
/// Returns the pre-increment value (the caller's new ID); the file is left
/// holding `next_id + 1`.
fn next_id(tasks_dir: &Path) -> Result<u32> {
    paths::ensure_dir(tasks_dir)?;
    let lock_path = paths::counter_lock_file(tasks_dir);
    let counter_path = paths::counter_file(tasks_dir);
    with_exclusive_lock(&lock_path, || {
        let counter: Counter = std::fs::read_to_string(&counter_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Counter { next_id: 1 });
        let allocated = counter.next_id;
        let next = Counter {
            next_id: allocated + 1,
        };
        atomic_write_json(&counter_path, &next)?;
        Ok(allocated)
    })
}

fn read_task(tasks_dir: &Path, t_number: &str) -> Result<Task> {
    let path = paths::task_file(tasks_dir, t_number);
    let content = std::fs::read_to_string(&path)
        .map_err(|_| ClawTownError::TaskNotFound(t_number.to_string()))?;
    serde_json::from_str(&content).map_err(ClawTownError::Json)
}

fn write_task(tasks_dir: &Path, task: &mut Task) -> Result<()> {
    let lock_path = paths::task_lock_file(tasks_dir, &task.t_number);
    task.updated_at = Utc::now();
    let path = paths::task_file(tasks_dir, &task.t_number);
    with_exclusive_lock(&lock_path, || atomic_write_json(&path, task))
}

fn read_all_tasks(tasks_dir: &Path) -> Result<Vec<Task>> {
    if !tasks_dir.exists() {
        return Ok(Vec::new());
    }
    let mut tasks = Vec::new();
    for entry in std::fs::read_dir(tasks_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with('T') || !name.ends_with(".json") {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(task) = serde_json::from_str(&content) {
                tasks.push(task);
            }
        }
    }
    Ok(tasks)
}

/// Create a new task, always tagging it `claw-town`. Always starts `open`;
/// `priority` is a free-form label (e.g. `med-pri`) stored for later
/// `get`/`update` round-trips. Returns the created task.
pub fn create(
    tasks_dir: &Path,
    title: &str,
    description: Option<&str>,
    tags: &[String],
    priority: Option<&str>,
) -> Result<Task> {
    let id = next_id(tasks_dir)?;
    let t_number = format_t_number(id);
    let now = Utc::now();
    let mut tags: Vec<String> = tags.to_vec();
    if !tags.iter().any(|t| t == "claw-town") {
        tags.push("claw-town".to_string());
    }
    let mut task = Task {
        t_number: t_number.clone(),
        title: title.to_string(),
        description: description.map_or_else(default_description, str::to_string),
        status: "open".to_string(),
        tags,
        created_at: now,
        updated_at: now,
        completed_at: None,
        blocking: Vec::new(),
        blocked_by: Vec::new(),
        assigned_to: None,
        priority: priority.map(str::to_string),
        comments: Vec::new(),
        stage: None,
        owner: None,
    };
    write_task(tasks_dir, &mut task)?;
    Ok(task)
}

/// Fetch a task by T-number.
pub fn get(tasks_dir: &Path, t_number: &str) -> Result<Task> {
    read_task(tasks_dir, t_number)
}

/// Field updates accepted by [`update`]. All are optional; at least one
/// must be set.
#[derive(Debug, Default)]
pub struct TaskUpdate {
    pub status: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub tags: Option<Vec<String>>,
    pub stage: Option<String>,
    pub owner: Option<String>,
}

/// Apply a partial update to a task.
pub fn update(tasks_dir: &Path, t_number: &str, fields: TaskUpdate) -> Result<Task> {
    let mut task = read_task(tasks_dir, t_number)?;
    if let Some(status) = fields.status {
        task.status = normalize_status(&status);
    }
    if let Some(title) = fields.title {
        task.title = title;
    }
    if let Some(description) = fields.description {
        task.description = description;
    }
    if let Some(priority) = fields.priority {
        task.priority = Some(priority);
    }
    if let Some(tags) = fields.tags {
        for tag in tags {
            if !task.tags.contains(&tag) {
                task.tags.push(tag);
            }
        }
    }
    if let Some(stage) = fields.stage {
        task.stage = Some(stage);
    }
    if let Some(owner) = fields.owner {
        task.owner = if owner == "none" { None } else { Some(owner) };
    }
    write_task(tasks_dir, &mut task)?;
    Ok(task)
}

/// Close a task (status=closed, stamps completed_at).
pub fn close(tasks_dir: &Path, t_number: &str) -> Result<Task> {
    let mut task = read_task(tasks_dir, t_number)?;
    task.status = "closed".to_string();
    task.completed_at = Some(Utc::now());
    write_task(tasks_dir, &mut task)?;
    Ok(task)
}

/// Reopen a task, clearing `completed_at`.
pub fn reopen(tasks_dir: &Path, t_number: &str, status: Option<&str>) -> Result<Task> {
    let mut task = read_task(tasks_dir, t_number)?;
    task.status = status.map_or_else(|| "in_progress".to_string(), normalize_status);
    task.completed_at = None;
    write_task(tasks_dir, &mut task)?;
    Ok(task)
}

/// Record that `blocker` blocks `blocked`: updates both tasks' link fields
/// under separate per-task locks (two independent writes, not one
/// transaction).
pub fn add_blocking(tasks_dir: &Path, blocker: &str, blocked: &str) -> Result<()> {
    let mut blocker_task = read_task(tasks_dir, blocker)?;
    if !blocker_task.blocking.iter().any(|t| t == blocked) {
        blocker_task.blocking.push(blocked.to_string());
    }
    write_task(tasks_dir, &mut blocker_task)?;

    let mut blocked_task = read_task(tasks_dir, blocked)?;
    if !blocked_task.blocked_by.iter().any(|t| t == blocker) {
        blocked_task.blocked_by.push(blocker.to_string());
    }
    write_task(tasks_dir, &mut blocked_task)?;
    Ok(())
}

/// Append a comment to a task. `prefix` is stored only when given (not a
/// key that's always present).
pub fn comment(tasks_dir: &Path, t_number: &str, content: &str, prefix: Option<&str>) -> Result<Comment> {
    let mut task = read_task(tasks_dir, t_number)?;
    let entry = Comment {
        id: task.comments.len() as u32 + 1,
        content: content.to_string(),
        prefix: prefix.map(str::to_uppercase),
        created_at: Utc::now(),
    };
    task.comments.push(entry.clone());
    write_task(tasks_dir, &mut task)?;
    Ok(entry)
}

/// List a task's comments, optionally filtered by prefix.
pub fn comments(tasks_dir: &Path, t_number: &str, prefix: Option<&str>) -> Result<Vec<Comment>> {
    let task = read_task(tasks_dir, t_number)?;
    Ok(match prefix {
        None => task.comments,
        Some(p) => task
            .comments
            .into_iter()
            .filter(|c| c.prefix.as_deref() == Some(p))
            .collect(),
    })
}

/// Direction to walk the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkDirection {
    /// Follow `blocking` (what this task unblocks downstream)
    Dependents,
    /// Follow `blocked_by` (what blocks this task)
    Dependencies,
}

/// A node visited during a DAG walk.
#[derive(Debug, Clone, Serialize)]
pub struct DagNode {
    pub t_number: String,
    pub title: String,
    pub status: String,
    pub depth: u32,
}

/// Walk the dependency graph from `root` in `direction`, breadth-first,
/// honoring `max_depth` and a `visited` set shared across the whole walk.
/// Missing linked tasks are skipped rather than aborting the walk.
pub fn walk_dag(
    tasks_dir: &Path,
    root: &str,
    direction: WalkDirection,
    direct_only: bool,
    max_depth: u32,
) -> Result<Vec<DagNode>> {
    let root_task = read_task(tasks_dir, root)?;
    let mut results = vec![DagNode {
        t_number: root_task.t_number.clone(),
        title: root_task.title.clone(),
        status: root_task.status.clone(),
        depth: 0,
    }];

    let neighbors = |t: &Task| -> Vec<String> {
        match direction {
            WalkDirection::Dependents => t.blocking.clone(),
            WalkDirection::Dependencies => t.blocked_by.clone(),
        }
    };

    if direct_only {
        for n in neighbors(&root_task) {
            if let Ok(t) = read_task(tasks_dir, &n) {
                results.push(DagNode {
                    t_number: t.t_number,
                    title: t.title,
                    status: t.status,
                    depth: 1,
                });
            }
        }
        return Ok(results);
    }

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(root_task.t_number.clone());
    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    queue.push_back((root_task.t_number.clone(), 0));

    while let Some((current, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let Ok(current_task) = read_task(tasks_dir, &current) else {
            continue;
        };
        for n in neighbors(&current_task) {
            if visited.contains(&n) {
                continue;
            }
            visited.insert(n.clone());
            let Ok(t) = read_task(tasks_dir, &n) else {
                continue;
            };
            results.push(DagNode {
                t_number: t.t_number.clone(),
                title: t.title.clone(),
                status: t.status.clone(),
                depth: depth + 1,
            });
            queue.push_back((n, depth + 1));
        }
    }

    Ok(results)
}

/// Resolve a task's direct dependents (tasks it blocks).
pub fn list_dependents(tasks_dir: &Path, t_number: &str) -> Result<Vec<DagNode>> {
    walk_dag(tasks_dir, t_number, WalkDirection::Dependents, true, 1)
}

/// Resolve a task's direct dependencies (tasks blocking it).
pub fn list_dependencies(tasks_dir: &Path, t_number: &str) -> Result<Vec<DagNode>> {
    walk_dag(tasks_dir, t_number, WalkDirection::Dependencies, true, 1)
}

/// Tasks matching any of the given tags (OR semantics).
pub fn search(tasks_dir: &Path, tags: &[String]) -> Result<Vec<Task>> {
    let all = read_all_tasks(tasks_dir)?;
    Ok(all
        .into_iter()
        .filter(|t| tags.iter().any(|tag| t.tags.contains(tag)))
        .collect())
}

/// Assign a task to a user. No validation on the user string.
pub fn assign(tasks_dir: &Path, t_number: &str, user: &str) -> Result<Task> {
    let mut task = read_task(tasks_dir, t_number)?;
    task.assigned_to = Some(user.to_string());
    write_task(tasks_dir, &mut task)?;
    Ok(task)
}

/// List every task in the store (used by the Pipeline and Sync Engine).
pub fn list_all(tasks_dir: &Path) -> Result<Vec<Task>> {
    read_all_tasks(tasks_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn id_allocation_has_no_gaps() {
        let dir = TempDir::new().unwrap();
        let t1 = create(dir.path(), "first", None, &[], None).unwrap();
        let t2 = create(dir.path(), "second", None, &[], None).unwrap();
        assert_eq!(t1.t_number, "T001");
        assert_eq!(t2.t_number, "T002");

        let counter: Counter =
            serde_json::from_str(&std::fs::read_to_string(paths::counter_file(dir.path())).unwrap())
                .unwrap();
        assert_eq!(counter.next_id, 3);
    }

    #[test]
    fn link_symmetry_on_add_blocking() {
        let dir = TempDir::new().unwrap();
        let a = create(dir.path(), "A", None, &[], None).unwrap();
        let b = create(dir.path(), "B", None, &[], None).unwrap();
        add_blocking(dir.path(), &a.t_number, &b.t_number).unwrap();

        let a = get(dir.path(), &a.t_number).unwrap();
        let b = get(dir.path(), &b.t_number).unwrap();
        assert!(a.blocking.contains(&b.t_number));
        assert!(b.blocked_by.contains(&a.t_number));
    }

    #[test]
    fn t_number_parsing_accepts_loose_forms() {
        assert_eq!(parse_t_number("T001").unwrap(), "T001");
        assert_eq!(parse_t_number("T1").unwrap(), "T001");
        assert_eq!(parse_t_number("1").unwrap(), "T001");
    }

    #[test]
    fn normalize_status_maps_legacy_values() {
        assert_eq!(normalize_status("no_progress"), "open");
        assert_eq!(normalize_status("planned"), "open");
        assert_eq!(normalize_status("in-progress"), "in_progress");
    }
}
