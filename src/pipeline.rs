//! Pipeline — the fixed role-handoff state machine over tasks.
//!
//! A task moves through a fixed ordered sequence of stages, each owned
//! by one role at a time, with `claim` / `release` moving forward and
//! `reject` moving backward along an explicit allow-list.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::errors::{ClawTownError, Result};
use crate::task_store::{self, Task};

/// The fixed pipeline stage order.
pub const STAGES: &[&str] = &[
    "pm",
    "tech-lead",
    "intern",
    "code-review",
    "perf-check",
    "qa-test",
    "design-audit",
    "done",
];

/// Stage -> role mapping. `done` has no handling role.
static STAGE_TO_ROLE: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("pm", "pm"),
        ("tech-lead", "tech-lead"),
        ("intern", "intern"),
        ("code-review", "code-reviewer"),
        ("perf-check", "perf-checker"),
        ("qa-test", "qa-tester"),
        ("design-audit", "design-auditor"),
    ])
});

static ROLE_TO_STAGE: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| STAGE_TO_ROLE.iter().map(|(s, r)| (*r, *s)).collect());

/// The reject allow-list: stage -> stages it may reject back to.
static REJECT_ALLOWED: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    HashMap::from([
        ("code-review", vec!["intern"]),
        ("perf-check", vec!["intern"]),
        ("qa-test", vec!["intern"]),
        ("design-audit", vec!["intern"]),
        ("intern", vec!["pm", "tech-lead"]),
        ("tech-lead", vec!["pm"]),
    ])
});

fn stage_index(stage: &str) -> Option<usize> {
    STAGES.iter().position(|s| *s == stage)
}

/// The stage following `current`, or `None` if `current` is last/unknown.
pub fn next_stage(current: &str) -> Option<&'static str> {
    let idx = stage_index(current)?;
    STAGES.get(idx + 1).copied()
}

#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub stage: &'static str,
    pub role: Option<&'static str>,
    pub position: usize,
}

/// The static pipeline definition (stage/role/position), a pure read-only view.
pub fn stages() -> Vec<StageInfo> {
    STAGES
        .iter()
        .enumerate()
        .map(|(i, s)| StageInfo {
            stage: s,
            role: STAGE_TO_ROLE.get(s).copied(),
            position: i,
        })
        .collect()
}

/// Tasks at `role`'s stage that have no owner yet.
pub fn list_available(tasks_dir: &Path, role: &str) -> Result<Vec<Task>> {
    let stage = *ROLE_TO_STAGE.get(role).ok_or_else(|| ClawTownError::Validation {
        field: "role",
        value: role.to_string(),
        allowed: ROLE_TO_STAGE.keys().copied().collect::<Vec<_>>().join(", "),
    })?;
    let all = task_store::list_all(tasks_dir)?;
    Ok(all
        .into_iter()
        .filter(|t| t.stage.as_deref() == Some(stage) && t.owner.is_none())
        .collect())
}

/// Claim a task for `role`: requires the task's current stage to match the
/// role's stage and the task to be unowned.
pub fn claim(tasks_dir: &Path, t_number: &str, role: &str) -> Result<Task> {
    let expected_stage = *ROLE_TO_STAGE.get(role).ok_or_else(|| ClawTownError::Validation {
        field: "role",
        value: role.to_string(),
        allowed: ROLE_TO_STAGE.keys().copied().collect::<Vec<_>>().join(", "),
    })?;
    let task = task_store::get(tasks_dir, t_number)?;
    let current_stage = task.stage.as_deref().unwrap_or("");
    if current_stage != expected_stage {
        return Err(ClawTownError::PipelineViolation(format!(
            "Task {t_number} is at stage '{current_stage}', but role '{role}' handles stage '{expected_stage}'"
        )));
    }
    if let Some(owner) = &task.owner {
        return Err(ClawTownError::PipelineViolation(format!(
            "Task {t_number} is already owned by '{owner}'"
        )));
    }
    task_store::update(
        tasks_dir,
        t_number,
        task_store::TaskUpdate {
            owner: Some(role.to_string()),
            status: Some("in_progress".to_string()),
            ..Default::default()
        },
    )
}

/// Release a task: advances it to the next stage, clears owner, and sets
/// status to `closed` (final stage) or `open` (mid-pipeline).
pub fn release(tasks_dir: &Path, t_number: &str) -> Result<Task> {
    let task = task_store::get(tasks_dir, t_number)?;
    if task.owner.is_none() {
        return Err(ClawTownError::PipelineViolation(format!(
            "Task {t_number} has no owner to release"
        )));
    }
    let current_stage = task.stage.as_deref().unwrap_or("");
    let advanced = next_stage(current_stage);
    if advanced.is_none() && current_stage != "done" {
        return Err(ClawTownError::PipelineViolation(format!(
            "Task {t_number} is at unknown stage '{current_stage}', cannot advance"
        )));
    }
    let new_stage = advanced.unwrap_or("done");
    task_store::update(
        tasks_dir,
        t_number,
        task_store::TaskUpdate {
            stage: Some(new_stage.to_string()),
            owner: Some("none".to_string()),
            ..Default::default()
        },
    )?;
    if new_stage == "done" {
        task_store::close(tasks_dir, t_number)
    } else {
        task_store::update(
            tasks_dir,
            t_number,
            task_store::TaskUpdate {
                status: Some("open".to_string()),
                ..Default::default()
            },
        )
    }
}

/// Reject a task back to `target_stage`, recording a `REJECTED` comment.
///
/// Two separate writes happen here: the state change, then the comment.
pub fn reject(tasks_dir: &Path, t_number: &str, target_stage: &str, reason: &str) -> Result<Task> {
    if !STAGES.contains(&target_stage) {
        return Err(ClawTownError::Validation {
            field: "target_stage",
            value: target_stage.to_string(),
            allowed: STAGES.join(", "),
        });
    }
    let task = task_store::get(tasks_dir, t_number)?;
    let current_stage = task.stage.as_deref().unwrap_or("");
    let allowed = REJECT_ALLOWED.get(current_stage).cloned().unwrap_or_default();
    if !allowed.contains(&target_stage) {
        return Err(ClawTownError::PipelineViolation(format!(
            "Stage '{current_stage}' cannot reject to '{target_stage}'. Allowed targets: {}",
            allowed.join(", ")
        )));
    }
    let current_idx = stage_index(current_stage).unwrap_or(usize::MAX);
    let target_idx = stage_index(target_stage).unwrap_or(usize::MAX);
    if target_idx >= current_idx {
        return Err(ClawTownError::PipelineViolation(format!(
            "Cannot reject forward: '{target_stage}' is not before '{current_stage}'"
        )));
    }

    let current_owner = task.owner.clone().unwrap_or_else(|| "unknown".to_string());
    task_store::update(
        tasks_dir,
        t_number,
        task_store::TaskUpdate {
            stage: Some(target_stage.to_string()),
            status: Some("open".to_string()),
            owner: Some("none".to_string()),
            ..Default::default()
        },
    )?;

    let comment_content = format!(
        "Rejected from {current_stage} back to {target_stage} (by {current_owner}): {reason}"
    );
    task_store::comment(tasks_dir, t_number, &comment_content, Some("REJECTED"))?;

    task_store::get(tasks_dir, t_number)
}

/// Admin override: set a task's stage directly, clearing its owner.
pub fn set_stage(tasks_dir: &Path, t_number: &str, stage: &str) -> Result<Task> {
    if !STAGES.contains(&stage) {
        return Err(ClawTownError::Validation {
            field: "stage",
            value: stage.to_string(),
            allowed: STAGES.join(", "),
        });
    }
    task_store::update(
        tasks_dir,
        t_number,
        task_store::TaskUpdate {
            stage: Some(stage.to_string()),
            owner: Some("none".to_string()),
            ..Default::default()
        },
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardEntry {
    pub t_number: String,
    pub title: String,
    pub owner: Option<String>,
    pub status: String,
}

/// All tasks grouped by stage, plus an `unassigned` bucket for tasks with
/// no stage set.
pub fn board(tasks_dir: &Path) -> Result<HashMap<String, Vec<BoardEntry>>> {
    let all = task_store::list_all(tasks_dir)?;
    let mut grouped: HashMap<String, Vec<BoardEntry>> =
        STAGES.iter().map(|s| (s.to_string(), Vec::new())).collect();
    grouped.insert("unassigned".to_string(), Vec::new());

    for task in all {
        let key = task.stage.clone().unwrap_or_else(|| "unassigned".to_string());
        let key = if grouped.contains_key(&key) {
            key
        } else {
            "unassigned".to_string()
        };
        grouped.entry(key).or_default().push(BoardEntry {
            t_number: task.t_number,
            title: task.title,
            owner: task.owner,
            status: task.status,
        });
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_task(dir: &Path, stage: &str) -> Task {
        let task = task_store::create(dir, "impl widget", None, &[], None).unwrap();
        task_store::update(
            dir,
            &task.t_number,
            task_store::TaskUpdate {
                stage: Some(stage.to_string()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn claim_requires_matching_stage_and_no_owner() {
        let dir = TempDir::new().unwrap();
        let task = setup_task(dir.path(), "intern");
        let claimed = claim(dir.path(), &task.t_number, "intern").unwrap();
        assert_eq!(claimed.owner.as_deref(), Some("intern"));

        let err = claim(dir.path(), &task.t_number, "intern").unwrap_err();
        assert!(matches!(err, ClawTownError::PipelineViolation(_)));
    }

    #[test]
    fn release_advances_stage_and_clears_owner() {
        let dir = TempDir::new().unwrap();
        let task = setup_task(dir.path(), "intern");
        claim(dir.path(), &task.t_number, "intern").unwrap();
        let released = release(dir.path(), &task.t_number).unwrap();
        assert_eq!(released.stage.as_deref(), Some("code-review"));
        assert_eq!(released.owner, None);
        assert_eq!(released.status, "open");
    }

    #[test]
    fn reject_requires_allow_list_membership() {
        let dir = TempDir::new().unwrap();
        let task = setup_task(dir.path(), "code-review");
        claim(dir.path(), &task.t_number, "code-reviewer").unwrap();

        let rejected = reject(dir.path(), &task.t_number, "intern", "tests missing").unwrap();
        assert_eq!(rejected.stage.as_deref(), Some("intern"));
        assert_eq!(rejected.status, "open");
        let last_comment = rejected.comments.last().unwrap();
        assert_eq!(last_comment.prefix.as_deref(), Some("REJECTED"));
        assert!(last_comment.content.contains("tests missing"));

        let err = reject(dir.path(), &task.t_number, "qa-test", "nope").unwrap_err();
        assert!(matches!(err, ClawTownError::PipelineViolation(_)));
    }

    #[test]
    fn reject_rejects_forward_moves() {
        let dir = TempDir::new().unwrap();
        let task = setup_task(dir.path(), "tech-lead");
        claim(dir.path(), &task.t_number, "tech-lead").unwrap();
        let err = reject(dir.path(), &task.t_number, "pm", "ok").unwrap();
        assert_eq!(err.stage.as_deref(), Some("pm"));
    }
}
