//! Agent Registry — per-agent health records under `.claw_town/agents/`.
//!
//! One JSON file per agent, holding both persisted fields (heartbeat
//! timestamps, pid, window, missed-heartbeat counter) and a `status`
//! that is always recomputed rather than trusted from disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ClawTownError, Result};
use crate::locking::{atomic_write_json, with_exclusive_lock};
use crate::process_adapter::ProcessAdapter;

/// Missed heartbeats at or above this count mark an agent `stuck`.
pub const STUCK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Alive,
    Stuck,
    Dead,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Alive => "alive",
            HealthStatus::Stuck => "stuck",
            HealthStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub window: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Persisted last-known status; the live [`status`] query recomputes
    /// this from scratch and never trusts the stored value alone.
    pub status: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_mode: Option<String>,
    #[serde(default)]
    pub missed_heartbeats: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

fn record_file(state_dir: &Path, name: &str) -> PathBuf {
    crate::paths::agents_dir(state_dir).join(format!("{name}.json"))
}

fn lock_file(state_dir: &Path, name: &str) -> PathBuf {
    crate::paths::locks_dir(state_dir).join(format!("{name}.lock"))
}

fn read_record(state_dir: &Path, name: &str) -> Result<AgentHealthRecord> {
    let path = record_file(state_dir, name);
    let content = std::fs::read_to_string(&path)
        .map_err(|_| ClawTownError::AgentNotFound(name.to_string()))?;
    serde_json::from_str(&content).map_err(ClawTownError::Json)
}

fn write_record(state_dir: &Path, record: &AgentHealthRecord) -> Result<()> {
    crate::paths::ensure_dir(&crate::paths::agents_dir(state_dir))?;
    let path = record_file(state_dir, &record.name);
    let lock_path = lock_file(state_dir, &record.name);
    crate::paths::ensure_dir(&crate::paths::locks_dir(state_dir))?;
    with_exclusive_lock(&lock_path, || atomic_write_json(&path, record))
}

/// Register a new agent, or overwrite an existing record for the same name.
pub fn register(
    state_dir: &Path,
    name: &str,
    task_id: Option<&str>,
    window: &str,
    pid: Option<u32>,
    agent_mode: Option<&str>,
    role: Option<&str>,
) -> Result<AgentHealthRecord> {
    let now = Utc::now();
    let record = AgentHealthRecord {
        name: name.to_string(),
        task_id: task_id.map(str::to_string),
        window: window.to_string(),
        pid,
        status: HealthStatus::Alive,
        last_heartbeat: now,
        started_at: now,
        agent_mode: agent_mode.map(str::to_string),
        missed_heartbeats: 0,
        role: role.map(str::to_string),
    };
    write_record(state_dir, &record)?;
    Ok(record)
}

/// Record a heartbeat: stamps `last_heartbeat`, zeroes the missed
/// counter, marks the persisted status `alive`.
pub fn heartbeat(state_dir: &Path, name: &str) -> Result<AgentHealthRecord> {
    let mut record = read_record(state_dir, name)?;
    record.last_heartbeat = Utc::now();
    record.missed_heartbeats = 0;
    record.status = HealthStatus::Alive;
    write_record(state_dir, &record)?;
    Ok(record)
}

/// Record a missed heartbeat: increments the counter, marking the
/// persisted status `stuck` once it reaches [`STUCK_THRESHOLD`].
pub fn miss_heartbeat(state_dir: &Path, name: &str) -> Result<AgentHealthRecord> {
    let mut record = read_record(state_dir, name)?;
    record.missed_heartbeats += 1;
    if record.missed_heartbeats >= STUCK_THRESHOLD {
        record.status = HealthStatus::Stuck;
    }
    write_record(state_dir, &record)?;
    Ok(record)
}

/// List every registered agent (persisted view; pass `refresh = true` to
/// recompute live status for each).
pub fn list(state_dir: &Path, adapter: Option<&dyn ProcessAdapter>) -> Result<Vec<AgentHealthRecord>> {
    let dir = crate::paths::agents_dir(state_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_stem().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Ok(mut record) = read_record(state_dir, name) {
            if let Some(adapter) = adapter {
                record.status = compute_status(adapter, &record);
            }
            records.push(record);
        }
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

/// Deterministic status recomputation: a pure function of
/// `(window_exists, pane_pid_exists, pid_alive, ai_child_present,
/// missed_heartbeats)`.
pub fn compute_status(adapter: &dyn ProcessAdapter, record: &AgentHealthRecord) -> HealthStatus {
    let window_exists = adapter.window_exists(&record.window).unwrap_or(false);
    if !window_exists {
        return HealthStatus::Dead;
    }
    let pane_pid = adapter.pane_pid(&record.window).ok().flatten();
    if pane_pid.is_none() {
        return HealthStatus::Dead;
    }
    let pid_alive = record.pid.map(pid_is_alive).unwrap_or(false);
    if !pid_alive {
        return HealthStatus::Dead;
    }
    let ai_child_present = record
        .pid
        .map(|pid| ai_child_process_exists(pid))
        .unwrap_or(false);
    if !ai_child_present {
        return HealthStatus::Dead;
    }
    if record.missed_heartbeats >= STUCK_THRESHOLD {
        return HealthStatus::Stuck;
    }
    HealthStatus::Alive
}

/// Whether `pid` is a live OS process. Bounded: a single `kill -0` probe,
/// no blocking wait.
#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    false
}

/// Whether `pid` has a live AI-CLI child process beneath it, via `pgrep
/// -P`. A timeout/spawn failure degrades to "not live" rather than fatal.
#[cfg(unix)]
fn ai_child_process_exists(pid: u32) -> bool {
    std::process::Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output()
        .map(|o| o.status.success() && !o.stdout.is_empty())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn ai_child_process_exists(_pid: u32) -> bool {
    false
}

/// Live (non-persisted) status view augmenting the persisted record with
/// fields computed only at query time.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusView {
    #[serde(flatten)]
    pub record: AgentHealthRecord,
    pub live_pane_pid: Option<u32>,
    pub tmux_window_exists: bool,
    pub lock_file_exists: bool,
}

pub fn status(state_dir: &Path, name: &str, adapter: &dyn ProcessAdapter) -> Result<AgentStatusView> {
    let mut record = read_record(state_dir, name)?;
    record.status = compute_status(adapter, &record);
    let live_pane_pid = adapter.pane_pid(&record.window).ok().flatten();
    let tmux_window_exists = adapter.window_exists(&record.window).unwrap_or(false);
    let lock_file_exists = lock_file(state_dir, name).exists();
    Ok(AgentStatusView {
        record,
        live_pane_pid,
        tmux_window_exists,
        lock_file_exists,
    })
}

/// Tear down an agent: send `/exit`, SIGTERM the known pid, mark dead,
/// and remove its lock file.
pub fn kill(state_dir: &Path, name: &str, adapter: &dyn ProcessAdapter) -> Result<()> {
    let mut record = read_record(state_dir, name)?;
    let _ = adapter.send_keys(&record.window, "/exit");
    if let Some(pid) = record.pid {
        send_sigterm(pid);
    }
    record.status = HealthStatus::Dead;
    write_record(state_dir, &record)?;
    let _ = std::fs::remove_file(lock_file(state_dir, name));
    Ok(())
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    let _ = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status();
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// Resolve a spawn prompt file: `<name>.md`, falling back to
/// `<task_id>.md`, both under `prompts_dir`.
pub fn resolve_prompt_file(prompts_dir: &Path, name: &str, task_id: Option<&str>) -> Option<PathBuf> {
    let by_name = prompts_dir.join(format!("{name}.md"));
    if by_name.exists() {
        return Some(by_name);
    }
    if let Some(task_id) = task_id {
        let by_task = prompts_dir.join(format!("{task_id}.md"));
        if by_task.exists() {
            return Some(by_task);
        }
    }
    None
}

/// Tear down the old window/lock and re-register under a freshly split
/// pane. The actual `claude`/CLI relaunch is the caller's job (via the
/// Supervisor Loop's restart sequence); this only manages registry state
/// and pane lifecycle.
pub fn respawn(
    state_dir: &Path,
    name: &str,
    adapter: &dyn ProcessAdapter,
    session: &str,
    working_dir: &str,
) -> Result<AgentHealthRecord> {
    let old = read_record(state_dir, name)?;
    if adapter.window_exists(&old.window).unwrap_or(false) {
        let _ = adapter.kill_window(&old.window);
    }
    let _ = std::fs::remove_file(lock_file(state_dir, name));

    let new_window = adapter.split_pane(session, true, working_dir, &[])?;
    register(
        state_dir,
        name,
        old.task_id.as_deref(),
        &new_window,
        adapter.pane_pid(&new_window).ok().flatten(),
        old.agent_mode.as_deref(),
        old.role.as_deref(),
    )
}

/// Recompute health for every registered agent.
pub fn check_health(state_dir: &Path, adapter: &dyn ProcessAdapter) -> Result<Vec<AgentHealthRecord>> {
    let mut records = list(state_dir, None)?;
    for record in &mut records {
        record.status = compute_status(adapter, record);
        write_record(state_dir, record)?;
    }
    Ok(records)
}

/// Remove an agent's registry record entirely.
pub fn deregister(state_dir: &Path, name: &str) -> Result<()> {
    let path = record_file(state_dir, name);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let _ = std::fs::remove_file(lock_file(state_dir, name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_adapter::test_support::FakeAdapter;
    use tempfile::TempDir;

    #[test]
    fn register_then_heartbeat_resets_missed_count() {
        let dir = TempDir::new().unwrap();
        register(dir.path(), "intern-1", Some("T001"), "%1", Some(100), None, Some("intern")).unwrap();
        miss_heartbeat(dir.path(), "intern-1").unwrap();
        miss_heartbeat(dir.path(), "intern-1").unwrap();
        let record = heartbeat(dir.path(), "intern-1").unwrap();
        assert_eq!(record.missed_heartbeats, 0);
        assert_eq!(record.status, HealthStatus::Alive);
    }

    #[test]
    fn missed_heartbeats_at_threshold_marks_stuck() {
        let dir = TempDir::new().unwrap();
        register(dir.path(), "intern-1", None, "%1", Some(100), None, None).unwrap();
        for _ in 0..STUCK_THRESHOLD {
            miss_heartbeat(dir.path(), "intern-1").unwrap();
        }
        let record = read_record(dir.path(), "intern-1").unwrap();
        assert_eq!(record.status, HealthStatus::Stuck);
    }

    #[test]
    fn compute_status_is_dead_when_window_missing() {
        let dir = TempDir::new().unwrap();
        let adapter = FakeAdapter::default();
        register(dir.path(), "intern-1", None, "%1", Some(100), None, None).unwrap();
        let record = read_record(dir.path(), "intern-1").unwrap();
        assert_eq!(compute_status(&adapter, &record), HealthStatus::Dead);
    }

    #[test]
    fn deregister_removes_record() {
        let dir = TempDir::new().unwrap();
        register(dir.path(), "intern-1", None, "%1", Some(100), None, None).unwrap();
        deregister(dir.path(), "intern-1").unwrap();
        assert!(read_record(dir.path(), "intern-1").is_err());
    }
}
