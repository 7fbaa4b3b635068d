//! Event Log — append-only JSONL journal of supervisor-visible transitions.
//!
//! Every state transition the system cares about (nudge, restart, stall,
//! learning event, sync diff, task completion) is appended as one JSON
//! line to `events.jsonl`, with writers taking an exclusive lock and
//! readers a shared lock. The log is truncated to the most recent
//! [`MAX_EVENTS`] lines after every append.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::locking::{sibling_lock_path, with_exclusive_lock, with_shared_lock};

/// Event log is truncated to this many most-recent lines after each append.
pub const MAX_EVENTS: usize = 500;

/// Closed set of event types the supervisor can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NudgeOrch,
    NudgeAgent,
    AgentStall,
    Learn,
    TaskSync,
    TaskComplete,
    RestartOrch,
    RestartAgent,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::NudgeOrch => "nudge_orch",
            EventType::NudgeAgent => "nudge_agent",
            EventType::AgentStall => "agent_stall",
            EventType::Learn => "learn",
            EventType::TaskSync => "task_sync",
            EventType::TaskComplete => "task_complete",
            EventType::RestartOrch => "restart_orch",
            EventType::RestartAgent => "restart_agent",
        }
    }

    /// Parse the snake_case wire form back into an `EventType` (CLI `events log --type`).
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "nudge_orch" => EventType::NudgeOrch,
            "nudge_agent" => EventType::NudgeAgent,
            "agent_stall" => EventType::AgentStall,
            "learn" => EventType::Learn,
            "task_sync" => EventType::TaskSync,
            "task_complete" => EventType::TaskComplete,
            "restart_orch" => EventType::RestartOrch,
            "restart_agent" => EventType::RestartAgent,
            _ => return None,
        })
    }
}

/// A single journalled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Append `event` to `events.jsonl` under `state_dir`, then truncate if needed.
///
/// Takes an exclusive lock on the sibling `.events.jsonl.lock` for the
/// whole append+truncate cycle.
pub fn log_event(state_dir: &Path, event_type: EventType, summary: &str, details: Option<&str>) -> Result<()> {
    let path = crate::paths::events_file(state_dir);
    let lock_path = sibling_lock_path(&path);
    let event = Event {
        ts: Utc::now(),
        event_type: event_type.as_str().to_string(),
        summary: summary.to_string(),
        details: details.map(str::to_string),
    };

    with_exclusive_lock(&lock_path, || {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let line = serde_json::to_string(&event)?;
        writeln!(file, "{line}")?;
        drop(file);
        truncate_if_needed(&path)
    })
}

/// Truncate the event log to the most recent [`MAX_EVENTS`] lines, if it
/// has grown past that.
fn truncate_if_needed(path: &Path) -> Result<()> {
    let lines = read_all_lines(path)?;
    if lines.len() <= MAX_EVENTS {
        return Ok(());
    }
    let keep: Vec<&str> = lines[lines.len() - MAX_EVENTS..].iter().map(String::as_str).collect();
    let mut content = keep.join("\n");
    content.push('\n');
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| crate::errors::ClawTownError::Io(e.error))?;
    Ok(())
}

fn read_all_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Read events, optionally filtered by `since` timestamp and/or `event_type`,
/// and capped at `limit` most-recent matches.
pub fn read_events(
    state_dir: &Path,
    since: Option<DateTime<Utc>>,
    event_type: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<Event>> {
    let path = crate::paths::events_file(state_dir);
    let lock_path = sibling_lock_path(&path);
    with_shared_lock(&lock_path, || {
        let lines = read_all_lines(&path)?;
        let mut events: Vec<Event> = lines
            .iter()
            .filter_map(|l| serde_json::from_str::<Event>(l).ok())
            .filter(|e| since.is_none_or(|s| e.ts >= s))
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .collect();
        if let Some(limit) = limit {
            if events.len() > limit {
                events = events.split_off(events.len() - limit);
            }
        }
        Ok(events)
    })
}

/// Return the most recent event of a given type, if any.
pub fn last_event_of_type(state_dir: &Path, event_type: &str) -> Result<Option<Event>> {
    let events = read_events(state_dir, None, Some(event_type), None)?;
    Ok(events.into_iter().next_back())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_and_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        log_event(dir.path(), EventType::TaskSync, "No changes", None).unwrap();
        log_event(dir.path(), EventType::NudgeOrch, "Orchestrator nudged (1/10)", None).unwrap();

        let events = read_events(dir.path(), None, None, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "task_sync");
        assert_eq!(events[1].event_type, "nudge_orch");
    }

    #[test]
    fn truncates_past_max_events() {
        let dir = TempDir::new().unwrap();
        for i in 0..(MAX_EVENTS + 10) {
            log_event(dir.path(), EventType::Learn, &format!("event {i}"), None).unwrap();
        }
        let events = read_events(dir.path(), None, None, None).unwrap();
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events.last().unwrap().summary, format!("event {}", MAX_EVENTS + 9));
    }

    #[test]
    fn last_event_of_type_filters() {
        let dir = TempDir::new().unwrap();
        log_event(dir.path(), EventType::NudgeOrch, "first", None).unwrap();
        log_event(dir.path(), EventType::TaskSync, "sync", None).unwrap();
        log_event(dir.path(), EventType::NudgeOrch, "second", None).unwrap();

        let last = last_event_of_type(dir.path(), "nudge_orch").unwrap().unwrap();
        assert_eq!(last.summary, "second");
    }
}
