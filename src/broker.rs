//! Message Broker — the priority outbox that delivers messages to agent
//! panes at least once.
//!
//! Messages are filesystem-backed JSON files partitioned across
//! `pending/`, `sent/`, and `expired/` directories. The filename itself
//! is the sort key: `<priority>_<YYYYMMDD>_<HHMMSS>_<micros>_<source>.json`,
//! so lexicographic directory listing already yields delivery order. A
//! single global `.lock` file (with staleness override) serializes
//! drivers so only one message is ever mid-delivery at a time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::locking::atomic_write_json;
use crate::process_adapter::ProcessAdapter;

/// Messages older than this (by `queued_at`) are swept to `expired/`
/// regardless of delivery attempts.
pub const TTL: Duration = Duration::from_secs(300);
/// A broker `.lock` file older than this is considered abandoned and
/// removed rather than honored.
pub const LOCK_STALENESS: Duration = Duration::from_secs(10);
/// How many times `send_atomic` retries waiting for an idle cursor line
/// before proceeding anyway.
const IDLE_WAIT_RETRIES: u32 = 5;
const IDLE_WAIT_SPACING: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub target: String,
    pub content: String,
    pub priority: u8,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
}

fn pending_dir(state_dir: &Path) -> PathBuf {
    crate::paths::outbox_dir(state_dir).join("pending")
}
fn sent_dir(state_dir: &Path) -> PathBuf {
    crate::paths::outbox_dir(state_dir).join("sent")
}
fn expired_dir(state_dir: &Path) -> PathBuf {
    crate::paths::outbox_dir(state_dir).join("expired")
}
fn lock_path(state_dir: &Path) -> PathBuf {
    crate::paths::outbox_dir(state_dir).join(".lock")
}
fn inbox_pending_dir(state_dir: &Path) -> PathBuf {
    crate::paths::inbox_dir(state_dir).join("pending")
}
fn inbox_processed_dir(state_dir: &Path) -> PathBuf {
    crate::paths::inbox_dir(state_dir).join("processed")
}

/// Compose the sortable filename grammar: priority digit, then
/// zero-padded date/time/microsecond components, then source.
fn message_filename(priority: u8, queued_at: DateTime<Utc>, source: &str) -> String {
    format!(
        "{}_{}_{}.json",
        priority,
        queued_at.format("%Y%m%d_%H%M%S_%6f"),
        source
    )
}

/// Enqueue a message for delivery. Writes are atomic (tempfile + rename)
/// so a concurrent drain never observes a half-written file.
pub fn enqueue(
    state_dir: &Path,
    target: &str,
    content: &str,
    priority: u8,
    source: &str,
    target_agent: Option<&str>,
) -> Result<PathBuf> {
    let dir = pending_dir(state_dir);
    crate::paths::ensure_dir(&dir)?;
    let now = Utc::now();
    let message = OutboxMessage {
        target: target.to_string(),
        content: content.to_string(),
        priority,
        source: source.to_string(),
        timestamp: now,
        queued_at: now,
        target_agent: target_agent.map(str::to_string),
    };
    let path = dir.join(message_filename(priority, now, source));
    atomic_write_json(&path, &message)?;
    Ok(path)
}

/// Sidecar ack record, keyed by the message's original filename in the
/// caller's aggregate store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRecord {
    pub filename: String,
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

fn acks_file(state_dir: &Path) -> PathBuf {
    crate::paths::outbox_dir(state_dir).join("acks.json")
}

fn load_acks(state_dir: &Path) -> Vec<AckRecord> {
    std::fs::read_to_string(acks_file(state_dir))
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn record_ack(state_dir: &Path, ack: AckRecord) -> Result<()> {
    let mut acks = load_acks(state_dir);
    acks.push(ack);
    // Bound the sidecar store the same way the event log bounds itself.
    if acks.len() > 2000 {
        let start = acks.len() - 2000;
        acks.drain(0..start);
    }
    atomic_write_json(&acks_file(state_dir), &acks)
}

/// Aggregate delivery stats.
#[derive(Debug, Clone, Serialize, Default)]
pub struct BrokerStats {
    pub total_delivered: usize,
    pub total_failed: usize,
    pub avg_latency_ms: f64,
    pub recent: Vec<AckRecord>,
}

pub fn stats(state_dir: &Path) -> BrokerStats {
    let acks = load_acks(state_dir);
    let delivered: Vec<&AckRecord> = acks.iter().filter(|a| a.delivered).collect();
    let total_delivered = delivered.len();
    let total_failed = acks.len() - total_delivered;
    let avg_latency_ms = if delivered.is_empty() {
        0.0
    } else {
        delivered.iter().filter_map(|a| a.latency_ms).sum::<i64>() as f64 / delivered.len() as f64
    };
    let recent = acks.iter().rev().take(20).cloned().collect();
    BrokerStats {
        total_delivered,
        total_failed,
        avg_latency_ms,
        recent,
    }
}

/// Replace smart quotes and em/en dashes with ASCII equivalents before
/// pasting into a pane.
pub fn sanitize_content(content: &str) -> String {
    content
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2014}', '\u{2013}'], "-")
}

/// Cursor-line shapes that count as "idle".
fn is_idle_cursor_line(line: &str) -> bool {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return true;
    }
    const BARE_PROMPTS: &[&str] = &[">", "$", "%", "❯", "> "];
    BARE_PROMPTS.contains(&trimmed)
        || trimmed.ends_with('$')
        || trimmed.ends_with('%')
        || trimmed.ends_with('>')
}

/// Wait for `target` to show an idle cursor line, retrying up to
/// [`IDLE_WAIT_RETRIES`] times, then proceed regardless.
fn wait_for_idle(adapter: &dyn ProcessAdapter, target: &str) {
    for _ in 0..IDLE_WAIT_RETRIES {
        if let Ok(output) = adapter.capture_pane(target, 1) {
            if output.lines().last().is_none_or(is_idle_cursor_line) {
                return;
            }
        }
        std::thread::sleep(IDLE_WAIT_SPACING);
    }
}

/// Deliver `content` to `target` via the buffer-paste cycle: wait for an
/// idle prompt, then hand off to the adapter's `send_buffered`, which
/// allocates a fresh UUID-derived buffer name, loads it from a tempfile,
/// pastes into `target`, sends Enter, and cleans up the buffer and
/// tempfile. Returns whether delivery succeeded.
pub fn send_atomic(adapter: &dyn ProcessAdapter, target: &str, content: &str) -> bool {
    let sanitized = sanitize_content(content);
    wait_for_idle(adapter, target);
    adapter.send_buffered(target, &sanitized).is_ok()
}

fn read_message(path: &Path) -> Option<OutboxMessage> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

fn pending_files_sorted(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    // Filename grammar is the sort key: priority, then
    // timestamp, then source — lexicographic == delivery order.
    files.sort();
    files
}

fn move_to(path: &Path, dest_dir: &Path) -> Result<()> {
    crate::paths::ensure_dir(dest_dir)?;
    let Some(name) = path.file_name() else {
        return Ok(());
    };
    std::fs::rename(path, dest_dir.join(name))?;
    Ok(())
}

/// Run one drain tick: TTL-sweep expired messages, then attempt delivery
/// of at most one pending message. Safe to call even when
/// `pending/` doesn't exist yet.
pub fn drain_tick(state_dir: &Path, adapter: &dyn ProcessAdapter) -> Result<()> {
    let pending = pending_dir(state_dir);
    crate::paths::ensure_dir(&pending)?;
    let lock = lock_path(state_dir);
    acquire_lock_with_staleness_override(&lock)?;
    let result = drain_tick_locked(state_dir, &pending, adapter);
    let _ = std::fs::remove_file(&lock);
    result
}

fn acquire_lock_with_staleness_override(lock: &Path) -> Result<()> {
    if let Ok(metadata) = std::fs::metadata(lock) {
        if let Some(age) = metadata.modified().ok().and_then(|m| m.elapsed().ok()) {
            if age >= LOCK_STALENESS {
                tracing::warn!(?lock, "stale broker lock, removing");
                let _ = std::fs::remove_file(lock);
            }
        }
    }
    std::fs::write(lock, std::process::id().to_string())?;
    Ok(())
}

fn drain_tick_locked(state_dir: &Path, pending: &Path, adapter: &dyn ProcessAdapter) -> Result<()> {
    let now = Utc::now();
    let mut delivered_one = false;
    for path in pending_files_sorted(pending) {
        let Some(message) = read_message(&path) else {
            tracing::error!(?path, "corrupted outbox message");
            move_to(&path, &expired_dir(state_dir))?;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                record_ack(
                    state_dir,
                    AckRecord {
                        filename: name.to_string(),
                        delivered: false,
                        latency_ms: None,
                        reason: Some("corrupted_message".to_string()),
                        recorded_at: now,
                    },
                )?;
            }
            continue;
        };

        let age = now.signed_duration_since(message.queued_at);
        if age.num_seconds() as u64 > TTL.as_secs() {
            move_to(&path, &expired_dir(state_dir))?;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                record_ack(
                    state_dir,
                    AckRecord {
                        filename: name.to_string(),
                        delivered: false,
                        latency_ms: None,
                        reason: Some(format!("expired_after_{}s", age.num_seconds())),
                        recorded_at: now,
                    },
                )?;
            }
            continue;
        }

        if delivered_one {
            continue;
        }
        // Process at most one message per tick.
        delivered_one = true;
        let delivered = send_atomic(adapter, &message.target, &message.content);
        if delivered {
            move_to(&path, &sent_dir(state_dir))?;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                record_ack(
                    state_dir,
                    AckRecord {
                        filename: name.to_string(),
                        delivered: true,
                        latency_ms: Some(now.signed_duration_since(message.queued_at).num_milliseconds()),
                        reason: None,
                        recorded_at: now,
                    },
                )?;
            }
        }
        // Delivery failure leaves the file in pending/ for the next tick;
        // TTL eventually expires it.
    }
    Ok(())
}

/// Startup hygiene: clear stale outbox/inbox state left over from a prior
/// run. Returns the number of messages moved.
pub fn clear_stale_state(state_dir: &Path) -> Result<usize> {
    let pending = pending_dir(state_dir);
    crate::paths::ensure_dir(&pending)?;
    let expired = expired_dir(state_dir);
    let mut moved = 0usize;
    for path in pending_files_sorted(&pending) {
        move_to(&path, &expired)?;
        moved += 1;
    }

    let inbox_pending = inbox_pending_dir(state_dir);
    crate::paths::ensure_dir(&inbox_pending)?;
    let inbox_processed = inbox_processed_dir(state_dir);
    if let Ok(entries) = std::fs::read_dir(&inbox_pending) {
        for entry in entries.filter_map(|e| e.ok()) {
            move_to(&entry.path(), &inbox_processed)?;
            moved += 1;
        }
    }

    let lock = lock_path(state_dir);
    let _ = std::fs::remove_file(&lock);

    if moved > 0 {
        tracing::info!(moved, "[STARTUP] Cleared stale messages");
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_adapter::test_support::FakeAdapter;
    use tempfile::TempDir;

    #[test]
    fn filename_grammar_sorts_by_priority_then_time_then_source() {
        let dir = TempDir::new().unwrap();
        let t = Utc::now();
        enqueue(dir.path(), "%1", "c", 1, "human", None).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        enqueue(dir.path(), "%1", "a", 2, "nudge", None).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        enqueue(dir.path(), "%1", "b", 4, "nudge-agent", None).unwrap();
        let _ = t;

        let files = pending_files_sorted(&pending_dir(dir.path()));
        let messages: Vec<OutboxMessage> = files.iter().map(|p| read_message(p).unwrap()).collect();
        assert_eq!(messages[0].source, "human");
        assert_eq!(messages[1].source, "nudge");
        assert_eq!(messages[2].source, "nudge-agent");
    }

    #[test]
    fn drain_tick_delivers_one_message_at_a_time() {
        let dir = TempDir::new().unwrap();
        let adapter = FakeAdapter::default();
        adapter.panes.borrow_mut().insert("%1".to_string(), "❯".to_string());
        enqueue(dir.path(), "%1", "first", 3, "test", None).unwrap();
        enqueue(dir.path(), "%1", "second", 3, "test", None).unwrap();

        drain_tick(dir.path(), &adapter).unwrap();
        assert_eq!(pending_files_sorted(&pending_dir(dir.path())).len(), 1);
        assert_eq!(pending_files_sorted(&sent_dir(dir.path())).len(), 1);

        drain_tick(dir.path(), &adapter).unwrap();
        assert_eq!(pending_files_sorted(&pending_dir(dir.path())).len(), 0);
        assert_eq!(pending_files_sorted(&sent_dir(dir.path())).len(), 2);
    }

    #[test]
    fn ttl_expires_old_messages_with_failure_ack() {
        let dir = TempDir::new().unwrap();
        let adapter = FakeAdapter::default();
        let path = enqueue(dir.path(), "%1", "stale", 2, "test", None).unwrap();
        let mut message = read_message(&path).unwrap();
        message.queued_at = Utc::now() - chrono::Duration::seconds(301);
        atomic_write_json(&path, &message).unwrap();

        drain_tick(dir.path(), &adapter).unwrap();
        assert_eq!(pending_files_sorted(&pending_dir(dir.path())).len(), 0);
        assert_eq!(pending_files_sorted(&expired_dir(dir.path())).len(), 1);

        let acks = load_acks(dir.path());
        assert_eq!(acks.len(), 1);
        assert!(!acks[0].delivered);
        assert!(acks[0].reason.as_deref().unwrap().starts_with("expired_after_"));
    }

    #[test]
    fn malformed_message_is_expired_immediately() {
        let dir = TempDir::new().unwrap();
        let adapter = FakeAdapter::default();
        let pending = pending_dir(dir.path());
        std::fs::create_dir_all(&pending).unwrap();
        std::fs::write(pending.join("1_20260101_000000_000000_test.json"), "not json").unwrap();

        drain_tick(dir.path(), &adapter).unwrap();
        assert_eq!(pending_files_sorted(&pending_dir(dir.path())).len(), 0);
        assert_eq!(pending_files_sorted(&expired_dir(dir.path())).len(), 1);
    }

    #[test]
    fn clear_stale_state_empties_pending_directories() {
        let dir = TempDir::new().unwrap();
        enqueue(dir.path(), "%1", "leftover", 3, "test", None).unwrap();
        let moved = clear_stale_state(dir.path()).unwrap();
        assert_eq!(moved, 1);
        assert_eq!(pending_files_sorted(&pending_dir(dir.path())).len(), 0);
        assert_eq!(pending_files_sorted(&expired_dir(dir.path())).len(), 1);
    }
}
