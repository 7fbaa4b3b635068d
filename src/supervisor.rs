//! Supervisor Loop — the single cooperative loop that drives everything:
//! drains the broker, reconciles the task graph, classifies every pane,
//! nudges stalled agents, restarts dead ones, and runs the periodic
//! checkpoint/learn/sync hooks.
//!
//! The outer loop is a `tokio::select!` between a timer and incoming
//! events, with a `CancellationToken` for graceful shutdown. The tick
//! body itself is synchronous: pane capture, key sends, and file I/O
//! all go through blocking calls, dispatched through the
//! [`ProcessAdapter`] trait.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::ProjectConfig;
use crate::detector::{self, AgentStatus, OrchestratorStatus};
use crate::errors::Result;
use crate::event_log::{self, EventType};
use crate::process_adapter::ProcessAdapter;
use crate::{broker, registry, sync, task_graph};

const TICK_INTERVAL: Duration = Duration::from_secs(2);
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const MAX_NUDGES: u32 = 10;
const MAX_RESTARTS: u32 = 3;
const AGENT_MAX_NUDGES: u32 = 10;
const AGENT_MAX_RESTARTS: u32 = 3;

const STARTUP_GRACE_PERIOD: Duration = Duration::from_secs(300);
const STUCK_ORCH_ELAPSED_SECONDS: i64 = 180;
const DEAD_WINDOW_RESPAWN_COOLDOWN: Duration = Duration::from_secs(120);

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);
const LEARN_INTERVAL: Duration = Duration::from_secs(300);
const SYNC_INTERVAL: Duration = Duration::from_secs(30);

const ACTIVITY_LOG_MAX_LINES: usize = 1000;
const ACTIVITY_LOG_KEEP: usize = 500;

const DEFAULT_AI_CLI: &str = "claude";
const READINESS_MARKERS: &[&str] = &["\u{276f}", "bypass permissions", "Try \"edit"];

/// Windows the supervisor never nudges, restarts, or classifies as agents.
const INFRASTRUCTURE_WINDOWS: &[&str] = &["control", "zsh", "clone-ops", "dashboard"];

fn is_infrastructure_window(name: &str) -> bool {
    INFRASTRUCTURE_WINDOWS.contains(&name) || name.starts_with("init-")
}

const ERROR_PATTERNS: &[&str] = &["Traceback", "Exception:", "FAILED", "panic:", "error[E"];

const AGENT_NUDGE_BANK: &[&str] = &[
    "Checking in — what's your current status on this task?",
    "Still working? Reply with TASK_COMPLETE when done, or TASK_BLOCKED: <reason> if stuck.",
    "No activity detected for a while. Please post an update.",
];

const ORCHESTRATOR_NUDGE_MESSAGE: &str =
    "Status check: please report current progress, assign any unblocked tasks, and confirm you are not stuck.";

/// Per-agent nudge bookkeeping.
#[derive(Debug, Clone)]
pub struct AgentNudgeState {
    pub last_activity: DateTime<Utc>,
    pub last_nudge: Option<DateTime<Utc>>,
    pub nudge_count: u32,
}

impl AgentNudgeState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_activity: now,
            last_nudge: None,
            nudge_count: 0,
        }
    }
}

/// All in-memory supervisor bookkeeping for one run. Nothing
/// here is persisted except `learning_emitted_tasks`, which survives
/// dashboard restarts via `.claw_town/learning_processed.json`.
pub struct SupervisorState {
    pub last_activity_time: DateTime<Utc>,
    pub last_nudge_time: Option<DateTime<Utc>>,
    pub nudge_count: u32,
    pub restart_count: u32,
    pub agent_nudge_state: HashMap<String, AgentNudgeState>,
    pub agent_restart_count: HashMap<String, u32>,
    pub completed_agents: HashSet<String>,
    pub previous_task_statuses: HashMap<String, String>,
    pub previous_task_ids: HashSet<String>,
    pub learning_emitted_tasks: HashSet<String>,
    pub error_flagged_agents: HashSet<String>,
    pub dead_window_cooldowns: HashMap<String, DateTime<Utc>>,
    pub last_checkpoint: DateTime<Utc>,
    pub last_learn: DateTime<Utc>,
    pub last_sync: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub last_cursor_line: Option<String>,
    pub activity_log: Vec<String>,
}

impl SupervisorState {
    pub fn new(state_dir: &Path) -> Self {
        let now = Utc::now();
        Self {
            last_activity_time: now,
            last_nudge_time: None,
            nudge_count: 0,
            restart_count: 0,
            agent_nudge_state: HashMap::new(),
            agent_restart_count: HashMap::new(),
            completed_agents: HashSet::new(),
            previous_task_statuses: HashMap::new(),
            previous_task_ids: HashSet::new(),
            learning_emitted_tasks: load_learning_processed(state_dir),
            error_flagged_agents: HashSet::new(),
            dead_window_cooldowns: HashMap::new(),
            last_checkpoint: now,
            last_learn: now,
            last_sync: now,
            started_at: now,
            last_cursor_line: None,
            activity_log: Vec::new(),
        }
    }
}

fn load_learning_processed(state_dir: &Path) -> HashSet<String> {
    let path = crate::paths::learning_processed_file(state_dir);
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .map(|v| v.into_iter().collect())
        .unwrap_or_default()
}

fn save_learning_processed(state_dir: &Path, emitted: &HashSet<String>) -> Result<()> {
    let path = crate::paths::learning_processed_file(state_dir);
    let mut list: Vec<&String> = emitted.iter().collect();
    list.sort();
    crate::locking::atomic_write_json(&path, &list)
}

/// Context a tick needs beyond the mutable `SupervisorState`: where things
/// live, how to reach the terminal multiplexer, and the per-project
/// config's cadence override.
pub struct SupervisorContext<'a> {
    pub project_dir: &'a Path,
    pub state_dir: std::path::PathBuf,
    pub tasks_dir: std::path::PathBuf,
    pub session: String,
    pub adapter: &'a dyn ProcessAdapter,
    /// Seconds of pane inactivity before a nudge fires, and the cooldown
    /// between consecutive nudges to the same target — loaded from
    /// `config.json`'s `nudge_interval_seconds` (spec §6), applied to both
    /// the orchestrator and per-agent nudge cadence (spec §9's resolution
    /// treating the two as one setting).
    pub agent_nudge_interval: i64,
}

impl<'a> SupervisorContext<'a> {
    pub fn new(project_dir: &'a Path, session: &str, adapter: &'a dyn ProcessAdapter) -> Self {
        let state_dir = crate::paths::state_dir(project_dir);
        let config = ProjectConfig::load(&state_dir);
        Self {
            project_dir,
            tasks_dir: crate::paths::tasks_dir(project_dir),
            state_dir,
            session: session.to_string(),
            adapter,
            agent_nudge_interval: config.nudge_interval_seconds as i64,
        }
    }
}

fn log_activity(state: &mut SupervisorState, line: impl Into<String>) {
    state.activity_log.push(line.into());
}

/// Append the tick's activity-log lines to `activity_log.md`, compacting
/// the whole file once it grows past [`ACTIVITY_LOG_MAX_LINES`].
fn flush_activity_log(ctx: &SupervisorContext, state: &mut SupervisorState) -> Result<()> {
    if state.activity_log.is_empty() {
        return Ok(());
    }
    let path = crate::paths::activity_log_file(&ctx.state_dir);
    crate::paths::ensure_dir(&ctx.state_dir)?;
    let mut existing = std::fs::read_to_string(&path).unwrap_or_default();
    for line in state.activity_log.drain(..) {
        existing.push_str(&format!("- {} {}\n", Utc::now().format("%H:%M:%S"), line));
    }

    let line_count = existing.lines().count();
    if line_count > ACTIVITY_LOG_MAX_LINES {
        let lines: Vec<&str> = existing.lines().collect();
        let cut = lines.len() - ACTIVITY_LOG_KEEP;
        let summary = format!(
            "## Compacted summary\n{} earlier entries condensed on {}.\n\n",
            cut,
            Utc::now().to_rfc3339()
        );
        let kept = lines[cut..].join("\n");
        existing = format!("{summary}{kept}\n");
    }
    std::fs::write(&path, existing)?;
    Ok(())
}

/// Elapsed-seconds extraction from phrases like "42s", "3m 10s" appearing
/// near "thinking"/"background task" markers.
static ELAPSED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)m\s*(\d+)?s?|(\d+)s").unwrap());

fn extract_elapsed_seconds(text: &str) -> Option<i64> {
    let caps = ELAPSED_RE.captures(text)?;
    if let Some(minutes) = caps.get(1) {
        let m: i64 = minutes.as_str().parse().ok()?;
        let s: i64 = caps.get(2).and_then(|s| s.as_str().parse().ok()).unwrap_or(0);
        Some(m * 60 + s)
    } else {
        caps.get(3)?.as_str().parse().ok()
    }
}

/// One capture-and-classify result for a non-infrastructure window.
struct PaneSnapshot {
    window: String,
    output: String,
    status: AgentStatus,
    detail: String,
}

fn capture_and_classify(
    ctx: &SupervisorContext,
    state: &SupervisorState,
    window: &str,
) -> PaneSnapshot {
    let output = ctx.adapter.capture_pane(window, 200).unwrap_or_default();
    let (status, detail) = detector::detect_with_sticky(&output, window, &state.completed_agents);
    PaneSnapshot {
        window: window.to_string(),
        output,
        status,
        detail,
    }
}

/// Run one supervisor tick. Returns the set of window names
/// that were captured and classified this tick, mainly for tests.
pub fn tick(ctx: &SupervisorContext, state: &mut SupervisorState) -> Result<Vec<String>> {
    // 1. Drain broker (one message).
    let _ = broker::drain_tick(&ctx.state_dir, ctx.adapter);

    // 2. Load task graph.
    let graph = task_graph::load(&ctx.state_dir)?;
    let orchestrator_window = graph.root_task.as_ref().and_then(|root| {
        graph
            .known_tasks
            .get(root)
            .and_then(|t| t.agent_window.clone())
    });

    // 3. Capture panes for every non-infrastructure window.
    let windows = ctx.adapter.list_windows(&ctx.session).unwrap_or_default();
    let mut snapshots: HashMap<String, PaneSnapshot> = HashMap::new();
    for window in &windows {
        if is_infrastructure_window(window) {
            continue;
        }
        snapshots.insert(window.clone(), capture_and_classify(ctx, state, window));
    }

    let working_agent_names: Vec<String> = snapshots
        .values()
        .filter(|s| Some(&s.window) != orchestrator_window.as_ref() && s.status == AgentStatus::Working)
        .map(|s| s.window.clone())
        .collect();

    // 4. Completion / new-task events.
    handle_completion_and_new_tasks(ctx, state, &graph, &snapshots)?;

    // 5. Stuck-orchestrator heuristic.
    let orchestrator_output = orchestrator_window
        .as_ref()
        .and_then(|w| snapshots.get(w))
        .map(|s| s.output.as_str())
        .unwrap_or("");
    let since_startup = Utc::now().signed_duration_since(state.started_at).num_seconds().max(0) as u64;
    if since_startup >= STARTUP_GRACE_PERIOD.as_secs() {
        check_stuck_orchestrator(state, orchestrator_output);
    }

    // 6. User-input activity check.
    if let Some(window) = &orchestrator_window {
        check_user_input_activity(ctx, state, window);
    }

    // 7. Nudge pipeline.
    let orch_status = orchestrator_window.as_ref().map(|w| {
        detector::orchestrator_status(
            snapshots.get(w).map(|s| s.output.as_str()).unwrap_or(""),
            &working_agent_names,
            &[],
        )
    });
    nudge_all_stalled(ctx, state, orchestrator_window.as_deref(), orch_status.as_ref(), &snapshots)?;

    // 8. Health checks.
    check_agent_health(ctx, state, &graph, &snapshots)?;

    // 9. Periodic hooks.
    run_periodic_hooks(ctx, state)?;

    // 10. Activity log flush.
    flush_activity_log(ctx, state)?;

    Ok(windows)
}

fn handle_completion_and_new_tasks(
    ctx: &SupervisorContext,
    state: &mut SupervisorState,
    graph: &task_graph::TaskGraph,
    snapshots: &HashMap<String, PaneSnapshot>,
) -> Result<()> {
    for (t_number, entry) in &graph.known_tasks {
        if entry.status == "completed" && !state.learning_emitted_tasks.contains(t_number) {
            if let Some(orch) = graph.root_task.as_ref().and_then(|r| graph.known_tasks.get(r)) {
                if let Some(target) = &orch.agent_window {
                    broker::enqueue(
                        &ctx.state_dir,
                        target,
                        &format!("Task {t_number} completed. Review learnings and assign follow-ups if any."),
                        3,
                        "learning",
                        None,
                    )?;
                }
            }
            state.learning_emitted_tasks.insert(t_number.clone());
            log_activity(state, format!("learn event queued for {t_number}"));
        }
    }
    save_learning_processed(&ctx.state_dir, &state.learning_emitted_tasks)?;

    for (window, snapshot) in snapshots {
        if state.completed_agents.contains(window) {
            continue;
        }
        if detector::detect_agent_completion_signal(&snapshot.output) {
            broker::enqueue(
                &ctx.state_dir,
                window,
                "Acknowledged: task complete. Standing by for next assignment.",
                3,
                "completion",
                None,
            )?;
            state.completed_agents.insert(window.clone());
            log_activity(state, format!("{window} signaled completion"));
        }
    }

    let current_ids: HashSet<String> = graph.known_tasks.keys().cloned().collect();
    let new_ids: Vec<&String> = current_ids
        .difference(&state.previous_task_ids)
        .filter(|id| Some(id.as_str()) != graph.root_task.as_deref())
        .collect();
    if !new_ids.is_empty() {
        if let Some(orch) = graph.root_task.as_ref().and_then(|r| graph.known_tasks.get(r)) {
            if let Some(target) = &orch.agent_window {
                let list = new_ids.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
                broker::enqueue(
                    &ctx.state_dir,
                    target,
                    &format!("New tasks detected: {list}"),
                    3,
                    "new_task_detection",
                    None,
                )?;
            }
        }
        log_activity(state, format!("{} new task(s) detected", new_ids.len()));
    }
    state.previous_task_ids = current_ids;

    for (t_number, entry) in &graph.known_tasks {
        let prev = state.previous_task_statuses.get(t_number);
        if prev != Some(&entry.status) {
            state.previous_task_statuses.insert(t_number.clone(), entry.status.clone());
        }
    }

    Ok(())
}

fn check_stuck_orchestrator(state: &mut SupervisorState, output: &str) {
    let lower = output.to_lowercase();
    if !lower.contains("thinking") && !lower.contains("background task") {
        return;
    }
    if let Some(elapsed) = extract_elapsed_seconds(output) {
        if elapsed > STUCK_ORCH_ELAPSED_SECONDS {
            state.last_activity_time = Utc::now() - chrono::Duration::seconds(elapsed);
        }
    }
}

fn check_user_input_activity(ctx: &SupervisorContext, state: &mut SupervisorState, window: &str) {
    let Ok(output) = ctx.adapter.capture_pane(window, 1) else {
        return;
    };
    let cursor_line = output.lines().next_back().unwrap_or("").to_string();
    let changed = state.last_cursor_line.as_deref() != Some(cursor_line.as_str());
    let looks_like_active_prompt = cursor_line.contains('\u{276f}') && cursor_line.trim() != "\u{276f}";
    if changed || looks_like_active_prompt {
        state.last_activity_time = Utc::now();
    }
    state.last_cursor_line = Some(cursor_line);
}

fn idle_seconds(since: DateTime<Utc>) -> i64 {
    Utc::now().signed_duration_since(since).num_seconds().max(0)
}

fn nudge_all_stalled(
    ctx: &SupervisorContext,
    state: &mut SupervisorState,
    orchestrator_window: Option<&str>,
    orch_status: Option<&detector::OrchestratorStatusResult>,
    snapshots: &HashMap<String, PaneSnapshot>,
) -> Result<()> {
    if let Some(window) = orchestrator_window {
        if state.nudge_count >= MAX_NUDGES && state.restart_count < MAX_RESTARTS {
            restart_agent(ctx, state, window, true)?;
            return Ok(());
        }

        let waiting_for_human = orch_status.map(|s| s.status == OrchestratorStatus::WaitingForHuman).unwrap_or(false);
        let idle = idle_seconds(state.last_activity_time);
        if !waiting_for_human && idle >= ctx.agent_nudge_interval {
            broker::enqueue(&ctx.state_dir, window, ORCHESTRATOR_NUDGE_MESSAGE, 2, "nudge", None)?;
            state.nudge_count += 1;
            state.last_nudge_time = Some(Utc::now());
            event_log::log_event(
                &ctx.state_dir,
                EventType::NudgeOrch,
                &format!("Orchestrator nudged ({}/{MAX_NUDGES})", state.nudge_count),
                None,
            )?;
        }
    }

    for (window, snapshot) in snapshots {
        if Some(window.as_str()) == orchestrator_window {
            continue;
        }
        if state.completed_agents.contains(window) || snapshot.status == AgentStatus::Completed {
            continue;
        }
        let entry = state
            .agent_nudge_state
            .entry(window.clone())
            .or_insert_with(|| AgentNudgeState::fresh(Utc::now()));

        if snapshot.status == AgentStatus::Working {
            entry.last_activity = Utc::now();
            continue;
        }

        let restart_count = *state.agent_restart_count.get(window).unwrap_or(&0);
        if entry.nudge_count >= AGENT_MAX_NUDGES && restart_count < AGENT_MAX_RESTARTS {
            let window = window.clone();
            restart_agent(ctx, state, &window, false)?;
            continue;
        }

        let idle = idle_seconds(entry.last_activity);
        let cooldown_elapsed = entry
            .last_nudge
            .map(|t| idle_seconds(t) >= ctx.agent_nudge_interval)
            .unwrap_or(true);
        if idle >= ctx.agent_nudge_interval && cooldown_elapsed {
            let message = AGENT_NUDGE_BANK[(entry.nudge_count as usize) % AGENT_NUDGE_BANK.len()];
            broker::enqueue(&ctx.state_dir, window, message, 4, "nudge-agent", None)?;
            entry.nudge_count += 1;
            entry.last_nudge = Some(Utc::now());
            event_log::log_event(
                &ctx.state_dir,
                EventType::NudgeAgent,
                &format!("{window} nudged ({}/{AGENT_MAX_NUDGES})", entry.nudge_count),
                None,
            )?;
        }
    }

    Ok(())
}

fn check_agent_health(
    ctx: &SupervisorContext,
    state: &mut SupervisorState,
    graph: &task_graph::TaskGraph,
    snapshots: &HashMap<String, PaneSnapshot>,
) -> Result<()> {
    // Dead window detection for every in-progress task with an assigned window.
    for (t_number, entry) in &graph.known_tasks {
        if entry.status != "working" {
            continue;
        }
        let Some(window) = &entry.agent_window else { continue };
        let alive = ctx.adapter.window_exists(window).unwrap_or(false);
        if alive {
            continue;
        }
        let cooldown_ok = state
            .dead_window_cooldowns
            .get(window)
            .map(|last| idle_seconds(*last) as u64 >= DEAD_WINDOW_RESPAWN_COOLDOWN.as_secs())
            .unwrap_or(true);
        if !cooldown_ok {
            continue;
        }
        state.dead_window_cooldowns.insert(window.clone(), Utc::now());
        log_activity(state, format!("respawning dead window {window} for task {t_number}"));
        let working_dir = entry_working_dir(graph);
        let _ = registry::respawn(&ctx.state_dir, window, ctx.adapter, &ctx.session, &working_dir);
    }

    // Error recovery: scan for error patterns; enqueue once per agent until cleared.
    for (window, snapshot) in snapshots {
        let has_error = ERROR_PATTERNS.iter().any(|p| snapshot.output.contains(*p));
        if has_error {
            if !state.error_flagged_agents.contains(window) {
                broker::enqueue(
                    &ctx.state_dir,
                    window,
                    "An error/traceback was detected in your output. Please diagnose and report status.",
                    2,
                    "error-recovery",
                    None,
                )?;
                state.error_flagged_agents.insert(window.clone());
                log_activity(state, format!("error pattern detected in {window}"));
            }
        } else {
            state.error_flagged_agents.remove(window);
        }
    }

    // Implicit completion: completion-suggesting phrases + trailing prompt glyph, no explicit signal.
    const COMPLETION_HINTS: &[&str] = &["all done", "finished implementing", "completed the task", "ready for review"];
    for (window, snapshot) in snapshots {
        if state.completed_agents.contains(window) {
            continue;
        }
        let lower = snapshot.output.to_lowercase();
        let hinted = COMPLETION_HINTS.iter().any(|h| lower.contains(*h));
        let trailing_prompt = snapshot.output.trim_end().ends_with('\u{276f}');
        let explicit = detector::detect_agent_completion_signal(&snapshot.output);
        if hinted && trailing_prompt && !explicit {
            broker::enqueue(
                &ctx.state_dir,
                window,
                "It looks like you may be done. If so, reply with TASK_COMPLETE explicitly.",
                4,
                "implicit-completion",
                None,
            )?;
        }
    }

    Ok(())
}

fn entry_working_dir(graph: &task_graph::TaskGraph) -> String {
    graph.working_dir.clone().unwrap_or_else(|| ".".to_string())
}

fn run_periodic_hooks(ctx: &SupervisorContext, state: &mut SupervisorState) -> Result<()> {
    let now = Utc::now();
    if now.signed_duration_since(state.last_sync).num_seconds() as u64 >= SYNC_INTERVAL.as_secs() {
        let _ = sync::sync(ctx.project_dir);
        state.last_sync = now;
    }
    if now.signed_duration_since(state.last_checkpoint).num_seconds() as u64 >= CHECKPOINT_INTERVAL.as_secs() {
        log_activity(state, "checkpoint");
        state.last_checkpoint = now;
    }
    if now.signed_duration_since(state.last_learn).num_seconds() as u64 >= LEARN_INTERVAL.as_secs() {
        log_activity(state, "learn hook");
        state.last_learn = now;
    }
    Ok(())
}

/// Restart sequence: Ctrl-C x2, `/exit`, relaunch, readiness
/// poll, context-restoration message, counter bookkeeping, sticky
/// completion clearing.
fn restart_agent(
    ctx: &SupervisorContext,
    state: &mut SupervisorState,
    window: &str,
    is_orchestrator: bool,
) -> Result<()> {
    let _ = ctx.adapter.send_keys_raw(window, "C-c");
    std::thread::sleep(Duration::from_secs(2));
    let _ = ctx.adapter.send_keys_raw(window, "C-c");
    let _ = ctx.adapter.send_keys(window, "/exit");
    std::thread::sleep(Duration::from_secs(2));

    let graph = task_graph::load(&ctx.state_dir)?;
    let working_dir = entry_working_dir(&graph);
    let relaunch = format!("cd {working_dir} && {DEFAULT_AI_CLI}");
    let _ = ctx.adapter.send_keys(window, &relaunch);

    let ready = crate::process_adapter::wait_for_markers(
        ctx.adapter,
        window,
        READINESS_MARKERS,
        Duration::from_secs(30),
        Duration::from_millis(500),
    );

    let pending_summary = summarize_open_work(&graph);
    broker::enqueue(
        &ctx.state_dir,
        window,
        &format!("You were just restarted. Context restoration: {pending_summary}"),
        1,
        "restart-context",
        None,
    )?;

    if is_orchestrator {
        state.restart_count += 1;
        state.nudge_count = 0;
        state.last_nudge_time = None;
        event_log::log_event(
            &ctx.state_dir,
            EventType::RestartOrch,
            &format!("Orchestrator restarted ({}/{MAX_RESTARTS}), ready={ready}", state.restart_count),
            None,
        )?;
        if state.restart_count >= MAX_RESTARTS {
            event_log::log_event(&ctx.state_dir, EventType::AgentStall, "Orchestrator restart cap reached", None)?;
        }
    } else {
        let count = state.agent_restart_count.entry(window.to_string()).or_insert(0);
        *count += 1;
        let restart_count = *count;
        state.agent_nudge_state.insert(window.to_string(), AgentNudgeState::fresh(Utc::now()));
        state.completed_agents.remove(window);
        event_log::log_event(
            &ctx.state_dir,
            EventType::RestartAgent,
            &format!("{window} restarted ({restart_count}/{AGENT_MAX_RESTARTS}), ready={ready}"),
            None,
        )?;
        if restart_count >= AGENT_MAX_RESTARTS {
            event_log::log_event(&ctx.state_dir, EventType::AgentStall, &format!("{window} restart cap reached"), None)?;
        }
    }

    Ok(())
}

fn summarize_open_work(graph: &task_graph::TaskGraph) -> String {
    let open: Vec<&str> = graph
        .known_tasks
        .iter()
        .filter(|(_, e)| e.status == "working" || e.status == "pending")
        .map(|(t, _)| t.as_str())
        .collect();
    if open.is_empty() {
        "no open tasks tracked".to_string()
    } else {
        format!("open tasks: {}", open.join(", "))
    }
}

/// Run the supervisor loop until `SIGTERM`/`SIGHUP`/`SIGINT`. Each tick
/// runs to completion before the shutdown flag is checked, so a signal
/// never interrupts a tick partway through.
pub async fn run(project_dir: &Path, session: &str, adapter: &dyn ProcessAdapter) -> Result<()> {
    let state_dir = crate::paths::state_dir(project_dir);
    crate::paths::ensure_dir(&state_dir)?;
    let cleared = broker::clear_stale_state(&state_dir)?;
    if cleared > 0 {
        tracing::info!(cleared, "[STARTUP] Cleared stale messages");
    }

    let mut state = SupervisorState::new(&state_dir);
    let ctx = SupervisorContext::new(project_dir, session, adapter);
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(TICK_INTERVAL) => {
                if let Err(e) = tick(&ctx, &mut state) {
                    tracing::warn!(error = %e, "tick failed, continuing");
                }
            }
        }
    }

    signal_task.abort();
    log_activity(&mut state, "shutdown checkpoint");
    flush_activity_log(&ctx, &mut state)?;
    tracing::info!("supervisor loop shut down cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = hup.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_adapter::test_support::FakeAdapter;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FakeAdapter) {
        let dir = TempDir::new().unwrap();
        (dir, FakeAdapter::default())
    }

    #[test]
    fn tick_drains_broker_and_runs_without_windows() {
        let (dir, adapter) = setup();
        let ctx = SupervisorContext::new(dir.path(), "claw-town-demo", &adapter);
        let mut state = SupervisorState::new(&ctx.state_dir);
        let windows = tick(&ctx, &mut state).unwrap();
        assert!(windows.is_empty());
    }

    #[test]
    fn nudge_suppressed_when_orchestrator_waiting_for_human() {
        let (dir, adapter) = setup();
        let ctx = SupervisorContext::new(dir.path(), "claw-town-demo", &adapter);
        let mut state = SupervisorState::new(&ctx.state_dir);
        state.last_activity_time = Utc::now() - chrono::Duration::seconds(ctx.agent_nudge_interval + 10);

        let status = detector::OrchestratorStatusResult {
            status: OrchestratorStatus::WaitingForHuman,
            detail: "Needs your input".to_string(),
            waiting_on: Vec::new(),
        };
        nudge_all_stalled(&ctx, &mut state, Some("%1"), Some(&status), &HashMap::new()).unwrap();
        assert_eq!(state.nudge_count, 0);
    }

    #[test]
    fn agent_nudge_bank_rotates_by_count() {
        let mut entry = AgentNudgeState::fresh(Utc::now());
        entry.nudge_count = AGENT_NUDGE_BANK.len() as u32;
        let message = AGENT_NUDGE_BANK[(entry.nudge_count as usize) % AGENT_NUDGE_BANK.len()];
        assert_eq!(message, AGENT_NUDGE_BANK[0]);
    }

    #[test]
    fn extract_elapsed_seconds_parses_minutes_and_seconds() {
        assert_eq!(extract_elapsed_seconds("running for 3m 10s"), Some(190));
        assert_eq!(extract_elapsed_seconds("45s elapsed"), Some(45));
    }

    #[test]
    fn activity_log_compacts_past_threshold() {
        let (dir, adapter) = setup();
        let ctx = SupervisorContext::new(dir.path(), "claw-town-demo", &adapter);
        let mut state = SupervisorState::new(&ctx.state_dir);
        for i in 0..(ACTIVITY_LOG_MAX_LINES + 20) {
            log_activity(&mut state, format!("entry {i}"));
            flush_activity_log(&ctx, &mut state).unwrap();
        }
        let content = std::fs::read_to_string(crate::paths::activity_log_file(&ctx.state_dir)).unwrap();
        assert!(content.lines().count() <= ACTIVITY_LOG_KEEP + 5);
    }
}
