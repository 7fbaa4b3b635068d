//! Agent Detector — pure classification of pane output into agent and
//! orchestrator status.
//!
//! A fixed, ordered rule list where earlier rules win. No I/O, no
//! state — every function here takes a string and returns a
//! classification.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

/// Per-agent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Completed,
    NeedsInput,
    NeedsHuman,
    NeedsOrchestrator,
    NeedsAgent,
    Sleeping,
    Working,
    Unknown,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Completed => "completed",
            AgentStatus::NeedsInput => "needs_input",
            AgentStatus::NeedsHuman => "needs_human",
            AgentStatus::NeedsOrchestrator => "needs_orchestrator",
            AgentStatus::NeedsAgent => "needs_agent",
            AgentStatus::Sleeping => "sleeping",
            AgentStatus::Working => "working",
            AgentStatus::Unknown => "unknown",
        }
    }
}

const BUSY_PATTERNS: &[&str] = &[
    "esc to interrupt",
    "press esc to interrupt",
    "✻",
    "⠋",
    "⠙",
    "⠹",
    "⠸",
    "thinking...",
    "running:",
];

/// Classify one pane's output. Returns `(status, detail)`. `detail`
/// explains who input is needed from, or a short reason for a block.
///
/// Rule order is the contract: completion/blocked signals,
/// then human prompts, then orchestrator waits, then sleep/polling, then
/// daemon markers, then busy indicators, then a bare idle prompt glyph,
/// then the default.
pub fn detect(pane_output: &str) -> (AgentStatus, String) {
    if pane_output.is_empty() {
        return (AgentStatus::Unknown, String::new());
    }

    let lower_output = pane_output.to_lowercase();
    let recent: &str = tail_chars(pane_output, 800);
    let recent_lower = recent.to_lowercase();

    if ["task_complete", "task complete", "taskcomplete"]
        .iter()
        .any(|s| recent_lower.contains(s))
    {
        return (AgentStatus::Completed, "completed".to_string());
    }
    if recent.contains("TASK_BLOCKED") {
        static BLOCKED_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"TASK_BLOCKED:\s*(.+?)(?:\n|$)").unwrap());
        let reason = BLOCKED_RE
            .captures(recent)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim())
            .map(|s| s.chars().take(30).collect::<String>())
            .unwrap_or_else(|| "blocked".to_string());
        return (AgentStatus::NeedsAgent, reason);
    }

    let human_patterns: &[(&str, &str)] = &[
        ("1.", "choose option"),
        ("2.", "choose option"),
        ("(y/n)", "confirm"),
        ("[y/N]", "confirm"),
        ("[Y/n]", "confirm"),
        ("Which", "question"),
        ("What would you like", "question"),
        ("Please select", "choose"),
        ("Choose", "choose"),
        ("Enter your", "input needed"),
        ("Type your", "input needed"),
        ("?", "question"),
    ];
    let recent_200 = tail_chars(recent, 200);
    for (pattern, detail) in human_patterns {
        if recent_200.contains(pattern) {
            return (AgentStatus::NeedsHuman, detail.to_string());
        }
    }

    let orchestrator_patterns: &[(&str, &str)] = &[
        ("waiting for task", "next task"),
        ("waiting for assignment", "assignment"),
        ("ready for next", "next task"),
        ("what should i", "direction"),
        ("awaiting instructions", "instructions"),
        ("task_needs_clarification", "clarification"),
    ];
    for (pattern, detail) in orchestrator_patterns {
        if lower_output.contains(pattern) {
            return (AgentStatus::NeedsOrchestrator, detail.to_string());
        }
    }

    let sleep_patterns: &[(&str, &str)] = &[
        ("sleeping", "polling"),
        ("waiting for", "waiting"),
        ("polling", "polling"),
        ("watching", "monitoring"),
        ("monitoring", "monitoring"),
    ];
    let lower_300 = tail_chars(&lower_output, 300);
    for (pattern, detail) in sleep_patterns {
        if lower_300.contains(pattern) {
            return (AgentStatus::Sleeping, detail.to_string());
        }
    }

    if lower_output.contains("inbox") || lower_output.contains("status watcher") {
        return (AgentStatus::Sleeping, "daemon".to_string());
    }

    for pattern in BUSY_PATTERNS {
        if lower_output.contains(pattern) {
            return (AgentStatus::Working, String::new());
        }
    }

    if tail_chars(recent, 100).contains('❯') {
        return (AgentStatus::NeedsOrchestrator, "idle".to_string());
    }

    (AgentStatus::NeedsInput, String::new())
}

/// Sticky-completion override: once
/// a window name is in the supervisor's completed set, every subsequent
/// call returns `completed` regardless of buffer content, until the
/// caller clears the entry on restart.
pub fn detect_with_sticky(
    pane_output: &str,
    window_name: &str,
    completed_agents: &HashSet<String>,
) -> (AgentStatus, String) {
    if completed_agents.contains(window_name) {
        return (AgentStatus::Completed, "completed".to_string());
    }
    detect(pane_output)
}

/// Explicit input-prompt detector, distinct from (and stricter than) the
/// per-agent classifier's `NeedsHuman` rule: used to gate
/// `waiting_for_human` so it is only asserted when a prompt is actively
/// visible, never merely because nothing else fired.
pub fn detect_human_input_prompt(pane_output: &str) -> bool {
    if pane_output.is_empty() {
        return false;
    }
    let recent = tail_chars(pane_output, 3000);
    let lines: Vec<&str> = recent.trim().split('\n').collect();
    let last_line = lines.last().copied().unwrap_or("").trim();

    let has_numbered_options = recent.contains("1.") && recent.contains("2.");
    let last_ten = &lines[lines.len().saturating_sub(10)..];
    let has_prompt = last_ten
        .iter()
        .any(|l| l.trim() == "❯" || l.trim().ends_with('❯'));

    if has_numbered_options && has_prompt {
        return true;
    }

    if last_line == "❯" || last_line.ends_with('❯') {
        let very_recent = tail_chars(&recent, 200);
        if !["⠋", "⠙", "⠹", "⠸"].iter().any(|s| very_recent.contains(s)) {
            return true;
        }
    }

    if has_numbered_options {
        return true;
    }

    let explicit_prompts = [
        "what would you like",
        "please select",
        "choose an option",
        "enter your",
        "type your",
        "(y/n)",
        "[y/n]",
        "press enter",
        "confirm?",
        "proceed?",
    ];
    let recent_lower = recent.to_lowercase();
    explicit_prompts.iter().any(|p| recent_lower.contains(p))
}

/// Orchestrator-level status: cross-
/// references busy indicators, live worker agents, and sub-orchestrators
/// with the same-priority rules as `get_orchestrator_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorStatus {
    Working,
    WaitingForHuman,
    WaitingForAgent,
    WaitingForSubOrch,
    Idle,
    Unknown,
}

impl OrchestratorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrchestratorStatus::Working => "working",
            OrchestratorStatus::WaitingForHuman => "waiting_for_human",
            OrchestratorStatus::WaitingForAgent => "waiting_for_agent",
            OrchestratorStatus::WaitingForSubOrch => "waiting_for_sub_orch",
            OrchestratorStatus::Idle => "idle",
            OrchestratorStatus::Unknown => "unknown",
        }
    }
}

pub struct OrchestratorStatusResult {
    pub status: OrchestratorStatus,
    pub detail: String,
    pub waiting_on: Vec<String>,
}

/// Determine orchestrator status from its own pane output plus the names
/// of currently-working agents and sub-orchestrators (computed by the
/// caller via [`detect`] on each of their panes). This function itself
/// does no pane capture — that is the Process Adapter's job.
pub fn orchestrator_status(
    output: &str,
    working_agent_names: &[String],
    working_sub_orch_ids: &[String],
) -> OrchestratorStatusResult {
    if output.is_empty() {
        return OrchestratorStatusResult {
            status: OrchestratorStatus::Unknown,
            detail: "Cannot read pane".to_string(),
            waiting_on: Vec::new(),
        };
    }

    let lower_output = output.to_lowercase();
    for pattern in BUSY_PATTERNS {
        if lower_output.contains(pattern) {
            return OrchestratorStatusResult {
                status: OrchestratorStatus::Working,
                detail: "Processing...".to_string(),
                waiting_on: Vec::new(),
            };
        }
    }

    if !working_sub_orch_ids.is_empty() {
        let mut detail = format!("Sub-orch: {}", working_sub_orch_ids[..working_sub_orch_ids.len().min(2)].join(", "));
        if working_sub_orch_ids.len() > 2 {
            detail.push_str(&format!(" +{}", working_sub_orch_ids.len() - 2));
        }
        return OrchestratorStatusResult {
            status: OrchestratorStatus::WaitingForSubOrch,
            detail,
            waiting_on: working_sub_orch_ids.to_vec(),
        };
    }

    if !working_agent_names.is_empty() {
        let mut detail = format!("Agents: {}", working_agent_names[..working_agent_names.len().min(2)].join(", "));
        if working_agent_names.len() > 2 {
            detail.push_str(&format!(" +{}", working_agent_names.len() - 2));
        }
        return OrchestratorStatusResult {
            status: OrchestratorStatus::WaitingForAgent,
            detail,
            waiting_on: working_agent_names.to_vec(),
        };
    }

    if detect_human_input_prompt(output) {
        return OrchestratorStatusResult {
            status: OrchestratorStatus::WaitingForHuman,
            detail: "Needs your input".to_string(),
            waiting_on: Vec::new(),
        };
    }

    let (is_waiting, entities) = detect_waiting_context(output);
    if is_waiting {
        let detail = if entities.is_empty() {
            "Waiting on work".to_string()
        } else {
            format!("Waiting: {}", entities[..entities.len().min(2)].join(", "))
        };
        return OrchestratorStatusResult {
            status: OrchestratorStatus::WaitingForAgent,
            detail,
            waiting_on: entities,
        };
    }

    OrchestratorStatusResult {
        status: OrchestratorStatus::Idle,
        detail: "Idle".to_string(),
        waiting_on: Vec::new(),
    }
}

/// Detect "waiting for agent(s)/sub-orchestrator" mentions in output.
/// Returns `(is_waiting, entity_names)`.
pub fn detect_waiting_context(pane_output: &str) -> (bool, Vec<String>) {
    if pane_output.is_empty() {
        return (false, Vec::new());
    }

    static WAITING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
        [
            r"waiting (?:for|on) (?:agent|agents)",
            r"spawned (?:agent|agents)",
            r"sub-orchestrator",
            r"agent \w+ is working",
            r"agents? running",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    static ENTITY_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?:agent|sub-orchestrator)[:\s]+(\S+)").unwrap());

    let lower = pane_output.to_lowercase();
    for pattern in WAITING_PATTERNS.iter() {
        if pattern.is_match(&lower) {
            let entities = ENTITY_RE
                .captures(pane_output)
                .and_then(|c| c.get(1))
                .map(|m| vec![m.as_str().trim_end_matches(',').to_string()])
                .unwrap_or_default();
            return (true, entities);
        }
    }
    (false, Vec::new())
}

/// Detect a bare `TASK_COMPLETE` signal (case-insensitive) anywhere in
/// the given slice of output — used by the broker/supervisor as a
/// lighter-weight check distinct from the full `detect` classification.
pub fn detect_agent_completion_signal(last_output: &str) -> bool {
    let lower = last_output.to_lowercase();
    ["task_complete", "task complete", "taskcomplete"]
        .iter()
        .any(|s| lower.contains(s))
}

static DURATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+[hms]\s*\d*[ms]?\s*\d*[s]?").unwrap());
static TOKENS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[↓↑]\s*[\d.]+k?\s*tokens?").unwrap());
static IN_OUT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"in:\d+k?\s*out:\d+k?").unwrap());
static CTX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"ctx:\d+%").unwrap());
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+%").unwrap());
static THINKING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)thinking").unwrap());
static AUTO_COMPACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Context left until auto-compact:\s*\d+%").unwrap());
static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"sz:\d+k?").unwrap());

/// Strip dynamic tokens (durations, token counts, context percentages,
/// spinner glyphs, size indicators) before comparing two ticks' output
/// for "did anything actually change".
pub fn normalize_output_for_comparison(output: &str) -> String {
    let mut normalized = output.to_string();
    normalized = DURATION_RE.replace_all(&normalized, "").into_owned();
    normalized = TOKENS_RE.replace_all(&normalized, "").into_owned();
    normalized = IN_OUT_RE.replace_all(&normalized, "").into_owned();
    normalized = CTX_RE.replace_all(&normalized, "").into_owned();
    normalized = PERCENT_RE.replace_all(&normalized, "").into_owned();
    normalized = THINKING_RE.replace_all(&normalized, "").into_owned();
    normalized = normalized.replace('✻', "");
    normalized = AUTO_COMPACT_RE.replace_all(&normalized, "").into_owned();
    normalized = SIZE_RE.replace_all(&normalized, "").into_owned();
    normalized
}

/// Return the last `n` *characters* (not bytes) of `s`.
fn tail_chars(s: &str, n: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= n {
        return s;
    }
    let skip = char_count - n;
    let byte_offset = s
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    &s[byte_offset..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_signal_in_recent_output_wins() {
        let output = format!("{}\nTask complete.", "x".repeat(900));
        let (status, detail) = detect(&output);
        assert_eq!(status, AgentStatus::Completed);
        assert_eq!(detail, "completed");
    }

    #[test]
    fn blocked_signal_extracts_reason_truncated_to_30_chars() {
        let output = "TASK_BLOCKED: waiting on a very long dependency chain that exceeds thirty characters\n";
        let (status, detail) = detect(output);
        assert_eq!(status, AgentStatus::NeedsAgent);
        assert_eq!(detail.chars().count(), 30);
    }

    #[test]
    fn sticky_completion_overrides_buffer_content() {
        let mut completed = HashSet::new();
        completed.insert("agent-a".to_string());
        let (status, _) = detect_with_sticky("anything at all", "agent-a", &completed);
        assert_eq!(status, AgentStatus::Completed);
    }

    #[test]
    fn bare_prompt_glyph_defaults_to_idle_orchestrator_need() {
        let output = "some prior output\n❯";
        let (status, detail) = detect(output);
        assert_eq!(status, AgentStatus::NeedsOrchestrator);
        assert_eq!(detail, "idle");
    }

    #[test]
    fn human_prompt_with_options_and_bare_glyph_is_detected() {
        let output = "1. Option A\n2. Option B\n❯";
        assert!(detect_human_input_prompt(output));
    }

    #[test]
    fn normalization_strips_token_counts_and_spinners() {
        let output = "✻ Thinking… ↓ 1.6k tokens ctx:31%";
        let normalized = normalize_output_for_comparison(output);
        assert!(!normalized.contains("tokens"));
        assert!(!normalized.contains('✻'));
        assert!(!normalized.to_lowercase().contains("thinking"));
    }
}
