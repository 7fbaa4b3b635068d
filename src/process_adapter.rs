//! Process Adapter — the one seam between the supervisor core and the
//! terminal multiplexer.
//!
//! Generalizes `tmux.rs::TmuxController` behind a trait so the Supervisor
//! Loop, Message Broker, and Agent Registry can be tested against a fake
//! instead of a real tmux session.

use std::io::Write;
use std::process::Command;
use std::time::Duration;

use crate::errors::{ClawTownError, Result};

/// Allowed environment variable names for spawned agent sessions
/// (security allowlist — prevents shell injection via arbitrary var names).
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "CLAW_TOWN_TASK_ID",
    "CLAW_TOWN_ROLE",
    "CLAW_TOWN_WORKER_INDEX",
];

fn is_allowed_env_var(name: &str) -> bool {
    ALLOWED_ENV_VARS.contains(&name)
}

/// Capability set the supervisor core needs from a terminal multiplexer.
/// One adapter implements this against a real `tmux`; tests can provide a
/// fake. No suspension point here may block indefinitely — every
/// implementation bounds wall time.
pub trait ProcessAdapter {
    /// List all known window/pane targets in the session.
    fn list_windows(&self, session: &str) -> Result<Vec<String>>;
    /// Capture the last `lines` lines of a pane's content.
    fn capture_pane(&self, target: &str, lines: usize) -> Result<String>;
    /// Send keys to a pane, followed by Enter.
    fn send_keys(&self, target: &str, keys: &str) -> Result<()>;
    /// Send keys to a pane without a trailing Enter.
    fn send_keys_raw(&self, target: &str, keys: &str) -> Result<()>;
    /// Send multi-line content via a load-buffer/paste-buffer cycle.
    fn send_buffered(&self, target: &str, content: &str) -> Result<()>;
    /// Kill a window/pane.
    fn kill_window(&self, target: &str) -> Result<()>;
    /// The OS pid of the process currently occupying the pane, if known.
    fn pane_pid(&self, target: &str) -> Result<Option<u32>>;
    /// Whether the target window/pane currently exists.
    fn window_exists(&self, target: &str) -> Result<bool>;
    /// Split a new pane off `session`, `cwd`-rooted, with validated env vars.
    fn split_pane(
        &self,
        session: &str,
        horizontal: bool,
        cwd: &str,
        env_vars: &[(&str, &str)],
    ) -> Result<String>;
}

/// Real adapter shelling out to the `tmux` CLI.
pub struct TmuxAdapter;

impl TmuxAdapter {
    fn run(args: &[&str]) -> Result<std::process::Output> {
        Command::new("tmux")
            .args(args)
            .output()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("tmux {args:?} failed to spawn: {e}")))
    }
}

impl ProcessAdapter for TmuxAdapter {
    fn list_windows(&self, session: &str) -> Result<Vec<String>> {
        let output = Self::run(&["list-panes", "-t", session, "-F", "#{pane_id}"])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    fn capture_pane(&self, target: &str, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        let output = Self::run(&["capture-pane", "-t", target, "-p", "-S", &start])?;
        if !output.status.success() {
            return Err(ClawTownError::ProcessAdapter(format!(
                "capture-pane failed for {target}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn send_keys(&self, target: &str, keys: &str) -> Result<()> {
        let status = Command::new("tmux")
            .args(["send-keys", "-t", target, keys, "Enter"])
            .status()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("send-keys failed to spawn: {e}")))?;
        if !status.success() {
            return Err(ClawTownError::ProcessAdapter(format!("send-keys failed for {target}")));
        }
        Ok(())
    }

    fn send_keys_raw(&self, target: &str, keys: &str) -> Result<()> {
        let status = Command::new("tmux")
            .args(["send-keys", "-t", target, keys])
            .status()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("send-keys failed to spawn: {e}")))?;
        if !status.success() {
            return Err(ClawTownError::ProcessAdapter(format!("send-keys failed for {target}")));
        }
        Ok(())
    }

    fn send_buffered(&self, target: &str, content: &str) -> Result<()> {
        // UUID-derived buffer name keeps concurrent deliveries from separate
        // processes collision-free.
        let buffer_name = format!("claw_town_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let mut tmp = tempfile::NamedTempFile::new()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("failed to create buffer tempfile: {e}")))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| ClawTownError::ProcessAdapter(format!("failed writing buffer tempfile: {e}")))?;
        tmp.flush()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("failed flushing buffer tempfile: {e}")))?;
        let tmp_path = tmp.path().to_string_lossy().to_string();

        let status = Command::new("tmux")
            .args(["load-buffer", "-b", &buffer_name, &tmp_path])
            .status()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("load-buffer failed to spawn: {e}")))?;
        if !status.success() {
            return Err(ClawTownError::ProcessAdapter("load-buffer failed".to_string()));
        }

        let status = Command::new("tmux")
            .args(["paste-buffer", "-t", target, "-b", &buffer_name, "-d"])
            .status()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("paste-buffer failed to spawn: {e}")))?;
        if !status.success() {
            let _ = Command::new("tmux").args(["delete-buffer", "-b", &buffer_name]).status();
            return Err(ClawTownError::ProcessAdapter("paste-buffer failed".to_string()));
        }

        let status = Command::new("tmux")
            .args(["send-keys", "-t", target, "Enter"])
            .status()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("send Enter failed to spawn: {e}")))?;
        if !status.success() {
            return Err(ClawTownError::ProcessAdapter("send Enter failed".to_string()));
        }
        // `tmp` (a NamedTempFile) deletes itself on drop here.
        Ok(())
    }

    fn kill_window(&self, target: &str) -> Result<()> {
        let status = Command::new("tmux")
            .args(["kill-window", "-t", target])
            .status()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("kill-window failed to spawn: {e}")))?;
        if !status.success() {
            return Err(ClawTownError::ProcessAdapter(format!("kill-window failed for {target}")));
        }
        Ok(())
    }

    fn pane_pid(&self, target: &str) -> Result<Option<u32>> {
        let output = Self::run(&["display-message", "-t", target, "-p", "#{pane_pid}"])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().parse().ok())
    }

    fn window_exists(&self, target: &str) -> Result<bool> {
        let output = Self::run(&["display-message", "-t", target, "-p", "#{pane_dead}"])?;
        if !output.status.success() {
            return Ok(false);
        }
        let result = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(result == "0")
    }

    fn split_pane(
        &self,
        session: &str,
        horizontal: bool,
        cwd: &str,
        env_vars: &[(&str, &str)],
    ) -> Result<String> {
        let flag = if horizontal { "-h" } else { "-v" };
        for (name, _) in env_vars {
            if !is_allowed_env_var(name) {
                return Err(ClawTownError::ProcessAdapter(format!(
                    "environment variable '{name}' not in allowlist"
                )));
            }
        }

        let mut args: Vec<String> = vec![
            "split-window".to_string(),
            flag.to_string(),
            "-t".to_string(),
            session.to_string(),
            "-c".to_string(),
            cwd.to_string(),
            "-P".to_string(),
            "-F".to_string(),
            "#{pane_id}".to_string(),
        ];
        if !env_vars.is_empty() {
            let exports: Vec<String> = env_vars
                .iter()
                .map(|(k, v)| format!("export {}='{}'", k, v.replace('\'', "'\\''")))
                .collect();
            args.push(format!("bash -c '{}; exec bash'", exports.join("; ")));
        }

        let output = Command::new("tmux")
            .args(args.iter().map(String::as_str))
            .output()
            .map_err(|e| ClawTownError::ProcessAdapter(format!("split-window failed to spawn: {e}")))?;
        if !output.status.success() {
            return Err(ClawTownError::ProcessAdapter(format!(
                "split-window failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Poll `target`'s pane output up to `timeout` for one of `markers` to
/// appear. Used after a restart to confirm the relaunched CLI is ready
///.
pub fn wait_for_markers(
    adapter: &dyn ProcessAdapter,
    target: &str,
    markers: &[&str],
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Ok(output) = adapter.capture_pane(target, 50) {
            if markers.iter().any(|m| output.contains(m)) {
                return true;
            }
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(poll_interval);
    }
}

/// A fake adapter shared across this crate's unit tests (broker,
/// registry, supervisor) so none of them need a real tmux session.
#[cfg(test)]
pub mod test_support {
    use super::{ProcessAdapter, Result};
    use std::cell::RefCell;

    #[derive(Default)]
    pub struct FakeAdapter {
        pub panes: RefCell<std::collections::HashMap<String, String>>,
        pub alive: RefCell<std::collections::HashSet<String>>,
    }

    impl ProcessAdapter for FakeAdapter {
        fn list_windows(&self, _session: &str) -> Result<Vec<String>> {
            Ok(self.panes.borrow().keys().cloned().collect())
        }
        fn capture_pane(&self, target: &str, _lines: usize) -> Result<String> {
            Ok(self.panes.borrow().get(target).cloned().unwrap_or_default())
        }
        fn send_keys(&self, _target: &str, _keys: &str) -> Result<()> {
            Ok(())
        }
        fn send_keys_raw(&self, _target: &str, _keys: &str) -> Result<()> {
            Ok(())
        }
        fn send_buffered(&self, _target: &str, _content: &str) -> Result<()> {
            Ok(())
        }
        fn kill_window(&self, target: &str) -> Result<()> {
            self.alive.borrow_mut().remove(target);
            Ok(())
        }
        fn pane_pid(&self, _target: &str) -> Result<Option<u32>> {
            Ok(Some(1234))
        }
        fn window_exists(&self, target: &str) -> Result<bool> {
            Ok(self.alive.borrow().contains(target))
        }
        fn split_pane(
            &self,
            _session: &str,
            _horizontal: bool,
            _cwd: &str,
            _env_vars: &[(&str, &str)],
        ) -> Result<String> {
            Ok("%99".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeAdapter;
    use super::*;

    #[test]
    fn wait_for_markers_returns_true_once_marker_appears() {
        let fake = FakeAdapter::default();
        fake.panes.borrow_mut().insert("%1".to_string(), "bypass permissions".to_string());
        assert!(wait_for_markers(&fake, "%1", &["bypass permissions"], Duration::from_millis(50), Duration::from_millis(10)));
    }

    #[test]
    fn wait_for_markers_times_out_when_absent() {
        let fake = FakeAdapter::default();
        fake.panes.borrow_mut().insert("%1".to_string(), "still loading".to_string());
        assert!(!wait_for_markers(&fake, "%1", &["bypass permissions"], Duration::from_millis(30), Duration::from_millis(10)));
    }
}
