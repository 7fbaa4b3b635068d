//! Shared primitives for atomic, concurrent-safe file state.
//!
//! Every persisted document in claw-town (tasks.json, a `T*.json` task
//! file, counter.json, an agent health record) is written the same way:
//! exclusive advisory lock on a sidecar `.lock` file, write to a tempfile
//! in the same directory, fsync, then rename over the target. Readers take
//! a shared lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fd_lock::RwLock;
use serde::Serialize;

use crate::errors::Result;

/// Run `body` while holding an exclusive advisory lock on `lock_path`
/// (created if it doesn't exist). The lock is released when `body`
/// returns, whether it succeeds or fails.
pub fn with_exclusive_lock<T>(
    lock_path: &Path,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let file = open_lock_file(lock_path)?;
    let mut lock = RwLock::new(file);
    let _guard = lock.write()?;
    body()
}

/// Run `body` while holding a shared (read) advisory lock on `lock_path`.
pub fn with_shared_lock<T>(lock_path: &Path, body: impl FnOnce() -> Result<T>) -> Result<T> {
    let file = open_lock_file(lock_path)?;
    let mut lock = RwLock::new(file);
    let _guard = lock.read()?;
    body()
}

fn open_lock_file(lock_path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(lock_path)?)
}

/// Atomically write `value` as pretty JSON to `path`.
///
/// Writes to a tempfile in the same directory, fsyncs, then renames over
/// the target — so readers never observe a partially-written file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    use std::io::Write;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| crate::errors::ClawTownError::Io(e.error))?;
    Ok(())
}

/// Return a sibling lock-file path for a given data file, e.g.
/// `tasks.json` -> `.tasks.json.lock`.
pub fn sibling_lock_path(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dir.join(format!(".{name}.lock"))
}
