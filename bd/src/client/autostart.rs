//! Daemon autostart: the idempotent start-lock, exponential backoff after
//! repeated failures, and socket-readiness polling.

use crate::atomic::FileLock;
use crate::error::{BeadsError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const BACKOFF_FLOOR: Duration = Duration::from_secs(5);
const BACKOFF_CEILING: Duration = Duration::from_secs(120);

fn start_lock_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("start-lock")
}

fn backoff_state_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("backoff")
}

/// Reads the last recorded failure count and checks whether enough time has
/// elapsed since the last attempt to try again.
pub fn allowed(socket_path: &Path) -> bool {
    let path = backoff_state_path(socket_path);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return true;
    };
    let mut parts = contents.trim().split(',');
    let (Some(count), Some(last_attempt)) = (parts.next(), parts.next()) else {
        return true;
    };
    let (Ok(count), Ok(last_attempt)) = (count.parse::<u32>(), last_attempt.parse::<u64>()) else {
        return true;
    };

    let delay = backoff_delay(count);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now.saturating_sub(last_attempt) >= delay.as_secs()
}

fn backoff_delay(consecutive_failures: u32) -> Duration {
    let secs = BACKOFF_FLOOR.as_secs().saturating_mul(1u64 << consecutive_failures.min(5));
    Duration::from_secs(secs.min(BACKOFF_CEILING.as_secs()))
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn record_success(socket_path: &Path) {
    let _ = std::fs::remove_file(backoff_state_path(socket_path));
}

pub fn record_failure(socket_path: &Path) {
    let path = backoff_state_path(socket_path);
    let prev: u32 = std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().split(',').next().and_then(|c| c.parse().ok()))
        .unwrap_or(0);
    let _ = std::fs::write(&path, format!("{},{}", prev + 1, now_secs()));
}

/// Spawns the daemon as a detached background process, guarded by an
/// idempotent start-lock so concurrent CLI invocations don't race to spawn
/// two daemons for the same workspace.
pub fn spawn_detached(beads_dir: &Path, daemon_binary: &Path) -> Result<()> {
    let paths = crate::daemon::lifecycle::WorkspacePaths::resolve(beads_dir);
    let lock_path = start_lock_path(&paths.socket_path);

    let lock = match FileLock::try_acquire(&lock_path)? {
        Some(lock) => lock,
        None => {
            if is_stale_start_lock(&paths) {
                let _ = std::fs::remove_file(&lock_path);
                FileLock::try_acquire(&lock_path)?
                    .ok_or_else(|| BeadsError::transient("start-lock still held after staleness check"))?
            } else {
                return Ok(());
            }
        }
    };

    let child = Command::new(daemon_binary)
        .arg("daemon")
        .arg("start")
        .arg("--foreground")
        .current_dir(beads_dir.parent().unwrap_or(beads_dir))
        .spawn()
        .map_err(|e| BeadsError::environment(format!("failed to spawn daemon: {e}")))?;

    std::mem::forget(child);
    drop(lock);
    Ok(())
}

/// A start-lock is stale if its writer PID is dead or no longer holds the
/// daemon lock itself — flock ownership is authoritative and immune to PID
/// reuse, unlike comparing PIDs alone.
fn is_stale_start_lock(paths: &crate::daemon::lifecycle::WorkspacePaths) -> bool {
    match FileLock::try_acquire(&paths.lock_path) {
        Ok(Some(lock)) => {
            drop(lock);
            true
        }
        Ok(None) => false,
        Err(_) => true,
    }
}

pub async fn wait_for_socket(socket_path: &Path, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if socket_path.exists() {
            if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allowed_when_no_backoff_state_exists() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        assert!(allowed(&socket));
    }

    #[test]
    fn backoff_delay_caps_at_ceiling() {
        assert_eq!(backoff_delay(10), BACKOFF_CEILING);
    }

    #[test]
    fn record_failure_then_success_clears_state() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        record_failure(&socket);
        assert!(backoff_state_path(&socket).exists());
        record_success(&socket);
        assert!(!backoff_state_path(&socket).exists());
    }
}
