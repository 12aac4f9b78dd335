//! Crash-path recovery: writes a timestamped crash report and cleans up the
//! PID file, socket, and registry entry left behind by a daemon that died
//! without going through graceful shutdown.

use crate::daemon::registry;
use crate::error::{BeadsError, Result};
use chrono::Utc;
use std::path::Path;

/// Writes a crash report under `<beads_dir>/crashes/` and removes the
/// PID/socket files plus the workspace's registry entry. Idempotent: missing
/// files are not an error.
pub fn recover(beads_dir: &Path, workspace: &Path, pid_path: &Path, socket_path: &Path, reason: &str) -> Result<()> {
    let crashes_dir = beads_dir.join("crashes");
    std::fs::create_dir_all(&crashes_dir).map_err(BeadsError::from)?;

    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let report_path = crashes_dir.join(format!("crash-{stamp}.log"));
    let report = format!(
        "bd daemon crash report\ntime: {}\nworkspace: {}\nreason: {reason}\n\nbacktrace:\n{:?}\n",
        Utc::now().to_rfc3339(),
        workspace.display(),
        std::backtrace::Backtrace::force_capture(),
    );
    std::fs::write(&report_path, report).map_err(BeadsError::from)?;

    if pid_path.exists() {
        let _ = std::fs::remove_file(pid_path);
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    let _ = registry::unregister(workspace);

    log::error!("daemon recovered from crash ({reason}); report written to {}", report_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn recover_writes_report_and_clears_pid_file() {
        let dir = tempdir().unwrap();
        let beads_dir = dir.path().join(".beads");
        std::fs::create_dir_all(&beads_dir).unwrap();
        let pid_path = beads_dir.join("daemon.pid");
        std::fs::write(&pid_path, "1234").unwrap();
        let socket_path = beads_dir.join("daemon.sock");

        recover(&beads_dir, dir.path(), &pid_path, &socket_path, "test panic").unwrap();

        assert!(!pid_path.exists());
        assert!(std::fs::read_dir(beads_dir.join("crashes")).unwrap().count() == 1);
    }
}
