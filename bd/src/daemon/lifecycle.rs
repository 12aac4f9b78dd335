//! Per-workspace daemon startup: lock acquisition, PID file, schema/
//! fingerprint validation, and socket path derivation.

use crate::atomic::FileLock;
use crate::error::{BeadsError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION_ENV: &str = "BEADS_SCHEMA_VERSION_OVERRIDE";
pub const FINGERPRINT_ENV: &str = "BEADS_SKIP_FINGERPRINT_CHECK";

pub struct WorkspacePaths {
    pub beads_dir: PathBuf,
    pub lock_path: PathBuf,
    pub pid_path: PathBuf,
    pub socket_path: PathBuf,
    pub version_path: PathBuf,
}

impl WorkspacePaths {
    pub fn resolve(beads_dir: &Path) -> Self {
        WorkspacePaths {
            beads_dir: beads_dir.to_path_buf(),
            lock_path: beads_dir.join("daemon.lock"),
            pid_path: beads_dir.join("daemon.pid"),
            socket_path: socket_path_for(beads_dir),
            version_path: beads_dir.join("daemon.version"),
        }
    }
}

/// Socket paths must stay under the platform's `sun_path` limit (~104-108
/// bytes). Workspaces nested deep in a home directory easily exceed that, so
/// long paths are rerouted through a short hash under `/tmp`.
fn socket_path_for(beads_dir: &Path) -> PathBuf {
    let canonical = beads_dir.to_string_lossy().to_string();
    let direct = beads_dir.join("daemon.sock");
    if direct.to_string_lossy().len() < 100 {
        return direct;
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    std::env::temp_dir().join(format!("bd-{}.sock", &digest[..16]))
}

/// Acquires the daemon's advisory lock, non-blocking. Returns `Ok(None)` if
/// another daemon already holds it — the caller should exit quietly.
pub fn acquire_daemon_lock(paths: &WorkspacePaths) -> Result<Option<FileLock>> {
    FileLock::try_acquire(&paths.lock_path)
}

/// Detects the `.beads/.beads/` nesting that results from running `bd init`
/// inside an already-initialized workspace.
pub fn detect_nested_beads_dir(paths: &WorkspacePaths) -> bool {
    paths.beads_dir.join(".beads").is_dir()
}

pub fn write_pid_file(paths: &WorkspacePaths) -> Result<()> {
    crate::atomic::write_atomic(&paths.pid_path, std::process::id().to_string().as_bytes())
}

pub fn write_version_file(paths: &WorkspacePaths) -> Result<()> {
    crate::atomic::write_atomic(&paths.version_path, env!("CARGO_PKG_VERSION").as_bytes())
}

/// A content fingerprint binding a database to the repository it was created
/// for, preventing a daemon from serving a database copied in from elsewhere.
pub fn compute_workspace_fingerprint(repo_root: &Path, db_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_root.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(db_path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn validate_fingerprint(storage: &dyn crate::storage::Storage, expected: &str) -> Result<()> {
    if std::env::var(FINGERPRINT_ENV).is_ok() {
        return Ok(());
    }
    let stored = storage
        .get_metadata("workspace_fingerprint")
        .map_err(|e| BeadsError::integrity("daemon", "validate_fingerprint", e.to_string()))?;

    match stored {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(BeadsError::fatal(format!(
            "workspace fingerprint mismatch: database was created for a different repository (expected {expected}, found {actual})"
        ))),
        None => storage
            .set_metadata("workspace_fingerprint", expected)
            .map_err(|e| BeadsError::integrity("daemon", "validate_fingerprint.seed", e.to_string())),
    }
}

/// Validates the schema version stored in the database against what this
/// binary expects, auto-upgrading in place unless overridden by env.
pub fn validate_schema_version(storage: &dyn crate::storage::Storage) -> Result<()> {
    let expected = crate::storage::schema::CURRENT_SCHEMA_VERSION;
    if let Ok(over) = std::env::var(SCHEMA_VERSION_ENV) {
        log::warn!("schema version check overridden by {SCHEMA_VERSION_ENV}={over}");
        return Ok(());
    }

    let stored: Option<i32> = storage
        .get_metadata("schema_version")
        .map_err(|e| BeadsError::integrity("daemon", "validate_schema_version", e.to_string()))?
        .and_then(|v| v.parse().ok());

    match stored {
        Some(v) if v == expected => Ok(()),
        Some(v) if v < expected => {
            log::info!("upgrading schema metadata from {v} to {expected}");
            storage
                .set_metadata("schema_version", &expected.to_string())
                .map_err(|e| BeadsError::integrity("daemon", "validate_schema_version.upgrade", e.to_string()))
        }
        Some(v) => Err(BeadsError::fatal(format!(
            "database schema version {v} is newer than this binary supports ({expected})"
        ))),
        None => storage
            .set_metadata("schema_version", &expected.to_string())
            .map_err(|e| BeadsError::integrity("daemon", "validate_schema_version.seed", e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn short_beads_dir_gets_direct_socket_path() {
        let dir = tempdir().unwrap();
        let socket = socket_path_for(dir.path());
        assert_eq!(socket, dir.path().join("daemon.sock"));
    }

    #[test]
    fn long_beads_dir_gets_hashed_tmp_socket() {
        let long = PathBuf::from("/").join("a".repeat(150));
        let socket = socket_path_for(&long);
        assert!(socket.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn detect_nested_beads_dir_true_when_present() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".beads")).unwrap();
        let paths = WorkspacePaths::resolve(dir.path());
        assert!(detect_nested_beads_dir(&paths));
    }
}
