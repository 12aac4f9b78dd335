//! CLI-side daemon client: decides whether to talk to a running daemon,
//! autostarts one when appropriate, and falls back to opening the store
//! directly when it isn't.

pub mod autostart;
pub mod rpc_client;

use crate::daemon::lifecycle::WorkspacePaths;
use crate::error::Result;
use std::path::Path;
use std::time::Duration;

const HEALTH_PING_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Daemon,
    Direct(DirectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectReason {
    NoDaemonFlag,
    SingleProcessBackend,
    WorktreeWithoutSyncBranch,
    AutostartFailed,
}

impl DirectReason {
    /// Safety/single-process fallbacks are expected and silent; everything
    /// else gets one diagnostic line naming the socket path.
    fn is_silent(&self) -> bool {
        matches!(self, DirectReason::NoDaemonFlag | DirectReason::SingleProcessBackend | DirectReason::WorktreeWithoutSyncBranch)
    }
}

pub struct ConnectOptions<'a> {
    pub no_daemon_flag: bool,
    pub single_process_backend: bool,
    pub in_worktree_without_sync_branch: bool,
    pub daemon_binary: &'a Path,
}

/// Resolves how this CLI invocation should reach the store: connect to a
/// running daemon, autostart one, or open the store directly.
pub async fn resolve_mode(beads_dir: &Path, opts: &ConnectOptions<'_>) -> Result<Mode> {
    if opts.no_daemon_flag || std::env::var("BEADS_NO_DAEMON").is_ok() {
        return Ok(Mode::Direct(DirectReason::NoDaemonFlag));
    }
    if opts.single_process_backend {
        return Ok(Mode::Direct(DirectReason::SingleProcessBackend));
    }
    if opts.in_worktree_without_sync_branch {
        return Ok(Mode::Direct(DirectReason::WorktreeWithoutSyncBranch));
    }

    let paths = WorkspacePaths::resolve(beads_dir);

    if rpc_client::health_ping(&paths.socket_path, HEALTH_PING_TIMEOUT).await.is_ok() {
        return Ok(Mode::Daemon);
    }

    if !autostart::allowed(&paths.socket_path) {
        let reason = DirectReason::AutostartFailed;
        warn_unless_silent(&paths.socket_path, reason);
        return Ok(Mode::Direct(reason));
    }

    autostart::spawn_detached(beads_dir, opts.daemon_binary)?;

    if autostart::wait_for_socket(&paths.socket_path, SOCKET_READY_TIMEOUT).await {
        autostart::record_success(&paths.socket_path);
        Ok(Mode::Daemon)
    } else {
        autostart::record_failure(&paths.socket_path);
        let reason = DirectReason::AutostartFailed;
        warn_unless_silent(&paths.socket_path, reason);
        Ok(Mode::Direct(reason))
    }
}

fn warn_unless_silent(socket_path: &Path, reason: DirectReason) {
    if !reason.is_silent() {
        log::warn!("falling back to direct mode: daemon unreachable at {}", socket_path.display());
    }
}
