//! The background daemon: one process per workspace, holding the store open,
//! coalescing writes into JSONL exports, watching for external changes, and
//! driving the pull/commit/push sync cycle.

pub mod crash;
pub mod lifecycle;
pub mod registry;
pub mod rpc;
pub mod watcher;

use crate::config::{Settings, SyncPolicy};
use crate::error::{BeadsError, Result};
use crate::storage::Storage;
use crate::sync::{import_jsonl, FlushManager};
use lifecycle::WorkspacePaths;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

const PULL_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_FLUSH_DEADLINE: Duration = Duration::from_secs(1);

pub struct DaemonOptions {
    pub repo_root: PathBuf,
    pub beads_dir: PathBuf,
    pub jsonl_path: PathBuf,
    pub local_only: bool,
    pub actor: String,
}

/// Runs the daemon for one workspace until shutdown. Returns `Ok(())` both
/// when it exits cleanly and when another daemon already held the lock (the
/// "exit quietly" case from the startup sequence).
pub async fn run(storage: Arc<dyn Storage>, opts: DaemonOptions) -> Result<()> {
    let paths = WorkspacePaths::resolve(&opts.beads_dir);

    if lifecycle::detect_nested_beads_dir(&paths) {
        return Err(BeadsError::user_with_hint(
            "nested .beads/.beads directory detected",
            "run `bd init` from the repository root, not from inside .beads/",
        ));
    }

    let lock = match lifecycle::acquire_daemon_lock(&paths)? {
        Some(lock) => lock,
        None => {
            log::info!("another daemon already holds the workspace lock; exiting quietly");
            return Ok(());
        }
    };

    lifecycle::write_pid_file(&paths)?;
    lifecycle::write_version_file(&paths)?;

    lifecycle::validate_schema_version(storage.as_ref())?;
    let db_path = std::path::Path::new(storage.path());
    let fingerprint = lifecycle::compute_workspace_fingerprint(&opts.repo_root, db_path);
    lifecycle::validate_fingerprint(storage.as_ref(), &fingerprint)?;

    let settings = Settings::load(storage.as_ref())?;
    let policy = SyncPolicy::resolve(&settings);
    let debounce = Duration::from_millis(settings.flush_debounce_ms());

    let flush_manager = FlushManager::new(storage.clone(), opts.jsonl_path.clone(), debounce);
    let rpc_server = rpc::RpcServer::bind(&paths.socket_path, storage.clone(), flush_manager.clone())?;
    registry::register(
        &opts.repo_root,
        registry::RegistryEntry {
            workspace: opts.repo_root.clone(),
            pid: std::process::id(),
            socket_path: paths.socket_path.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
        },
    )?;

    let flush_task = tokio::spawn(flush_manager.clone().run());
    let rpc_task = tokio::spawn(rpc_server.run());

    let watch_target = if opts.jsonl_path.exists() { opts.jsonl_path.clone() } else { opts.beads_dir.clone() };
    let mut watcher = watcher::ActivityWatcher::watch(&watch_target);

    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| BeadsError::environment(e.to_string()))?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| BeadsError::environment(e.to_string()))?;
    let mut pull_timer = tokio::time::interval(PULL_INTERVAL);
    let parent_pid = parent_pid_at_spawn();

    log::info!("bd daemon started for {} (socket {})", opts.repo_root.display(), paths.socket_path.display());

    loop {
        tokio::select! {
            _ = watcher.next() => {
                match auto_import(storage.as_ref(), &opts.jsonl_path, &settings, &opts.actor) {
                    Ok(changed) if changed => flush_manager.mark_dirty(false).await,
                    Ok(_) => {}
                    Err(e) => log::warn!("auto-import after activity signal failed: {e}"),
                }
            }
            _ = pull_timer.tick() => {
                if !opts.local_only {
                    match sync_cycle(storage.as_ref(), &opts, &settings, &policy) {
                        Ok(changed) if changed => flush_manager.mark_dirty(false).await,
                        Ok(_) => {}
                        Err(e) => log::warn!("sync cycle failed: {e}"),
                    }
                }
            }
            _ = sigterm.recv() => {
                log::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                log::info!("received SIGINT, shutting down");
                break;
            }
            _ = parent_liveness_tick(parent_pid) => {
                log::warn!("parent process disappeared, shutting down");
                break;
            }
        }
    }

    flush_manager.shutdown(SHUTDOWN_FLUSH_DEADLINE).await;
    rpc_task.abort();
    flush_task.abort();
    drop(lock);

    let _ = std::fs::remove_file(&paths.pid_path);
    let _ = std::fs::remove_file(&paths.socket_path);
    let _ = storage.close();
    registry::unregister(&opts.repo_root)?;

    Ok(())
}

/// Imports the on-disk JSONL into the store. Returns whether anything was
/// created or updated, so the caller can wake the flush consumer.
fn auto_import(storage: &dyn Storage, jsonl_path: &std::path::Path, _settings: &Settings, actor: &str) -> Result<bool> {
    if !jsonl_path.exists() {
        return Ok(false);
    }
    storage.reopen_if_stale().map_err(|e| BeadsError::integrity("daemon", "reopen_if_stale", e.to_string()))?;
    let contents = std::fs::read_to_string(jsonl_path).map_err(BeadsError::from)?;
    let prefix = crate::sync::import::derive_cold_start_prefix(&contents, jsonl_path);
    let report = import_jsonl(storage, &contents, &prefix, false, actor)?;
    let changed = report.created + report.updated > 0;
    if changed {
        log::info!("auto-import: {} created, {} updated, {} unchanged", report.created, report.updated, report.unchanged);
    }
    Ok(changed)
}

fn sync_cycle(storage: &dyn Storage, opts: &DaemonOptions, settings: &Settings, policy: &SyncPolicy) -> Result<bool> {
    let remote = settings.sync_remote();
    let branch = settings
        .sync_branch()
        .unwrap_or_else(|| crate::vcs::current_branch(&opts.repo_root).unwrap_or_else(|_| "main".to_string()));

    let mut changed = false;

    if policy.auto_pull && crate::vcs::has_remote(&opts.repo_root, &remote) {
        crate::vcs::pull(&opts.repo_root, &remote, &branch)?;
        changed |= auto_import(storage, &opts.jsonl_path, settings, &opts.actor)?;
    }

    if policy.auto_commit {
        let author = settings.get("git.author", None);
        let commit_opts = crate::vcs::CommitOptions {
            author: author.as_deref(),
            no_gpg_sign: settings.get("git.no-gpg-sign", None).as_deref() == Some("true"),
        };
        crate::vcs::commit(&opts.repo_root, &[opts.jsonl_path.as_path()], "bd: sync issue updates", &commit_opts)?;
    }

    if policy.auto_push && crate::vcs::has_remote(&opts.repo_root, &remote) {
        crate::vcs::push_with_retry(&opts.repo_root, &remote, &branch)?;
    }

    Ok(changed)
}

fn parent_pid_at_spawn() -> Option<u32> {
    nix::unistd::getppid().as_raw().try_into().ok()
}

async fn parent_liveness_tick(parent_pid: Option<u32>) {
    let Some(pid) = parent_pid else {
        std::future::pending::<()>().await;
        return;
    };
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
        if !alive {
            return;
        }
    }
}
