//! Flush manager: coalesces dirty signals from any writer into a single
//! debounced export cycle, with a bounded-deadline final flush on shutdown.

use crate::error::Result;
use crate::storage::Storage;
use crate::sync::export::{export_full, export_incremental};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

struct State {
    is_dirty: bool,
    needs_full_export: bool,
}

/// Event-driven coalescer sitting in front of [`export_incremental`]/[`export_full`].
pub struct FlushManager {
    storage: Arc<dyn Storage>,
    jsonl_path: PathBuf,
    debounce: Duration,
    state: Mutex<State>,
    wake: Notify,
    shut_down: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl FlushManager {
    pub fn new(storage: Arc<dyn Storage>, jsonl_path: PathBuf, debounce: Duration) -> Arc<Self> {
        Arc::new(FlushManager {
            storage,
            jsonl_path,
            debounce,
            state: Mutex::new(State {
                is_dirty: false,
                needs_full_export: false,
            }),
            wake: Notify::new(),
            shut_down: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    /// Marks the store dirty. `full_export` escalates the next flush to a
    /// full rebuild instead of an incremental one.
    pub async fn mark_dirty(&self, full_export: bool) {
        let mut state = self.state.lock().await;
        state.is_dirty = true;
        if full_export {
            state.needs_full_export = true;
        }
        drop(state);
        self.wake.notify_one();
    }

    /// The consumer loop: waits for a dirty signal, debounces, flushes, and
    /// re-arms. Intended to run as a background task for the lifetime of the
    /// daemon; returns when `shutdown` is called and no further work remains.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.wake.notified().await;
            if self.shut_down.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(self.debounce).await;

            let (is_dirty, needs_full) = {
                let mut state = self.state.lock().await;
                let snapshot = (state.is_dirty, state.needs_full_export);
                state.is_dirty = false;
                state.needs_full_export = false;
                snapshot
            };

            if !is_dirty {
                continue;
            }

            match self.flush_once(needs_full) {
                Ok(_) => self.consecutive_failures.store(0, Ordering::SeqCst),
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    log::warn!("flush failed (attempt {failures}): {e}");
                    if failures >= 3 {
                        let alert = format!(
                            "flush has failed {failures} times in a row; recover with `bd export -o {}`",
                            self.jsonl_path.display()
                        );
                        eprintln!("{}", alert.red().bold());
                        log::error!("{alert}");
                    }
                }
            }
        }
    }

    fn flush_once(&self, full: bool) -> Result<()> {
        if full {
            export_full(self.storage.as_ref(), &self.jsonl_path)?;
        } else {
            export_incremental(self.storage.as_ref(), &self.jsonl_path)?;
        }
        Ok(())
    }

    /// Performs a final synchronous flush if dirty, bounded by `deadline`.
    /// Idempotent: a second call is a no-op.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let is_dirty = {
            let state = self.state.lock().await;
            state.is_dirty
        };

        if !is_dirty {
            return;
        }

        let storage = self.storage.clone();
        let path = self.jsonl_path.clone();
        let result = timeout(
            deadline,
            tokio::task::spawn_blocking(move || export_incremental(storage.as_ref(), &path)),
        )
        .await;

        match result {
            Ok(Ok(Ok(_))) => log::info!("final shutdown flush succeeded"),
            Ok(Ok(Err(e))) => log::warn!("final shutdown flush failed: {e}"),
            Ok(Err(e)) => log::warn!("final shutdown flush task panicked: {e}"),
            Err(_) => log::warn!("final shutdown flush timed out after {:?}", deadline),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;
    use std::path::PathBuf as StdPathBuf;
    use tempfile::tempdir;

    #[tokio::test]
    async fn mark_dirty_coalesces_bursts_into_one_flush() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(StdPathBuf::from(":memory:")).unwrap());
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let manager = FlushManager::new(storage, path, Duration::from_millis(20));

        let runner = tokio::spawn(manager.clone().run());

        for _ in 0..5 {
            manager.mark_dirty(false).await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown(Duration::from_secs(1)).await;
        runner.abort();

        assert_eq!(manager.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(StdPathBuf::from(":memory:")).unwrap());
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let manager = FlushManager::new(storage, path, Duration::from_millis(20));

        manager.shutdown(Duration::from_millis(100)).await;
        manager.shutdown(Duration::from_millis(100)).await;
    }
}
