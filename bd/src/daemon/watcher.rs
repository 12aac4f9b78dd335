//! Activity watcher: notifies the daemon's event loop when the on-disk
//! JSONL (or its containing `.beads/` directory) changes, debounced into a
//! single wake-up per burst.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(50);
const POLL_FALLBACK_INTERVAL: Duration = Duration::from_secs(3);

/// Receives one signal per debounced burst of filesystem activity on the
/// watched path.
pub struct ActivityWatcher {
    rx: mpsc::Receiver<()>,
    _watcher: WatcherHandle,
}

enum WatcherHandle {
    Notify(RecommendedWatcher),
    Polling,
}

impl ActivityWatcher {
    /// Watches `path` in priority order (caller picks: versioning dir > JSONL
    /// file > `.beads/` dir), preferring OS notifications and falling back to
    /// polling if registration fails.
    pub fn watch(path: &Path) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let notify_tx = tx.clone();

        let watch_target = path.to_path_buf();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = notify_tx.try_send(());
            }
        });

        match watcher {
            Ok(mut w) => match w.watch(&watch_target, RecursiveMode::NonRecursive) {
                Ok(()) => ActivityWatcher { rx, _watcher: WatcherHandle::Notify(w) },
                Err(e) => {
                    log::warn!("notify registration failed for {}: {e}, falling back to polling", watch_target.display());
                    spawn_poller(watch_target, tx);
                    ActivityWatcher { rx, _watcher: WatcherHandle::Polling }
                }
            },
            Err(e) => {
                log::warn!("notify watcher unavailable: {e}, falling back to polling");
                spawn_poller(watch_target, tx);
                ActivityWatcher { rx, _watcher: WatcherHandle::Polling }
            }
        }
    }

    /// Awaits the next debounced activity signal.
    pub async fn next(&mut self) -> Option<()> {
        let signal = self.rx.recv().await?;
        tokio::time::sleep(DEBOUNCE).await;
        while self.rx.try_recv().is_ok() {}
        Some(signal)
    }
}

fn spawn_poller(path: PathBuf, tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        let mut last = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        loop {
            tokio::time::sleep(POLL_FALLBACK_INTERVAL).await;
            let current = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
            if current != last {
                last = current;
                if tx.send(()).await.is_err() {
                    return;
                }
            }
        }
    });
}
