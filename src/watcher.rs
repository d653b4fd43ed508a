//! Filesystem watcher and the sync-mode poll/watch/interrupt three-way
//! select.
//!
//! Three concurrent activities drive `sync` mode: a signal-handling
//! thread publishing interrupts, a filesystem-watcher thread emitting
//! write/remove events, and the main loop multiplexing over those plus the
//! poll-interval timer. The watcher is explicitly detached before every
//! `synchronize()` call and reattached after — the mechanism that stops a
//! sync round from re-triggering on the files it itself rewrites.

use crate::cache;
use crate::error::AppError;
use crate::orchestrator::Orchestrator;
use crate::txlog::TransactionLog;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("failed to install interrupt handler: {0}")]
    Signal(String),
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Write(PathBuf),
    Remove(PathBuf),
}

/// A `notify` watcher over one directory that can be dropped (`pause`) and
/// recreated (`resume`) on demand. Dropping genuinely stops delivery — no
/// events queue up while paused, which is the point: `synchronize` rewrites
/// files itself and must not see its own writes echoed back.
pub struct DirectoryWatcher {
    root: PathBuf,
    tx: std::sync::mpsc::Sender<WatchEvent>,
    inner: Option<notify::RecommendedWatcher>,
}

impl DirectoryWatcher {
    pub fn new(root: PathBuf, tx: std::sync::mpsc::Sender<WatchEvent>) -> Result<Self, WatcherError> {
        let mut watcher = DirectoryWatcher {
            root,
            tx,
            inner: None,
        };
        watcher.resume()?;
        Ok(watcher)
    }

    pub fn pause(&mut self) {
        self.inner = None;
    }

    pub fn resume(&mut self) -> Result<(), WatcherError> {
        use notify::{EventKind, RecursiveMode, Watcher};

        let tx = self.tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            match event.kind {
                EventKind::Remove(_) => {
                    for path in event.paths {
                        let _ = tx.send(WatchEvent::Remove(path));
                    }
                }
                EventKind::Create(_) | EventKind::Modify(_) => {
                    for path in event.paths {
                        let _ = tx.send(WatchEvent::Write(path));
                    }
                }
                _ => {}
            }
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        self.inner = Some(watcher);
        Ok(())
    }
}

/// Compute `path relative to root` using forward slashes, or `None` if
/// `path` somehow isn't under `root` (an event for a directory rename
/// outside the tree, say — logged and dropped rather than panicking).
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Run the `sync` CLI mode's main loop until an interrupt arrives.
pub async fn run_sync_loop(
    mut orchestrator: Orchestrator,
    local_root: PathBuf,
    poll_interval: Duration,
    cache_pool: SqlitePool,
) -> Result<(), AppError> {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<WatchEvent>();
    let (std_tx, std_rx) = std::sync::mpsc::channel::<WatchEvent>();

    // Bridge notify's synchronous callback thread into the async world.
    std::thread::spawn(move || {
        while let Ok(event) = std_rx.recv() {
            if event_tx.send(event).is_err() {
                break;
            }
        }
    });

    let mut watcher =
        DirectoryWatcher::new(local_root.clone(), std_tx).map_err(|e| AppError::Storage(e.to_string()))?;

    let (interrupt_tx, mut interrupt_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })
    .map_err(|e| AppError::Storage(e.to_string()))?;

    let user_id = orchestrator.self_id.to_hex();
    let mut prior_log: TransactionLog = cache::load_prior_log(&cache_pool, &user_id)
        .await
        .unwrap_or_else(|e| {
            log::warn!("sync: failed to load cached prior_log, starting empty: {e}");
            TransactionLog::new()
        });

    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                watcher.pause();
                prior_log = orchestrator.synchronize(&local_root, &prior_log).await;
                if let Err(e) = cache::store_prior_log(&cache_pool, &user_id, &prior_log, now_unix()).await {
                    log::warn!("sync: failed to persist prior_log cache: {e}");
                }
                watcher.resume().map_err(|e| AppError::Storage(e.to_string()))?;
            }
            Some(event) = event_rx.recv() => {
                match event {
                    WatchEvent::Write(abs) => {
                        if let Some(rel) = relative_path(&local_root, &abs) {
                            if let Err(e) = orchestrator.post_file(&local_root, &rel).await {
                                log::error!("sync: post_file({rel}) from watcher event failed: {e}");
                            }
                        }
                    }
                    WatchEvent::Remove(abs) => {
                        if let Some(rel) = relative_path(&local_root, &abs) {
                            if let Err(e) = orchestrator.delete_file(&rel).await {
                                log::error!("sync: delete_file({rel}) from watcher event failed: {e}");
                            }
                        }
                    }
                }
            }
            _ = interrupt_rx.recv() => {
                log::info!("sync: interrupt received, exiting cleanly");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_strips_root_and_normalizes_separators() {
        let root = Path::new("/tmp/vault");
        let path = Path::new("/tmp/vault/notes/todo.txt");
        assert_eq!(relative_path(root, path).as_deref(), Some("notes/todo.txt"));
    }

    #[test]
    fn relative_path_is_none_outside_root() {
        let root = Path::new("/tmp/vault");
        let path = Path::new("/tmp/elsewhere/todo.txt");
        assert!(relative_path(root, path).is_none());
    }

    #[test]
    fn watcher_can_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = std::sync::mpsc::channel();
        let mut watcher = DirectoryWatcher::new(dir.path().to_path_buf(), tx).unwrap();
        watcher.pause();
        assert!(watcher.inner.is_none());
        watcher.resume().unwrap();
        assert!(watcher.inner.is_some());
    }
}
