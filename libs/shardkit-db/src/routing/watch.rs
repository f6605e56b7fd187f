//! File watching for the routing configuration.
//!
//! The parent directory is watched rather than the file itself so that
//! editors replacing the file through a rename are still noticed. Bursts of
//! events are coalesced: a reload runs once the file has been quiet for the
//! debounce interval.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use super::router::AliasRouter;
use crate::{DbError, Result};

/// Keeps the routing file under watch until dropped.
pub struct RouterWatcher {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RouterWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RouterWatcher {
    /// Quiet period before a reload.
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RouterWatcher {
    fn drop(&mut self) {
        // Dropping the watcher closes the channel, which ends the reload loop.
        drop(self.watcher.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!(path = %self.path.display(), "routing reload thread panicked");
        }
        tracing::debug!(path = %self.path.display(), "routing config watch stopped");
    }
}

impl AliasRouter {
    /// Reload the rules whenever the file passed to [`initialize`](Self::initialize) changes.
    ///
    /// A reload that fails is logged and the previous rules stay active.
    ///
    /// # Errors
    /// - `DbError::NotInitialized` if the router has no configuration path
    /// - `DbError::Watch` if the directory cannot be watched
    pub fn watch(self: &Arc<Self>, debounce: Duration) -> Result<RouterWatcher> {
        let path = self
            .config_path()
            .ok_or(DbError::NotInitialized("alias router config path"))?;
        let file_name: OsString = path
            .file_name()
            .ok_or_else(|| DbError::ConfigMissing(path.display().to_string()))?
            .to_owned();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let relevant = !event.kind.is_access()
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if relevant && tx.send(()).is_err() {
                    tracing::trace!("routing reload loop already stopped");
                }
            }
            Err(e) => tracing::warn!(error = %e, "routing config watch error"),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let worker = spawn_reload_loop(Arc::clone(self), rx, debounce);
        tracing::info!(path = %path.display(), ?debounce, "watching routing config");

        Ok(RouterWatcher {
            path,
            watcher: Some(watcher),
            worker: Some(worker),
        })
    }
}

/// Reload `router` once per burst of change signals on `rx`.
///
/// The loop ends when every sender is gone; a burst still pending at that
/// point is applied first.
pub fn spawn_reload_loop(
    router: Arc<AliasRouter>,
    rx: Receiver<()>,
    debounce: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut open = true;
        while open && rx.recv().is_ok() {
            loop {
                match rx.recv_timeout(debounce) {
                    Ok(()) => {}
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        open = false;
                        break;
                    }
                }
            }

            match router.reload() {
                Ok(()) => {
                    tracing::info!(generation = router.generation(), "routing config reloaded");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "routing config reload failed, keeping previous rules"
                    );
                }
            }
        }
    })
}
