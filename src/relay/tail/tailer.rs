//! File watches delivering batches of new log events.
//!
//! Each control-connection identity watches at most one file. The watcher
//! observes the file's parent directory, so the watch survives the file being
//! rotated, recreated or not existing yet. Change notifications become
//! re-check ticks in a capacity-1 channel: while a tick is pending further
//! notifications are dropped, which coalesces bursts. A single task per watch
//! drains the ticks, waits out the debounce window and runs one cursor pass,
//! so passes over a file never overlap.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::relay::error::{RelayError, Result};
use crate::relay::types::LogEvent;

use super::cursor::TailCursor;

/// Receives every event of one pass, in file order.
pub type UpdateCallback = Arc<dyn Fn(Vec<LogEvent>) + Send + Sync>;

struct Watch {
    path: PathBuf,
    cancel_token: CancellationToken,
    // Dropping the watcher stops notifications
    _watcher: RecommendedWatcher,
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn watch_error(e: notify::Error) -> RelayError {
    RelayError::Io(io::Error::other(e.to_string()))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub struct LogTailer {
    debounce: Duration,
    watches: DashMap<String, Watch>,
}

impl LogTailer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            watches: DashMap::new(),
        }
    }

    /// Watch `path` for `identity`, replacing any earlier watch.
    ///
    /// Only lines appended after this call are delivered; the cursor starts
    /// at the file's current size (0 if it does not exist yet).
    pub fn watch(
        &self,
        identity: &str,
        path: impl Into<PathBuf>,
        on_update: UpdateCallback,
    ) -> Result<()> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| {
                RelayError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Not a file path: {}", path.display()),
                ))
            })?;

        let cursor = match std::fs::metadata(&path) {
            Ok(metadata) => TailCursor::at(metadata.len()),
            Err(_) => TailCursor::new(),
        };

        let (tick_tx, tick_rx) = mpsc::channel::<()>(1);
        // Catches writes that land before the watcher is registered
        let _ = tick_tx.try_send(());

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if event
                        .paths
                        .iter()
                        .any(|changed| changed.file_name() == Some(file_name.as_os_str()))
                    {
                        let _ = tick_tx.try_send(());
                    }
                }
                Err(e) => debug!("Log watch error: {}", e),
            }
        })
        .map_err(watch_error)?;
        watcher
            .watch(&parent_dir(&path), RecursiveMode::NonRecursive)
            .map_err(watch_error)?;

        let cancel_token = CancellationToken::new();
        tokio::spawn(drain_ticks(
            path.clone(),
            cursor,
            tick_rx,
            self.debounce,
            on_update,
            cancel_token.clone(),
        ));

        let watch = Watch {
            path: path.clone(),
            cancel_token,
            _watcher: watcher,
        };
        if let Some(previous) = self.watches.insert(identity.to_string(), watch) {
            debug!("Replaced watch on {} for {}", previous.path.display(), identity);
        }
        info!("Watching {} for {}", path.display(), identity);
        Ok(())
    }

    /// Stop the watch of `identity`. Returns `false` if there was none.
    pub fn unwatch(&self, identity: &str) -> bool {
        match self.watches.remove(identity) {
            Some((_, watch)) => {
                info!("Stopped watching {} for {}", watch.path.display(), identity);
                true
            }
            None => false,
        }
    }

    pub fn watched_path(&self, identity: &str) -> Option<PathBuf> {
        self.watches.get(identity).map(|watch| watch.path.clone())
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

async fn drain_ticks(
    path: PathBuf,
    mut cursor: TailCursor,
    mut tick_rx: mpsc::Receiver<()>,
    debounce: Duration,
    on_update: UpdateCallback,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break,

            tick = tick_rx.recv() => {
                if tick.is_none() {
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(debounce) => {}
        }

        match cursor.poll(&path).await {
            Ok(events) if !events.is_empty() => {
                debug!(
                    "{}: {} new event(s), offset {}",
                    path.display(),
                    events.len(),
                    cursor.offset()
                );
                on_update(events);
            }
            Ok(_) => {}
            Err(e) => warn!("Tail pass on {} failed: {}", path.display(), e),
        }
    }

    debug!("Tail of {} stopped", path.display());
}
