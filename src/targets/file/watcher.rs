// SPDX-License-Identifier: Apache-2.0

//! Directory watcher built on the `notify` crate.
//!
//! Wraps the platform notifier (inotify on Linux, FSEvents on macOS,
//! ReadDirectoryChangesW on Windows), owns the set of watched directories,
//! and multiplexes raw notifications onto one event channel. The notifier's
//! callback thread does the forwarding; consumers read from `events()` and
//! `errors()`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::bounded_channel::{bounded, BoundedReceiver};

use super::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 512;
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Operation reported by the platform notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
    Other,
}

/// One filesystem notification for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

fn map_kind(kind: &EventKind) -> FsEventKind {
    match kind {
        EventKind::Create(_) => FsEventKind::Create,
        EventKind::Remove(_) => FsEventKind::Remove,
        EventKind::Modify(ModifyKind::Name(_)) => FsEventKind::Rename,
        EventKind::Modify(ModifyKind::Metadata(_)) => FsEventKind::Chmod,
        EventKind::Modify(_) => FsEventKind::Write,
        _ => FsEventKind::Other,
    }
}

/// Non-recursive directory watcher with an idempotent add/remove surface.
pub struct DirWatcher {
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched: Mutex<HashSet<PathBuf>>,
    events: BoundedReceiver<FsEvent>,
    errors: BoundedReceiver<String>,
}

impl DirWatcher {
    pub fn new() -> Result<Self> {
        let (event_tx, event_rx) = bounded::<FsEvent>(EVENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = bounded::<String>(ERROR_CHANNEL_CAPACITY);

        let watcher = notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let kind = map_kind(&event.kind);
                    for path in event.paths {
                        // The reconciler corrects any divergence on its next
                        // sync, so a dropped notification is not fatal.
                        if event_tx.try_send(FsEvent { path, kind }).is_err() {
                            warn!("filesystem event channel full, dropping notification");
                        }
                    }
                }
                Err(e) => {
                    let _ = error_tx.try_send(e.to_string());
                }
            },
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            watched: Mutex::new(HashSet::new()),
            events: event_rx,
            errors: error_rx,
        })
    }

    /// Start watching a directory. Watching an already-watched directory is
    /// a no-op.
    pub fn add(&self, dir: &Path) -> Result<()> {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        if watched.contains(dir) {
            return Ok(());
        }

        let mut guard = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        let watcher = guard
            .as_mut()
            .ok_or_else(|| Error::Watch("watcher is closed".to_string()))?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch(e.to_string()))?;

        watched.insert(dir.to_path_buf());
        Ok(())
    }

    /// Stop watching a directory. Removing an unknown directory is a no-op.
    pub fn remove(&self, dir: &Path) -> Result<()> {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        if !watched.remove(dir) {
            return Ok(());
        }

        let mut guard = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        let watcher = guard
            .as_mut()
            .ok_or_else(|| Error::Watch("watcher is closed".to_string()))?;
        watcher
            .unwatch(dir)
            .map_err(|e| Error::Watch(e.to_string()))?;
        Ok(())
    }

    /// The multiplexed notification stream.
    pub fn events(&self) -> BoundedReceiver<FsEvent> {
        self.events.clone()
    }

    /// Notifier errors, e.g. from an unreachable mount.
    pub fn errors(&self) -> BoundedReceiver<String> {
        self.errors.clone()
    }

    /// Tear down the platform notifier. Further `add`/`remove` calls fail.
    pub fn close(&self) {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let _ = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}
