// SPDX-License-Identifier: Apache-2.0

//! The file target reconciler.
//!
//! A [`FileTarget`] keeps two pieces of state in line with the filesystem:
//! the set of watched directories and the map of per-file readers. The run
//! loop reacts to a periodic sync tick, to filesystem notifications, and to
//! shutdown; `sync()` is the authoritative reconciliation, the notification
//! path is a fast path whose effects the next sync would produce anyway.
//!
//! The run loop is the only task driving reconciliation, but the state maps
//! sit behind a mutex so `sync()` can also be driven directly and snapshots
//! (`ready()`, `details()`) stay cheap. The lock is never held across an
//! await.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use encoding_rs::Encoding;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender, TrySendError};
use crate::positions::Positions;
use crate::sink::{Labels, Sink};

use super::config::{CompressionFormat, Config, DecompressionConfig, WatchConfig};
use super::decompressor::Decompressor;
use super::error::{Error, Result};
use super::metrics::Metrics;
use super::tailer::Tailer;
use super::watcher::{DirWatcher, FsEvent, FsEventKind};

/// Notification to the enclosing target manager about directory watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTargetEventKind {
    WatchStart,
    WatchStop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTargetEvent {
    pub kind: FileTargetEventKind,
    pub path: PathBuf,
}

/// A worker reading one file: a live tailer or a one-shot decompressor.
/// Clones share the same worker.
#[derive(Clone)]
pub enum Reader {
    Tail(Arc<Tailer>),
    Decompress(Arc<Decompressor>),
}

impl Reader {
    pub fn path(&self) -> &Path {
        match self {
            Reader::Tail(t) => t.path(),
            Reader::Decompress(d) => d.path(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Reader::Tail(t) => t.is_running(),
            Reader::Decompress(d) => d.is_running(),
        }
    }

    pub fn mark_position_and_size(&self) {
        match self {
            Reader::Tail(t) => t.mark_position_and_size(),
            Reader::Decompress(d) => d.mark_position_and_size(),
        }
    }

    pub async fn stop(&self) {
        match self {
            Reader::Tail(t) => t.stop().await,
            Reader::Decompress(d) => d.stop().await,
        }
    }
}

/// Everything a reader needs from its target. Cloned per reader.
#[derive(Clone)]
pub struct ReaderDeps {
    pub labels: Labels,
    pub sink: Arc<dyn Sink>,
    pub positions: Positions,
    pub metrics: Metrics,
    pub sync_period: Duration,
}

struct TargetState {
    watches: HashSet<PathBuf>,
    readers: HashMap<PathBuf, Reader>,
}

struct Inner {
    include: String,
    include_pattern: glob::Pattern,
    exclude_pattern: Option<glob::Pattern>,
    watch_config: WatchConfig,
    decompression: DecompressionConfig,
    encoding: Option<&'static Encoding>,
    deps: ReaderDeps,
    target_events: BoundedSender<FileTargetEvent>,
    dir_watcher: Option<DirWatcher>,
    state: Mutex<TargetState>,
    cancel: CancellationToken,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Discovers files matching an include/exclude glob pair and keeps one
/// running reader per discovered file. Clones share the same target.
#[derive(Clone)]
pub struct FileTarget {
    inner: Arc<Inner>,
}

impl FileTarget {
    /// Validate the globs and encoding, then launch the run loop.
    ///
    /// `fs_events` may be injected (tests do); otherwise the target owns a
    /// [`DirWatcher`] and registers directories with it as they are
    /// discovered. `target_events` receives a `WatchStart`/`WatchStop` per
    /// watched directory.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metrics: Metrics,
        sink: Arc<dyn Sink>,
        positions: Positions,
        include: &str,
        exclude: Option<&str>,
        labels: Labels,
        config: Config,
        watch_config: WatchConfig,
        fs_events: Option<BoundedReceiver<FsEvent>>,
        target_events: BoundedSender<FileTargetEvent>,
        encoding: Option<&str>,
        decompression: Option<DecompressionConfig>,
    ) -> Result<FileTarget> {
        let include_pattern =
            glob::Pattern::new(include).map_err(|e| Error::InvalidGlob {
                pattern: include.to_string(),
                reason: e.to_string(),
            })?;

        let exclude_pattern = exclude
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|e| Error::InvalidGlob {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let encoding = match encoding.filter(|label| !label.is_empty()) {
            Some(label) => Some(
                Encoding::for_label(label.as_bytes())
                    .ok_or_else(|| Error::InvalidEncoding(label.to_string()))?,
            ),
            None => None,
        };

        // When the event stream is injected there is no platform notifier to
        // feed the error channel; park a sender so the select arm stays open.
        let (events, errors, dir_watcher, _error_keepalive) = match fs_events {
            Some(events) => {
                let (error_tx, error_rx) = bounded::<String>(1);
                (events, error_rx, None, Some(error_tx))
            }
            None => {
                let watcher = DirWatcher::new()?;
                (watcher.events(), watcher.errors(), Some(watcher), None)
            }
        };

        let inner = Arc::new(Inner {
            include: include.to_string(),
            include_pattern,
            exclude_pattern,
            watch_config,
            decompression: decompression.unwrap_or_default(),
            encoding,
            deps: ReaderDeps {
                labels,
                sink,
                positions,
                metrics,
                sync_period: config.sync_period,
            },
            target_events,
            dir_watcher,
            state: Mutex::new(TargetState {
                watches: HashSet::new(),
                readers: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
            run_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(run_loop(
            inner.clone(),
            events,
            errors,
            _error_keepalive,
            config.sync_period,
        ));
        *inner.run_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(FileTarget { inner })
    }

    /// True once at least one reader is running.
    pub fn ready(&self) -> bool {
        !self.inner.lock_state().readers.is_empty()
    }

    /// Snapshot of tailed paths and their last acknowledged offsets.
    pub fn details(&self) -> HashMap<PathBuf, u64> {
        let state = self.inner.lock_state();
        state
            .readers
            .keys()
            .map(|path| (path.clone(), self.inner.deps.positions.get(path)))
            .collect()
    }

    /// Shut down: stop every reader, emit a `WatchStop` per watched
    /// directory, close the owned watcher. Blocks until all reader loops
    /// have exited and flushed. Idempotent.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self
            .inner
            .run_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Reconcile watches and readers against the filesystem.
    pub(crate) async fn sync(&self) -> Result<()> {
        self.inner.sync().await
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    mut events: BoundedReceiver<FsEvent>,
    mut errors: BoundedReceiver<String>,
    _error_keepalive: Option<BoundedSender<String>>,
    sync_period: Duration,
) {
    let mut ticker = tokio::time::interval(sync_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut events_open = true;
    let mut errors_open = true;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.sync().await {
                    error!(error = %e, "failed to sync file target");
                }
            }
            event = events.next(), if events_open => {
                match event {
                    Some(event) => inner.handle_fs_event(event).await,
                    None => events_open = false,
                }
            }
            err = errors.next(), if errors_open => {
                match err {
                    Some(err) => warn!(error = %err, "filesystem watcher error"),
                    None => errors_open = false,
                }
            }
        }
    }

    inner.shutdown().await;
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn matches(&self, path: &Path) -> bool {
        self.include_pattern.matches_path(path) && !self.is_excluded(path)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.matches_path(path))
    }

    async fn handle_fs_event(&self, event: FsEvent) {
        match event.kind {
            FsEventKind::Create => {
                if event.path.is_dir() || !self.matches(&event.path) {
                    return;
                }
                self.start_tailing(vec![event.path]).await;
            }
            FsEventKind::Remove | FsEventKind::Rename => {
                // The watch set is corrected by the next sync.
                self.stop_tailing_and_remove_positions(vec![event.path])
                    .await;
            }
            FsEventKind::Write | FsEventKind::Chmod | FsEventKind::Other => {
                // Running tailers pick up writes on their own.
            }
        }
    }

    /// The reconciliation pass: expand the include glob, drop exclusions,
    /// then two-way diff both the reader map and the watch set.
    async fn sync(&self) -> Result<()> {
        let entries =
            glob::glob(&self.include).map_err(|e| Error::GlobExpansion(e.to_string()))?;

        let mut matches: Vec<PathBuf> = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => {
                    if path.is_dir() || self.is_excluded(&path) {
                        continue;
                    }
                    matches.push(path);
                }
                Err(e) => debug!(error = %e, "skipping unreadable glob match"),
            }
        }

        let dirs: HashSet<PathBuf> = matches
            .iter()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();

        let (to_start_watching, to_stop_watching, to_stop_tailing) = {
            let state = self.lock_state();
            (
                missing(&state.watches, &dirs),
                missing(&dirs, &state.watches),
                to_stop_tailing(&matches, &state.readers),
            )
        };

        self.start_watching(to_start_watching).await;
        self.stop_watching(to_stop_watching).await;

        self.stop_tailing_and_remove_positions(to_stop_tailing).await;
        self.start_tailing(matches).await;

        // Positions whose path can no longer match are stale leftovers, e.g.
        // from an edited include pattern.
        for path in self.deps.positions.keys() {
            if !self.include_pattern.matches_path(&path) {
                self.deps.positions.remove(&path);
            }
        }

        Ok(())
    }

    async fn start_watching(&self, dirs: HashSet<PathBuf>) {
        for dir in dirs {
            {
                let mut state = self.lock_state();
                if !state.watches.insert(dir.clone()) {
                    continue;
                }
            }
            if let Some(watcher) = &self.dir_watcher {
                if let Err(e) = watcher.add(&dir) {
                    warn!(dir = %dir.display(), error = %e, "failed to add directory watch");
                }
            }
            debug!(dir = %dir.display(), "watching new directory");
            self.send_event(FileTargetEvent {
                kind: FileTargetEventKind::WatchStart,
                path: dir,
            })
            .await;
        }
    }

    async fn stop_watching(&self, dirs: HashSet<PathBuf>) {
        for dir in dirs {
            {
                let mut state = self.lock_state();
                if !state.watches.remove(&dir) {
                    continue;
                }
            }
            if let Some(watcher) = &self.dir_watcher {
                if let Err(e) = watcher.remove(&dir) {
                    debug!(dir = %dir.display(), error = %e, "failed to remove directory watch");
                }
            }
            debug!(dir = %dir.display(), "no longer watching directory");
            self.send_event(FileTargetEvent {
                kind: FileTargetEventKind::WatchStop,
                path: dir,
            })
            .await;
        }
    }

    /// Ensure a running reader exists for every path. A present-but-dead
    /// reader is stopped and replaced, resuming from its last checkpoint.
    async fn start_tailing(&self, paths: Vec<PathBuf>) {
        for path in paths {
            let existing = self.lock_state().readers.get(&path).cloned();
            if let Some(reader) = existing {
                if reader.is_running() {
                    continue;
                }
                debug!(path = %path.display(), "reader died, replacing it");
                reader.stop().await;
                self.lock_state().readers.remove(&path);
            }

            let offset = self.deps.positions.get(&path);
            let reader = match self.build_reader(&path, offset) {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to start reader, will retry");
                    continue;
                }
            };

            let raced = {
                let mut state = self.lock_state();
                if state.readers.contains_key(&path) {
                    true
                } else {
                    state.readers.insert(path.clone(), reader.clone());
                    false
                }
            };
            if raced {
                // A concurrent create notification beat us to it.
                reader.stop().await;
            }
        }
    }

    fn build_reader(&self, path: &Path, offset: u64) -> Result<Reader> {
        if self.decompression.enabled {
            let format = self.decompression.format.or_else(|| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .and_then(CompressionFormat::from_extension)
            });
            let format = format.ok_or_else(|| Error::ReaderStart {
                path: path.to_path_buf(),
                reason: "unknown compression format".to_string(),
            })?;
            let decompressor = Decompressor::start(
                path.to_path_buf(),
                offset,
                format,
                self.decompression.initial_delay,
                self.encoding,
                self.deps.clone(),
            )?;
            return Ok(Reader::Decompress(decompressor));
        }

        let tailer = Tailer::start(
            path.to_path_buf(),
            offset,
            self.encoding,
            self.watch_config,
            self.deps.clone(),
        )?;
        Ok(Reader::Tail(tailer))
    }

    async fn stop_tailing_and_remove_positions(&self, paths: Vec<PathBuf>) {
        for path in paths {
            let reader = self.lock_state().readers.remove(&path);
            if let Some(reader) = reader {
                debug!(path = %path.display(), "stopping tailing file");
                reader.stop().await;
                self.deps.positions.remove(&path);
            }
        }
    }

    async fn shutdown(&self) {
        let (readers, watches) = {
            let mut state = self.lock_state();
            (
                state.readers.drain().collect::<Vec<_>>(),
                state.watches.drain().collect::<Vec<_>>(),
            )
        };

        for (_, reader) in readers {
            reader.stop().await;
        }

        for dir in watches {
            if let Some(watcher) = &self.dir_watcher {
                let _ = watcher.remove(&dir);
            }
            self.send_event(FileTargetEvent {
                kind: FileTargetEventKind::WatchStop,
                path: dir,
            })
            .await;
        }

        if let Some(watcher) = &self.dir_watcher {
            watcher.close();
        }

        debug!(include = %self.include, "file target stopped");
    }

    /// Deliver a watch event to the target manager. The channel is bounded;
    /// on a full channel the send is retried with doubling backoff rather
    /// than dropped.
    async fn send_event(&self, event: FileTargetEvent) {
        let mut backoff = Duration::from_millis(50);
        loop {
            match self.target_events.try_send(event.clone()) {
                Ok(()) => return,
                Err(TrySendError::Full) => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                Err(TrySendError::Disconnected) => {
                    warn!("target event channel closed, dropping watch event");
                    return;
                }
            }
        }
    }
}

/// Paths that are tailed but no longer wanted: everything in `existing`
/// that is absent from `new_paths`. Order is unspecified.
pub fn to_stop_tailing<R>(new_paths: &[PathBuf], existing: &HashMap<PathBuf, R>) -> Vec<PathBuf> {
    let desired: HashSet<&PathBuf> = new_paths.iter().collect();
    existing
        .keys()
        .filter(|path| !desired.contains(*path))
        .cloned()
        .collect()
}

/// Everything in `b` that is not in `a`.
pub fn missing(a: &HashSet<PathBuf>, b: &HashSet<PathBuf>) -> HashSet<PathBuf> {
    b.difference(a).cloned().collect()
}
