// SPDX-License-Identifier: Apache-2.0

//! Live follow of a single log file.
//!
//! The read loop runs on a blocking thread: it consumes complete lines from
//! the current offset, forwards them to the sink, and at EOF watches for
//! truncation (size dropped below the offset) and rotation (new file
//! identity at the same path), reopening from the start in either case. A
//! separate checkpoint task writes the offset to the positions store on the
//! sync period and flushes one final position on stop.
//!
//! Termination is observable through two tokens: `done` closes when the
//! read loop exits (for any reason, including a fatal error), `posdone`
//! when the checkpoint loop has flushed and exited.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use encoding_rs::Encoding;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::sink::Entry;

use super::config::WatchConfig;
use super::error::{Error, Result};
use super::file_id::FileId;
use super::target::ReaderDeps;

/// How often blocking waits re-check the stop tokens.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub struct Tailer {
    path: PathBuf,
    path_label: String,
    deps: ReaderDeps,
    /// Bytes consumed from the file so far.
    offset: AtomicU64,
    stop_token: CancellationToken,
    kill_token: CancellationToken,
    done: CancellationToken,
    posdone: CancellationToken,
    read_handle: Mutex<Option<JoinHandle<()>>>,
    pos_handle: Mutex<Option<JoinHandle<()>>>,
    cleaned_up: AtomicBool,
}

impl Tailer {
    /// Open `path` at `initial_offset` and start the read and checkpoint
    /// loops. A file that does not exist yet is not an error: the read loop
    /// waits for it to appear.
    pub fn start(
        path: PathBuf,
        initial_offset: u64,
        encoding: Option<&'static Encoding>,
        watch_config: WatchConfig,
        deps: ReaderDeps,
    ) -> Result<Arc<Self>> {
        let tailer = Arc::new(Self {
            path_label: path.display().to_string(),
            path,
            deps,
            offset: AtomicU64::new(initial_offset),
            stop_token: CancellationToken::new(),
            kill_token: CancellationToken::new(),
            done: CancellationToken::new(),
            posdone: CancellationToken::new(),
            read_handle: Mutex::new(None),
            pos_handle: Mutex::new(None),
            cleaned_up: AtomicBool::new(false),
        });

        let initial_state = match open_reader(&tailer.path, &tailer.offset) {
            Ok(state) => Some(state),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::ReaderStart {
                    path: tailer.path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        tailer.deps.metrics.files_active.inc();

        let reader = tailer.clone();
        let read_handle = tokio::task::spawn_blocking(move || {
            reader.run_read_loop(initial_state, encoding, watch_config);
        });
        *tailer
            .read_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(read_handle);

        let checkpointer = tailer.clone();
        let pos_handle = tokio::spawn(async move {
            checkpointer.run_position_loop().await;
        });
        *tailer.pos_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(pos_handle);

        debug!(path = %tailer.path_label, offset = initial_offset, "started tailing");
        Ok(tailer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the read loop is still alive.
    pub fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// Closed when the read loop has exited.
    pub(crate) fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Closed when the checkpoint loop has flushed and exited.
    pub(crate) fn posdone(&self) -> &CancellationToken {
        &self.posdone
    }

    /// Record the current file size and checkpoint the offset.
    pub fn mark_position_and_size(&self) {
        match std::fs::metadata(&self.path) {
            Ok(metadata) => {
                self.deps
                    .metrics
                    .file_bytes
                    .with_label_values(&[&self.path_label])
                    .set(metadata.len() as i64);
            }
            Err(e) => {
                debug!(path = %self.path_label, error = %e, "failed to stat file for checkpoint");
            }
        }
        self.deps
            .positions
            .put(&self.path, self.offset.load(Ordering::Relaxed));
    }

    /// Stop both loops, wait for them, and drop the per-path metric series.
    /// Idempotent.
    pub async fn stop(&self) {
        self.stop_token.cancel();

        let read = self
            .read_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = read {
            let _ = handle.await;
        }

        let pos = self
            .pos_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = pos {
            let _ = handle.await;
        }

        self.cleanup_metrics();
    }

    /// Abort the read loop as if the underlying file handle had failed.
    #[cfg(test)]
    pub(crate) fn kill(&self, reason: &str) {
        warn!(path = %self.path_label, reason, "killing tailer");
        self.kill_token.cancel();
    }

    fn should_exit(&self) -> bool {
        self.stop_token.is_cancelled() || self.kill_token.is_cancelled()
    }

    fn run_read_loop(
        self: Arc<Self>,
        mut state: Option<(BufReader<File>, FileId)>,
        encoding: Option<&'static Encoding>,
        watch_config: WatchConfig,
    ) {
        let mut poll_wait = watch_config.min_poll_frequency;
        let mut buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            if self.should_exit() {
                break;
            }

            let Some((reader, file_id)) = state.as_mut() else {
                match open_reader(&self.path, &self.offset) {
                    Ok(opened) => {
                        state = Some(opened);
                    }
                    Err(e) => {
                        if e.kind() != io::ErrorKind::NotFound {
                            debug!(path = %self.path_label, error = %e, "failed to open file");
                        }
                        self.sleep_cancellable(poll_wait);
                    }
                }
                continue;
            };

            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    if self.check_rotation(*file_id) {
                        state = None;
                        continue;
                    }
                    self.sleep_cancellable(poll_wait);
                    poll_wait = next_poll_wait(poll_wait, &watch_config);
                }
                Ok(n) if buf.ends_with(b"\n") => {
                    poll_wait = watch_config.min_poll_frequency;
                    self.deliver(&buf, encoding);
                    self.offset.fetch_add(n as u64, Ordering::Relaxed);
                }
                Ok(n) => {
                    // Unterminated line at EOF: the writer is mid-append.
                    // Put the bytes back and wait for the newline.
                    if let Err(e) = reader.seek_relative(-(n as i64)) {
                        debug!(path = %self.path_label, error = %e, "failed to rewind partial line");
                        state = None;
                        continue;
                    }
                    self.sleep_cancellable(poll_wait);
                    poll_wait = next_poll_wait(poll_wait, &watch_config);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(path = %self.path_label, error = %e, "read failed, stopping tailer");
                    break;
                }
            }
        }

        debug!(path = %self.path_label, "tailer read loop exited");
        self.done.cancel();
    }

    /// At EOF, detect truncation and rotation. Returns true when the file
    /// must be reopened from the start.
    fn check_rotation(&self, current_id: FileId) -> bool {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            // File is gone; hold the open handle and let reconciliation
            // decide whether this tailer should stop.
            Err(_) => return false,
        };

        if metadata.len() < self.offset.load(Ordering::Relaxed) {
            debug!(path = %self.path_label, "file truncated, restarting from the beginning");
            self.offset.store(0, Ordering::Relaxed);
            return true;
        }

        match FileId::from_path(&self.path) {
            Ok(id) if id != current_id => {
                debug!(path = %self.path_label, "file rotated, restarting from the beginning");
                self.offset.store(0, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    fn deliver(&self, raw: &[u8], encoding: Option<&'static Encoding>) {
        let mut end = raw.len();
        while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
            end -= 1;
        }

        let line = match encoding {
            Some(encoding) => {
                let (text, _, _) = encoding.decode(&raw[..end]);
                text.into_owned()
            }
            None => String::from_utf8_lossy(&raw[..end]).into_owned(),
        };

        self.deps
            .metrics
            .read_lines
            .with_label_values(&[&self.path_label])
            .inc();
        self.deps
            .metrics
            .read_bytes
            .with_label_values(&[&self.path_label])
            .inc_by(raw.len() as u64);

        let mut labels = self.deps.labels.clone();
        labels.insert("filename".to_string(), self.path_label.clone());
        if let Err(e) = self.deps.sink.handle(Entry::new(labels, line)) {
            warn!(path = %self.path_label, error = %e, "sink rejected entry");
        }
    }

    fn sleep_cancellable(&self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() && !self.should_exit() {
            let chunk = remaining.min(CANCEL_CHECK_INTERVAL);
            std::thread::sleep(chunk);
            remaining = remaining.saturating_sub(chunk);
        }
    }

    async fn run_position_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.deps.sync_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.stop_token.cancelled() => break,
                _ = ticker.tick() => self.mark_position_and_size(),
            }
        }

        self.mark_position_and_size();
        self.posdone.cancel();
    }

    fn cleanup_metrics(&self) {
        if !self.cleaned_up.swap(true, Ordering::SeqCst) {
            self.deps.metrics.remove_path(&self.path_label);
            self.deps.metrics.files_active.dec();
        }
    }
}

fn next_poll_wait(current: Duration, config: &WatchConfig) -> Duration {
    (current * 2)
        .max(config.min_poll_frequency)
        .min(config.max_poll_frequency)
}

/// Open the file, clamp the stored offset to the current size (a smaller
/// file means it was truncated while untracked), and seek.
fn open_reader(path: &Path, offset: &AtomicU64) -> io::Result<(BufReader<File>, FileId)> {
    let mut file = File::open(path)?;
    let file_id = FileId::from_file(&file)?;
    let len = file.metadata()?.len();

    let mut pos = offset.load(Ordering::Relaxed);
    if pos > len {
        pos = 0;
        offset.store(0, Ordering::Relaxed);
    }
    file.seek(SeekFrom::Start(pos))?;

    Ok((BufReader::new(file), file_id))
}
