// SPDX-License-Identifier: Apache-2.0

//! One-shot reader for compressed log snapshots.
//!
//! Unlike the tailer, a decompressor reads its file once: it waits the
//! configured initial delay (uploads may still be in flight when the file
//! is discovered), streams the decompressed content line by line to the
//! sink, checkpoints the offset in decompressed bytes, and exits at EOF.
//! Lifecycle signalling matches the tailer so the reconciler treats both
//! the same way.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bzip2::read::BzDecoder;
use encoding_rs::Encoding;
use flate2::read::{GzDecoder, ZlibDecoder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::sink::Entry;

use super::config::CompressionFormat;
use super::error::{Error, Result};
use super::target::ReaderDeps;

const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub struct Decompressor {
    path: PathBuf,
    path_label: String,
    deps: ReaderDeps,
    /// Decompressed bytes shipped so far.
    offset: AtomicU64,
    stop_token: CancellationToken,
    done: CancellationToken,
    posdone: CancellationToken,
    read_handle: Mutex<Option<JoinHandle<()>>>,
    pos_handle: Mutex<Option<JoinHandle<()>>>,
    cleaned_up: AtomicBool,
}

impl Decompressor {
    pub fn start(
        path: PathBuf,
        initial_offset: u64,
        format: CompressionFormat,
        initial_delay: Duration,
        encoding: Option<&'static Encoding>,
        deps: ReaderDeps,
    ) -> Result<Arc<Self>> {
        if !path.exists() {
            return Err(Error::ReaderStart {
                path,
                reason: "file does not exist".to_string(),
            });
        }

        let decompressor = Arc::new(Self {
            path_label: path.display().to_string(),
            path,
            deps,
            offset: AtomicU64::new(initial_offset),
            stop_token: CancellationToken::new(),
            done: CancellationToken::new(),
            posdone: CancellationToken::new(),
            read_handle: Mutex::new(None),
            pos_handle: Mutex::new(None),
            cleaned_up: AtomicBool::new(false),
        });

        decompressor.deps.metrics.files_active.inc();

        let worker = decompressor.clone();
        let read_handle = tokio::task::spawn_blocking(move || {
            worker.run(format, initial_delay, encoding);
        });
        *decompressor
            .read_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(read_handle);

        let checkpointer = decompressor.clone();
        let pos_handle = tokio::spawn(async move {
            checkpointer.run_position_loop().await;
        });
        *decompressor
            .pos_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(pos_handle);

        debug!(path = %decompressor.path_label, offset = initial_offset, "started decompressor");
        Ok(decompressor)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the worker is still reading. False once EOF is reached.
    pub fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }

    pub(crate) fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub(crate) fn posdone(&self) -> &CancellationToken {
        &self.posdone
    }

    /// Record the compressed file size and checkpoint the decompressed
    /// offset.
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

    /// Stop the worker and checkpoint loops. Idempotent.
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

    fn run(self: Arc<Self>, format: CompressionFormat, delay: Duration, encoding: Option<&'static Encoding>) {
        self.sleep_cancellable(delay);

        if !self.stop_token.is_cancelled() {
            if let Err(e) = self.read_all(format, encoding) {
                error!(path = %self.path_label, error = %e, "decompression failed");
            }
            self.mark_position_and_size();
        }

        debug!(path = %self.path_label, "decompressor worker exited");
        self.done.cancel();
    }

    fn read_all(&self, format: CompressionFormat, encoding: Option<&'static Encoding>) -> io::Result<()> {
        let file = File::open(&self.path)?;
        let decoder: Box<dyn Read> = match format {
            CompressionFormat::Gzip => Box::new(GzDecoder::new(file)),
            CompressionFormat::Zlib => Box::new(ZlibDecoder::new(file)),
            CompressionFormat::Bzip2 => Box::new(BzDecoder::new(file)),
        };
        let mut reader = BufReader::new(decoder);

        // Already-shipped content is skipped, not replayed.
        let skip = self.offset.load(Ordering::Relaxed);
        if skip > 0 {
            io::copy(&mut reader.by_ref().take(skip), &mut io::sink())?;
        }

        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        loop {
            if self.stop_token.is_cancelled() {
                return Ok(());
            }

            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                return Ok(());
            }

            self.deliver(&buf, encoding);
            self.offset.fetch_add(n as u64, Ordering::Relaxed);
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
        while !remaining.is_zero() && !self.stop_token.is_cancelled() {
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
