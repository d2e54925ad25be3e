// SPDX-License-Identifier: Apache-2.0

//! Durable positions store.
//!
//! Maps file paths to the last acknowledged byte offset so tailing resumes
//! where it left off after a restart. The in-memory map is the source of
//! truth; a background task flushes it to a JSON file on a timer, and only
//! when something changed. Writes go through a temp-file-then-rename so a
//! crash mid-write never corrupts the previous snapshot.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum PositionsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse positions file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize positions: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PositionsError>;

/// On-disk snapshot of the positions map.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionsFile {
    positions: HashMap<PathBuf, u64>,
}

#[derive(Debug, Clone)]
pub struct PositionsConfig {
    /// How often the flush task writes dirty state to disk.
    pub sync_period: Duration,
    /// Path of the positions file.
    pub path: PathBuf,
}

impl PositionsConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            sync_period: Duration::from_secs(10),
            path: path.into(),
        }
    }
}

struct State {
    entries: HashMap<PathBuf, u64>,
    dirty: bool,
}

struct Inner {
    config: PositionsConfig,
    state: Mutex<State>,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the positions store. Clones are cheap and all refer to
/// the same map; `get`/`put`/`remove` are safe from any thread.
#[derive(Clone)]
pub struct Positions {
    inner: Arc<Inner>,
}

impl Positions {
    /// Open the store, loading the file at `config.path` if it exists, and
    /// start the background flush task. Must be called within a tokio
    /// runtime.
    pub fn new(config: PositionsConfig) -> Result<Self> {
        let entries = if config.path.exists() {
            let file = File::open(&config.path)?;
            let parsed: PositionsFile =
                serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                    PositionsError::Parse {
                        path: config.path.clone(),
                        source: e,
                    }
                })?;
            parsed.positions
        } else {
            HashMap::new()
        };

        debug!(path = %config.path.display(), entries = entries.len(), "opened positions store");

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(State {
                entries,
                dirty: false,
            }),
            cancel: CancellationToken::new(),
            flusher: Mutex::new(None),
        });

        let positions = Self {
            inner: inner.clone(),
        };

        let handle = tokio::spawn(run_flush_loop(inner.clone()));
        *inner.flusher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(positions)
    }

    /// Last acknowledged offset for `path`, 0 when absent.
    pub fn get(&self, path: &Path) -> u64 {
        self.lock_state()
            .entries
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    pub fn put(&self, path: &Path, offset: u64) {
        let mut state = self.lock_state();
        state.entries.insert(path.to_path_buf(), offset);
        state.dirty = true;
    }

    pub fn remove(&self, path: &Path) {
        let mut state = self.lock_state();
        if state.entries.remove(path).is_some() {
            state.dirty = true;
        }
    }

    /// All paths with a recorded position.
    pub fn keys(&self) -> Vec<PathBuf> {
        self.lock_state().entries.keys().cloned().collect()
    }

    /// Flush the final state and stop the background task. Idempotent.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self
            .inner
            .flusher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.save() {
            error!(error = %e, "failed to flush positions on stop");
        }
    }

    /// Write the current map to disk unconditionally.
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.lock_state();
            state.dirty = false;
            PositionsFile {
                positions: state.entries.clone(),
            }
        };
        atomic_write(&self.inner.config.path, &snapshot)
    }

    fn save_if_dirty(&self) -> Result<()> {
        if self.lock_state().dirty {
            self.save()?;
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_flush_loop(inner: Arc<Inner>) {
    let positions = Positions {
        inner: inner.clone(),
    };
    let mut ticker = tokio::time::interval(inner.config.sync_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = positions.save_if_dirty() {
                    error!(error = %e, "failed to flush positions");
                }
            }
        }
    }
}

/// Write the snapshot to a temp file next to the target and rename it into
/// place. Rename is atomic on the filesystems we care about.
fn atomic_write(path: &Path, snapshot: &PositionsFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> PositionsConfig {
        PositionsConfig {
            sync_period: Duration::from_secs(600),
            path: dir.path().join("positions.json"),
        }
    }

    #[tokio::test]
    async fn put_get_remove() {
        let dir = TempDir::new().unwrap();
        let positions = Positions::new(config(&dir)).unwrap();

        let path = Path::new("/var/log/test.log");
        assert_eq!(positions.get(path), 0);

        positions.put(path, 42);
        assert_eq!(positions.get(path), 42);

        positions.remove(path);
        assert_eq!(positions.get(path), 0);

        positions.stop().await;
    }

    #[tokio::test]
    async fn survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = Path::new("/var/log/app.log");

        {
            let positions = Positions::new(config(&dir)).unwrap();
            positions.put(path, 1234);
            positions.stop().await;
        }

        let positions = Positions::new(config(&dir)).unwrap();
        assert_eq!(positions.get(path), 1234);
        assert_eq!(positions.keys(), vec![path.to_path_buf()]);
        positions.stop().await;
    }

    #[tokio::test]
    async fn flush_task_writes_dirty_state() {
        let dir = TempDir::new().unwrap();
        let cfg = PositionsConfig {
            sync_period: Duration::from_millis(10),
            path: dir.path().join("positions.json"),
        };
        let positions = Positions::new(cfg.clone()).unwrap();
        positions.put(Path::new("/var/log/app.log"), 7);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !cfg.path.exists() {
            assert!(tokio::time::Instant::now() < deadline, "positions never flushed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        positions.stop().await;
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        fs::write(&cfg.path, b"not json").unwrap();

        assert!(matches!(
            Positions::new(cfg),
            Err(PositionsError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let positions = Positions::new(config(&dir)).unwrap();
        positions.stop().await;
        positions.stop().await;
    }
}
