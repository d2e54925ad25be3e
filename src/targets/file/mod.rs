// SPDX-License-Identifier: Apache-2.0

//! File target: glob-based discovery and durable tailing of log files.
//!
//! A [`FileTarget`] reconciles a set of directory watches and per-file
//! readers against whatever currently matches its include/exclude globs.
//! Reconciliation runs on a timer and on filesystem notifications; readers
//! checkpoint their offsets through the positions store so tails survive
//! restarts.
//!
//! Features:
//! - Two-way diff between discovered files and running readers
//! - Event-driven fast path for file creation and removal
//! - Dead tailer detection and in-place replacement
//! - One-shot readers for compressed snapshots (gz, z, bz2)

pub mod config;
mod decompressor;
pub mod error;
mod file_id;
pub mod metrics;
mod tailer;
mod target;
pub mod watcher;

pub use config::{CompressionFormat, Config, DecompressionConfig, WatchConfig};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use target::{missing, to_stop_tailing, FileTarget, FileTargetEvent, FileTargetEventKind, Reader};
pub use watcher::{DirWatcher, FsEvent, FsEventKind};
