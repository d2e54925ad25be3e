// SPDX-License-Identifier: Apache-2.0

//! Metric surface of the file target.
//!
//! Series names are part of the external contract. Constructed without a
//! registry the instruments still work but are never scraped, which is the
//! no-op mode used by callers that do not expose metrics.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

#[derive(Clone)]
pub struct Metrics {
    /// Number of currently running readers.
    pub files_active: IntGauge,
    /// Lines read, per file path.
    pub read_lines: IntCounterVec,
    /// Bytes read (delimiter included), per file path.
    pub read_bytes: IntCounterVec,
    /// Size of the file at the last checkpoint, per file path.
    pub file_bytes: IntGaugeVec,
}

impl Metrics {
    pub fn new(registry: Option<&Registry>) -> Self {
        let files_active = IntGauge::new("files_active_total", "Number of active files.")
            .expect("metric definition is static");
        let read_lines = IntCounterVec::new(
            Opts::new("read_lines_total", "Number of lines read."),
            &["path"],
        )
        .expect("metric definition is static");
        let read_bytes = IntCounterVec::new(
            Opts::new("read_bytes_total", "Number of bytes read."),
            &["path"],
        )
        .expect("metric definition is static");
        let file_bytes = IntGaugeVec::new(
            Opts::new("file_bytes_total", "Number of bytes total."),
            &["path"],
        )
        .expect("metric definition is static");

        if let Some(registry) = registry {
            registry
                .register(Box::new(files_active.clone()))
                .expect("files_active_total already registered");
            registry
                .register(Box::new(read_lines.clone()))
                .expect("read_lines_total already registered");
            registry
                .register(Box::new(read_bytes.clone()))
                .expect("read_bytes_total already registered");
            registry
                .register(Box::new(file_bytes.clone()))
                .expect("file_bytes_total already registered");
        }

        Self {
            files_active,
            read_lines,
            read_bytes,
            file_bytes,
        }
    }

    /// Drop every per-path series for `path`. Called when the reader for
    /// that path stops so stale series do not linger in the registry.
    pub fn remove_path(&self, path: &str) {
        let _ = self.read_lines.remove_label_values(&[path]);
        let _ = self.read_bytes.remove_label_values(&[path]);
        let _ = self.file_bytes.remove_label_values(&[path]);
    }
}
