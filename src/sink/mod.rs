// SPDX-License-Identifier: Apache-2.0

//! The downstream seam.
//!
//! Readers hand every log line to a [`Sink`]; what happens after that
//! (parsing, labelling pipelines, remote write) is not this crate's concern.

pub mod fake;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Labels = BTreeMap<String, String>;

/// One log line with its labels and observation timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl Entry {
    pub fn new(labels: Labels, line: impl Into<String>) -> Self {
        Self {
            labels,
            timestamp: Utc::now(),
            line: line.into(),
        }
    }
}

#[derive(Error, Debug)]
#[error("sink error: {0}")]
pub struct SinkError(pub String);

/// Downstream consumer of log entries. Multiple readers deliver
/// concurrently, so implementations must be thread-safe. Delivery errors
/// are reported back for logging but are never fatal to a reader.
pub trait Sink: Send + Sync {
    fn handle(&self, entry: Entry) -> Result<(), SinkError>;
}
