// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid glob pattern '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("unsupported encoding label: {0}")]
    InvalidEncoding(String),

    #[error("glob expansion failed: {0}")]
    GlobExpansion(String),

    #[error("failed to start reader for {path}: {reason}")]
    ReaderStart { path: PathBuf, reason: String },

    #[error("watch error: {0}")]
    Watch(String),
}

pub type Result<T> = std::result::Result<T, Error>;
