// SPDX-License-Identifier: Apache-2.0

//! Configuration for the file target.

use std::str::FromStr;
use std::time::Duration;

/// Top-level target configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reconciliation cadence: how often the target re-globs the filesystem
    /// and diffs the result against its running readers. Also the cadence of
    /// each reader's position checkpoint.
    pub sync_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(10),
        }
    }
}

/// Poll behaviour of tailers once they hit EOF.
///
/// The wait between polls starts at `min_poll_frequency` and doubles up to
/// `max_poll_frequency` while a file stays quiet, resetting whenever data
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    pub min_poll_frequency: Duration,
    pub max_poll_frequency: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            min_poll_frequency: Duration::from_millis(250),
            max_poll_frequency: Duration::from_millis(250),
        }
    }
}

/// Compressed snapshot formats the decompressor can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Zlib,
    Bzip2,
}

impl FromStr for CompressionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gz" | "gzip" => Ok(CompressionFormat::Gzip),
            "z" | "zlib" => Ok(CompressionFormat::Zlib),
            "bz2" | "bzip2" => Ok(CompressionFormat::Bzip2),
            _ => Err(format!(
                "Invalid compression format '{}'. Valid options: gz, z, bz2",
                s
            )),
        }
    }
}

impl CompressionFormat {
    /// Infer the format from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "gz" => Some(CompressionFormat::Gzip),
            "z" => Some(CompressionFormat::Zlib),
            "bz2" => Some(CompressionFormat::Bzip2),
            _ => None,
        }
    }
}

/// Switches readers from live tailing to one-shot decompression.
#[derive(Debug, Clone, Default)]
pub struct DecompressionConfig {
    pub enabled: bool,
    /// Grace period before the snapshot is opened, for files that are still
    /// being uploaded when discovered.
    pub initial_delay: Duration,
    /// Explicit format; when absent the file extension decides.
    pub format: Option<CompressionFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_format_from_str() {
        assert_eq!(
            "gz".parse::<CompressionFormat>().unwrap(),
            CompressionFormat::Gzip
        );
        assert_eq!(
            "z".parse::<CompressionFormat>().unwrap(),
            CompressionFormat::Zlib
        );
        assert_eq!(
            "bz2".parse::<CompressionFormat>().unwrap(),
            CompressionFormat::Bzip2
        );
        assert_eq!(
            "GZIP".parse::<CompressionFormat>().unwrap(),
            CompressionFormat::Gzip
        );
        assert!("xz".parse::<CompressionFormat>().is_err());
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.sync_period, Duration::from_secs(10));

        let watch = WatchConfig::default();
        assert_eq!(watch.min_poll_frequency, Duration::from_millis(250));
        assert_eq!(watch.max_poll_frequency, Duration::from_millis(250));

        let decompression = DecompressionConfig::default();
        assert!(!decompression.enabled);
        assert!(decompression.format.is_none());
    }
}
