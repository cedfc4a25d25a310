//! Configuration parsing and validation.
//!
//! Handles loading configuration from an optional YAML file and merging
//! command-line overrides on top. The command line always wins.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::{Path, PathBuf};

use crate::error::{
    ConfigError, MissingRelationSnafu, ReadFileSnafu, YamlParseSnafu, ZeroPollIntervalSnafu,
};

/// How much of the buffer file is removed after a committed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TruncateMode {
    /// Remove exactly the snapshotted prefix, keeping bytes a producer
    /// appended between the snapshot and the truncate.
    #[default]
    Prefix,
    /// Truncate the whole file to zero length. Bytes appended after the
    /// snapshot are discarded; only safe when producers take the lock for
    /// the full append, never between the feeder's snapshot and truncate.
    Full,
}

/// Main configuration structure for the feeder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target relation receiving the bulk-loaded rows.
    #[serde(default)]
    pub relation: String,

    /// libpq-style connection descriptor ("host=... user=... dbname=...").
    /// Unset keys fall back to the PG* environment variables.
    #[serde(default)]
    pub conninfo: Option<String>,

    /// Buffer file path. When unset the buffer file is expected on stdin.
    #[serde(default)]
    pub buffer: Option<PathBuf>,

    /// Seconds to sleep between drain cycles (default: 10).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Truncation behavior after a committed load (default: prefix).
    #[serde(default)]
    pub truncate: TruncateMode,

    /// Log one status line for every completed statement and bulk load.
    #[serde(default)]
    pub verbose: bool,
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relation: String::new(),
            conninfo: None,
            buffer: None,
            poll_interval_secs: default_poll_interval_secs(),
            truncate: TruncateMode::default(),
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        serde_yaml::from_str(&content).context(YamlParseSnafu)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.relation.is_empty(), MissingRelationSnafu);
        ensure!(self.poll_interval_secs > 0, ZeroPollIntervalSnafu);
        Ok(())
    }
}
