//! Explicit configuration values for the pipeline.
//!
//! Nothing here is global: the binaries build a [`Settings`] once from
//! command line flags and hand the derived [`PluginConfig`]s to
//! [`crate::plugins::Plugins::build`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_READ_DEPTH: usize = 100;
pub const DEFAULT_SIZE_LIMIT: u64 = 32 * 1024 * 1024;
pub const DEFAULT_MAX_SIZE: u64 = 1024 * 1024 * 1024 * 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_QUEUE_LIMIT: usize = 256;

/// Capture reader options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInputConfig {
    /// Restart from the first record once every file is exhausted.
    pub loop_input: bool,
    /// Records buffered per file; also bounds how far out of order a file may be.
    pub read_depth: usize,
    /// Upper bound on a single pacing delay. Zero disables the cap.
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    /// Account for pacing without sleeping.
    pub dry_run: bool,
}

impl Default for FileInputConfig {
    fn default() -> Self {
        Self { loop_input: false, read_depth: DEFAULT_READ_DEPTH, max_wait: Duration::ZERO, dry_run: false }
    }
}

/// Capture writer options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOutputConfig {
    /// Bytes per shard before rotating to the next suffix.
    pub size_limit: u64,
    /// Bytes across all shards after which writes are dropped.
    pub max_size: u64,
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    /// Append to existing shards instead of truncating.
    pub append: bool,
    /// Records queued for the writer thread before `push` blocks.
    pub queue_limit: usize,
}

impl Default for FileOutputConfig {
    fn default() -> Self {
        Self {
            size_limit: DEFAULT_SIZE_LIMIT,
            max_size: DEFAULT_MAX_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            append: false,
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

/// Throughput cap attached to a plugin with a `|limit` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Limit {
    /// Total number of records allowed through.
    Count(u64),
    /// At most `max` records per fixed window.
    Rate {
        max: u64,
        #[serde(with = "duration_ms")]
        window: Duration,
    },
}

impl FromStr for Limit {
    type Err = Error;

    /// `100` is an absolute cap; `10/s`, `600/m`, `1000/h` are rate caps.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || Error::Config(format!("invalid limit {s:?}"));
        match s.split_once('/') {
            None => s.parse::<u64>().map(Limit::Count).map_err(|_| bad()),
            Some((n, unit)) => {
                let max = n.trim().parse::<u64>().map_err(|_| bad())?;
                let window = match unit.trim() {
                    "s" | "sec" => Duration::from_secs(1),
                    "m" | "min" => Duration::from_secs(60),
                    "h" | "hour" => Duration::from_secs(3600),
                    _ => return Err(bad()),
                };
                Ok(Limit::Rate { max, window })
            }
        }
    }
}

/// Split `target|limit` into the target and its optional limit.
pub fn split_limit(options: &str) -> Result<(&str, Option<Limit>)> {
    match options.split_once('|') {
        Some((target, limit)) if !limit.trim().is_empty() => Ok((target, Some(limit.parse()?))),
        Some((target, _)) => Ok((target, None)),
        None => Ok((options, None)),
    }
}

/// One source or sink to construct, with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginConfig {
    InputFile { pattern: String, limit: Option<Limit>, options: FileInputConfig },
    OutputFile { path: PathBuf, limit: Option<Limit>, options: FileOutputConfig },
    OutputStdout { limit: Option<Limit> },
    OutputNull { limit: Option<Limit> },
}

impl PluginConfig {
    pub fn limit(&self) -> Option<Limit> {
        match self {
            PluginConfig::InputFile { limit, .. }
            | PluginConfig::OutputFile { limit, .. }
            | PluginConfig::OutputStdout { limit }
            | PluginConfig::OutputNull { limit } => *limit,
        }
    }
}

/// Whole-process configuration, constructed once and passed down.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Input globs, each optionally suffixed with `|limit`.
    pub input_file: Vec<String>,
    pub input: FileInputConfig,
    /// Output paths, each optionally suffixed with `|limit`.
    pub output_file: Vec<String>,
    pub output: FileOutputConfig,
    pub output_stdout: bool,
    pub output_null: bool,
    #[serde(with = "duration_ms")]
    pub exit_after: Duration,
}

impl Settings {
    /// Expand the settings into one [`PluginConfig`] per source/sink.
    pub fn plugin_configs(&self) -> Result<Vec<PluginConfig>> {
        let mut out = Vec::new();
        for options in &self.input_file {
            let (pattern, limit) = split_limit(options)?;
            out.push(PluginConfig::InputFile { pattern: pattern.to_string(), limit, options: self.input.clone() });
        }
        for options in &self.output_file {
            let (path, limit) = split_limit(options)?;
            out.push(PluginConfig::OutputFile { path: PathBuf::from(path), limit, options: self.output.clone() });
        }
        if self.output_stdout {
            out.push(PluginConfig::OutputStdout { limit: None });
        }
        if self.output_null {
            out.push(PluginConfig::OutputNull { limit: None });
        }
        Ok(out)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.read_depth == 0 {
            return Err(Error::Config("input read depth must be at least 1".into()));
        }
        if self.output.size_limit == 0 || self.output.max_size == 0 {
            return Err(Error::Config("output size limits must be positive".into()));
        }
        if self.output.queue_limit == 0 {
            return Err(Error::Config("output queue limit must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse a byte size such as `512`, `64kb`, `32mb`, `1tb` (powers of 1024).
pub fn parse_size(s: &str) -> Result<u64> {
    let lower = s.trim().to_ascii_lowercase();
    let digits = lower.find(|c: char| !c.is_ascii_digit()).unwrap_or(lower.len());
    let (n, unit) = lower.split_at(digits);
    let n: u64 = n.parse().map_err(|_| Error::Config(format!("invalid size {s:?}")))?;
    let mult: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        _ => return Err(Error::Config(format!("invalid size unit in {s:?}"))),
    };
    n.checked_mul(mult).ok_or_else(|| Error::Config(format!("size {s:?} overflows")))
}

/// Parse a duration such as `250ms`, `1s`, `2m`, `1h`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let t = s.trim();
    let digits = t.find(|c: char| !c.is_ascii_digit()).unwrap_or(t.len());
    let (n, unit) = t.split_at(digits);
    let n: u64 = n.parse().map_err(|_| Error::Config(format!("invalid duration {s:?}")))?;
    Ok(match unit {
        "ns" => Duration::from_nanos(n),
        "us" => Duration::from_micros(n),
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        _ => return Err(Error::Config(format!("invalid duration unit in {s:?}"))),
    })
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
