//! # Config - engine configuration
//!
//! [`EngineConfig`] carries every tunable of the engine. It can be built in
//! code through [`EngineConfig::builder`] or read from the environment:
//!
//! | Variable                          | Field                  | Default         |
//! |-----------------------------------|------------------------|-----------------|
//! | `LOGKV_DATA_DIR`                  | `data_dir`             | `./logkv_data`  |
//! | `LOGKV_MAX_SEGMENT_BYTES`         | `max_segment_size`     | 100 MiB         |
//! | `LOGKV_MAX_KEY_LEN`               | `max_key_len`          | 1024            |
//! | `LOGKV_COMPACTION_INTERVAL_SECS`  | `compaction_interval`  | 5               |
//! | `LOGKV_COMPACTION_THRESHOLD`      | `compaction_threshold` | 0.7             |
//! | `LOGKV_SYNC_WRITES`               | `sync_writes`          | `false`         |

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const ENV_DATA_DIR: &str = "LOGKV_DATA_DIR";
pub const ENV_MAX_SEGMENT_BYTES: &str = "LOGKV_MAX_SEGMENT_BYTES";
pub const ENV_MAX_KEY_LEN: &str = "LOGKV_MAX_KEY_LEN";
pub const ENV_COMPACTION_INTERVAL_SECS: &str = "LOGKV_COMPACTION_INTERVAL_SECS";
pub const ENV_COMPACTION_THRESHOLD: &str = "LOGKV_COMPACTION_THRESHOLD";
pub const ENV_SYNC_WRITES: &str = "LOGKV_SYNC_WRITES";

/// Default maximum segment size (100 MiB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 100 * 1024 * 1024;
pub use record::DEFAULT_MAX_KEY_LEN;
/// Default pause between background compaction runs.
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(5);
/// Segments whose live ratio is below this are compacted.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.7;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// An environment variable is set but does not parse.
    #[error("invalid value {value:?} for {var}")]
    Parse { var: &'static str, value: String },

    /// A value parsed but is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Directory holding all segment files.
    pub data_dir: PathBuf,
    /// An append that would grow the active segment past this many bytes
    /// seals it and starts a new one. Footer entries address records with
    /// 32-bit offsets, so this must fit in a `u32`.
    pub max_segment_size: u64,
    /// Longest key accepted by `put`/`delete`.
    pub max_key_len: usize,
    /// Pause between background compaction runs.
    pub compaction_interval: Duration,
    /// Live-ratio threshold in `(0, 1]` below which a sealed segment is
    /// rewritten.
    pub compaction_threshold: f64,
    /// `fsync` every append instead of only flushing to the OS.
    pub sync_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./logkv_data"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            sync_writes: false,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Reads the `LOGKV_*` variables over the defaults and validates.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(dir) = lookup(ENV_DATA_DIR) {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_SEGMENT_BYTES)? {
            cfg.max_segment_size = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_KEY_LEN)? {
            cfg.max_key_len = v;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_COMPACTION_INTERVAL_SECS)? {
            cfg.compaction_interval = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var(&lookup, ENV_COMPACTION_THRESHOLD)? {
            cfg.compaction_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_SYNC_WRITES)? {
            cfg.sync_writes = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        if self.max_segment_size == 0 || self.max_segment_size > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(format!(
                "max_segment_size must be between 1 and {} bytes, got {}",
                u32::MAX,
                self.max_segment_size
            )));
        }
        if self.max_key_len == 0 || self.max_key_len > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_key_len must be between 1 and {}, got {}",
                u16::MAX,
                self.max_key_len
            )));
        }
        if self.compaction_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "compaction_interval must be non-zero".into(),
            ));
        }
        // NaN fails both comparisons
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "compaction_threshold must be in (0, 1], got {}",
                self.compaction_threshold
            )));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { var, value: raw }),
    }
}

/// Builder for [`EngineConfig`]. Unset fields keep their defaults.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    pub fn max_segment_size(mut self, bytes: u64) -> Self {
        self.config.max_segment_size = bytes;
        self
    }

    pub fn max_key_len(mut self, len: usize) -> Self {
        self.config.max_key_len = len;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.config.compaction_interval = interval;
        self
    }

    pub fn compaction_threshold(mut self, threshold: f64) -> Self {
        self.config.compaction_threshold = threshold;
        self
    }

    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.config.sync_writes = sync;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests;
