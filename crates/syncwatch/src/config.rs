//! Engine configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchError};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 750;
pub const DEFAULT_QUIET_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_EMPTY_FILE_HOLD_MS: u64 = 15_000;
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_TOUCHED_TTL_MS: u64 = 5_000;

/// Name of the trash directory created under the root when none is configured.
pub const DEFAULT_TRASH_DIR_NAME: &str = ".trash";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directory tree being watched.
    pub root: PathBuf,
    pub poll_interval_ms: u64,
    /// How long a path must stay unchanged before its event is released.
    pub quiet_window_ms: u64,
    /// Extra hold applied to zero-byte creations.
    pub empty_file_hold_ms: u64,
    /// Maximum simultaneous consumer calls.
    pub concurrency: usize,
    pub touched_ttl_ms: u64,
    /// Files larger than this are never dispatched for create/change.
    pub max_file_size: Option<u64>,
    /// Delay applied to events that do not ask to skip batching. 0 disables it.
    pub batch_delay_ms: u64,
    /// Defaults to `<root>/.trash`.
    pub trash_dir: Option<PathBuf>,
    /// Absolute paths excluded from enumeration.
    pub ignored_roots: Vec<PathBuf>,
    /// Where the last snapshot is persisted between runs.
    pub snapshot_cache: Option<PathBuf>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            quiet_window_ms: DEFAULT_QUIET_WINDOW_MS,
            empty_file_hold_ms: DEFAULT_EMPTY_FILE_HOLD_MS,
            concurrency: DEFAULT_CONCURRENCY,
            touched_ttl_ms: DEFAULT_TOUCHED_TTL_MS,
            max_file_size: None,
            batch_delay_ms: 0,
            trash_dir: None,
            ignored_roots: Vec::new(),
            snapshot_cache: None,
        }
    }
}

impl WatchConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Applies `SYNCWATCH_*` environment overrides. Unparseable or zero values
    /// are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        self.poll_interval_ms = read_u64("SYNCWATCH_POLL_INTERVAL_MS", self.poll_interval_ms);
        self.quiet_window_ms = read_u64("SYNCWATCH_QUIET_WINDOW_MS", self.quiet_window_ms);
        self.empty_file_hold_ms =
            read_u64("SYNCWATCH_EMPTY_FILE_HOLD_MS", self.empty_file_hold_ms);
        self.concurrency = read_u64("SYNCWATCH_CONCURRENCY", self.concurrency as u64) as usize;
        self.touched_ttl_ms = read_u64("SYNCWATCH_TOUCHED_TTL_MS", self.touched_ttl_ms);
        self.batch_delay_ms = read_u64("SYNCWATCH_BATCH_DELAY_MS", self.batch_delay_ms);
        if let Some(limit) = env::var("SYNCWATCH_MAX_FILE_SIZE")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
        {
            self.max_file_size = Some(limit);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(WatchError::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.concurrency == 0 {
            return Err(WatchError::Config("concurrency must be > 0".to_string()));
        }
        if self.root.as_os_str().is_empty() {
            return Err(WatchError::Config("root must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn empty_file_hold(&self) -> Duration {
        Duration::from_millis(self.empty_file_hold_ms)
    }

    pub fn touched_ttl(&self) -> Duration {
        Duration::from_millis(self.touched_ttl_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.trash_dir
            .clone()
            .unwrap_or_else(|| self.root.join(DEFAULT_TRASH_DIR_NAME))
    }
}

fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WatchConfig::new("/vault");
        assert_eq!(config.poll_interval(), Duration::from_millis(750));
        assert_eq!(config.quiet_window(), Duration::from_millis(1_000));
        assert_eq!(config.empty_file_hold(), Duration::from_millis(15_000));
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.touched_ttl(), Duration::from_millis(5_000));
        assert_eq!(config.trash_dir(), PathBuf::from("/vault/.trash"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: WatchConfig =
            serde_json::from_str(r#"{ "root": "/vault", "concurrency": 2 }"#).expect("parse");
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.quiet_window_ms, DEFAULT_QUIET_WINDOW_MS);
        assert!(config.snapshot_cache.is_none());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = WatchConfig {
            concurrency: 0,
            ..WatchConfig::new("/vault")
        };
        match config.validate() {
            Err(WatchError::Config(_)) => {}
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
