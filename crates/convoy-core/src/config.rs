//! Coordinator configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid configuration.
//!
//! ```toml
//! max_retries = 3
//! monitor_interval_ms = 1000
//! stall_timeout_secs = 300
//! assignment_timeout_secs = 120
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_MAX_BACKLOG: usize = 10_000;
pub const DEFAULT_REDELIVERY_INTERVAL_MS: u64 = 500;
pub const DEFAULT_REDELIVERY_AFTER_MS: u64 = 2_000;
pub const DEFAULT_ALERT_RETENTION: usize = 1_000;
pub const DEFAULT_EVENT_LOG_RETENTION: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Retries granted to a task before it fails terminally.
    pub max_retries: u32,
    /// How often the monitor scans active assignments.
    pub monitor_interval_ms: u64,
    /// Silence after which an active assignment counts as stalled.
    pub stall_timeout_secs: u64,
    /// Optional bound on time spent in `assigned` before the worker starts.
    pub assignment_timeout_secs: Option<u64>,
    /// Per-subscriber queue depth in the router.
    pub channel_capacity: usize,
    /// Overflow a subscriber may accumulate before the router drops it.
    pub max_backlog: usize,
    pub redelivery_interval_ms: u64,
    /// Unacknowledged deliveries older than this are sent again.
    pub redelivery_after_ms: u64,
    pub alert_retention: usize,
    pub event_log_retention: usize,
    /// Where to load and save snapshots; none keeps state in memory only.
    pub snapshot_path: Option<PathBuf>,
    pub logging: LoggingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            assignment_timeout_secs: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_backlog: DEFAULT_MAX_BACKLOG,
            redelivery_interval_ms: DEFAULT_REDELIVERY_INTERVAL_MS,
            redelivery_after_ms: DEFAULT_REDELIVERY_AFTER_MS,
            alert_retention: DEFAULT_ALERT_RETENTION,
            event_log_retention: DEFAULT_EVENT_LOG_RETENTION,
            snapshot_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml_str(&std::fs::read_to_string(path)?)?;
        debug!(path = %path.display(), ?config, "config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_ms == 0 {
            return Err(Error::validation("monitor_interval_ms must be positive"));
        }
        if self.stall_timeout_secs == 0 {
            return Err(Error::validation("stall_timeout_secs must be positive"));
        }
        if self.assignment_timeout_secs == Some(0) {
            return Err(Error::validation("assignment_timeout_secs must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::validation("channel_capacity must be positive"));
        }
        if self.max_backlog == 0 {
            return Err(Error::validation("max_backlog must be positive"));
        }
        if self.redelivery_interval_ms == 0 || self.redelivery_after_ms == 0 {
            return Err(Error::validation("redelivery intervals must be positive"));
        }
        if self.alert_retention == 0 || self.event_log_retention == 0 {
            return Err(Error::validation("retention limits must be positive"));
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn assignment_timeout(&self) -> Option<Duration> {
        self.assignment_timeout_secs.map(Duration::from_secs)
    }

    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_millis(self.redelivery_interval_ms)
    }

    pub fn redelivery_after(&self) -> Duration {
        Duration::from_millis(self.redelivery_after_ms)
    }
}
