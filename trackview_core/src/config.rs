//! Runtime configuration for the scheduler, session and engine.
//!
//! Every tunable lives in a plain struct with a `Default` impl. The
//! aggregate [`TrackViewConfig`] can be loaded from JSON; missing fields
//! keep their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the TaskScheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time a single run-loop turn may spend draining tasks (default: 30 ms)
    pub yield_budget_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { yield_budget_ms: 30 }
    }
}

impl SchedulerConfig {
    pub fn yield_budget(&self) -> Duration {
        Duration::from_millis(self.yield_budget_ms)
    }
}

/// Configuration for the ConnectionSession
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval of the position-request resync heartbeat (default: 60 s)
    pub heartbeat_interval_secs: u64,

    /// Silence after which the channel is forced closed (default: 60 s).
    /// The server emits at least one message every ~10 s.
    pub stale_after_secs: u64,

    /// Readiness poll interval while draining the send queue (default: 5 ms)
    pub send_poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            stale_after_secs: 60,
            send_poll_interval_ms: 5,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn send_poll_interval(&self) -> Duration {
        Duration::from_millis(self.send_poll_interval_ms)
    }
}

/// Configuration for the TrackEngine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Oldest predecessor a connector may bridge from (default: 3600 s)
    pub connector_horizon_secs: i64,

    /// Window in which reported timestamps are compared for reordering
    /// (default: 600 s)
    pub reorder_window_secs: i64,

    /// Minimum gap for the cross-identity resume match (default: 24 h)
    pub resume_gap_secs: i64,

    /// Decimal places compared by the resume match (default: 4, ~11 m)
    pub resume_round_decimals: u32,

    /// Opacity applied to ghosted markers (default: 0.5)
    pub ghost_opacity: f32,

    /// H3 resolution for viewport sectors (default: 5, ~8.5 km edge)
    pub sector_resolution: u8,

    /// Extra degrees around the viewport before a sector is culled
    /// (default: 0.25)
    pub sector_margin_deg: f64,

    /// Labels are not attached below this zoom level (default: 0 = always)
    pub label_min_zoom: u8,

    /// Window of the built-in duplicate detector (default: 30 s)
    pub duplicate_window_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connector_horizon_secs: 3600,
            reorder_window_secs: 600,
            resume_gap_secs: 86_400,
            resume_round_decimals: 4,
            ghost_opacity: 0.5,
            sector_resolution: 5,
            sector_margin_deg: 0.25,
            label_min_zoom: 0,
            duplicate_window_secs: 30,
        }
    }
}

/// Aggregate configuration for a TrackView client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackViewConfig {
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub engine: EngineConfig,
}

impl TrackViewConfig {
    /// Parses a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.send_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("session.send_poll_interval_ms must be > 0".into()));
        }
        if h3o::Resolution::try_from(self.engine.sector_resolution).is_err() {
            return Err(ConfigError::Invalid(format!(
                "engine.sector_resolution {} is not an H3 resolution",
                self.engine.sector_resolution
            )));
        }
        if !(0.0..=1.0).contains(&self.engine.ghost_opacity) {
            return Err(ConfigError::Invalid("engine.ghost_opacity must be within [0, 1]".into()));
        }
        Ok(())
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {0}: {1}")]
    Io(String, std::io::Error),

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
