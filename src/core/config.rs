//! Configuration
//!
//! Handles loading the application settings. Settings are read from the JSON
//! file named by `ECOPOINTS_CONFIG`; missing fields fall back to defaults.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "ECOPOINTS_CONFIG";

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Only devices whose name contains this text are offered for connection.
    pub device_name_filter: String,
    /// Upper bound for opening the adapter link.
    pub connect_timeout_ms: u64,
    /// Default response timeout for commands without their own timeout.
    pub command_timeout_ms: u64,
    /// Interval between two sample polls while a trip is recorded.
    pub poll_interval_ms: u64,
    /// Minimum movement in metres before a new map node is appended.
    pub min_track_distance_m: f64,
    /// Position reported before the first fix arrives.
    pub start_latitude: f64,
    pub start_longitude: f64,
    /// Stop the trip automatically after this many seconds.
    pub trip_duration_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name_filter: "obd".to_owned(),
            connect_timeout_ms: 10_000,
            command_timeout_ms: 2_000,
            poll_interval_ms: 1_000,
            min_track_distance_m: 1.0,
            start_latitude: 48.306940,
            start_longitude: 14.285830,
            trip_duration_secs: None,
        }
    }
}

impl AppConfig {
    /// Loads the configuration from `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Loads the file named by `ECOPOINTS_CONFIG`, or the defaults if unset.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                info!("Loading configuration from {:?}", path);
                Self::from_file(Path::new(&path))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn trip_duration(&self) -> Option<Duration> {
        self.trip_duration_secs.map(Duration::from_secs)
    }
}
