// ABOUTME: Configuration for a status beacon: store path, tick interval, and failure budget.
// ABOUTME: Built programmatically or read from BEACON_* environment variables, with validation.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PATH: &str = "status.db";
pub const DEFAULT_INTERVAL_SECS: f64 = 1.0;
pub const DEFAULT_MAX_ERRORS: u32 = 3;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("interval must be a finite, non-negative number of seconds, got {0}")]
    InvalidInterval(String),

    #[error("max errors must be a positive integer, got {0}")]
    InvalidMaxErrors(String),

    #[error("cannot resolve status path {path:?}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where and how often a beacon records its status.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconConfig {
    /// Absolute path of the status file.
    pub path: PathBuf,
    /// Time between two ticks, with millisecond resolution.
    pub interval: Duration,
    /// Consecutive failures tolerated before the loop gives up.
    pub max_errors: u32,
}

impl BeaconConfig {
    /// Configuration with the default interval (1s) and budget (3).
    /// The path is made absolute against the current directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let path = std::path::absolute(path).map_err(|source| ConfigError::Path {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path,
            interval: interval_from_secs(DEFAULT_INTERVAL_SECS)?,
            max_errors: DEFAULT_MAX_ERRORS,
        })
    }

    pub fn with_interval_secs(mut self, secs: f64) -> Result<Self, ConfigError> {
        self.interval = interval_from_secs(secs)?;
        Ok(self)
    }

    pub fn with_max_errors(mut self, max_errors: u32) -> Result<Self, ConfigError> {
        if max_errors == 0 {
            return Err(ConfigError::InvalidMaxErrors(max_errors.to_string()));
        }
        self.max_errors = max_errors;
        Ok(self)
    }

    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - BEACON_PATH: status file location (default: status.db)
    /// - BEACON_INTERVAL: seconds between ticks (default: 1.0)
    /// - BEACON_MAX_ERRORS: consecutive failures before giving up (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("BEACON_PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut config = Self::new(path)?;

        if let Ok(raw) = std::env::var("BEACON_INTERVAL") {
            let secs: f64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidInterval(raw.clone()))?;
            config = config.with_interval_secs(secs)?;
        }

        if let Ok(raw) = std::env::var("BEACON_MAX_ERRORS") {
            let max_errors: u32 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidMaxErrors(raw.clone()))?;
            config = config.with_max_errors(max_errors)?;
        }

        Ok(config)
    }
}

fn interval_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::InvalidInterval(secs.to_string()));
    }
    Ok(Duration::from_millis((secs * 1000.0) as u64))
}
