//! Release engine configuration.
//!
//! # Responsibility
//! - Load DP and scheduling parameters from TOML.
//! - Reject unusable parameter sets before the scheduler starts.
//!
//! # Invariants
//! - A `ReleaseConfig` handed to the scheduler has passed `validate()`.
//! - `epsilon_per_query <= lifetime_epsilon_cap`.

use crate::model::ledger::EPSILON_TOLERANCE;
use crate::model::window::WindowGrid;
use crate::noise::DEFAULT_CONFIDENCE;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Startup configuration failure. Fatal: the scheduler refuses to run.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(String),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "unable to read config `{}`: {source}", path.display())
            }
            Self::Parse(details) => write!(f, "failed to parse config: {details}"),
            Self::Invalid(details) => write!(f, "configuration invalid: {details}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(_) => None,
            Self::Invalid(_) => None,
        }
    }
}

/// DP and scheduling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReleaseConfig {
    /// Length of one release window.
    #[serde(default = "default_window_length_secs")]
    pub window_length_secs: u64,
    /// Grid anchor; windows start at `origin + k * length`. Epoch seconds.
    #[serde(default)]
    pub window_origin_secs: i64,
    /// Minimum true count before any noisy value is released.
    #[serde(default = "default_threshold")]
    pub threshold: i64,
    /// Cost of one fresh noisy release.
    #[serde(default = "default_epsilon_per_query")]
    pub epsilon_per_query: f64,
    /// Lifetime epsilon an item may ever consume.
    #[serde(default = "default_lifetime_epsilon_cap")]
    pub lifetime_epsilon_cap: f64,
    /// Confidence level of published intervals.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Sleep between scheduler ticks in `run` mode.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const fn default_window_length_secs() -> u64 {
    24 * 60 * 60
}

const fn default_threshold() -> i64 {
    1
}

const fn default_epsilon_per_query() -> f64 {
    0.5
}

const fn default_lifetime_epsilon_cap() -> f64 {
    20.0
}

const fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

const fn default_fetch_timeout_ms() -> u64 {
    2_000
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            window_length_secs: default_window_length_secs(),
            window_origin_secs: 0,
            threshold: default_threshold(),
            epsilon_per_query: default_epsilon_per_query(),
            lifetime_epsilon_cap: default_lifetime_epsilon_cap(),
            confidence: default_confidence(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ReleaseConfig {
    /// Reads, parses and validates a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.window_length_secs == 0 {
            return Err(ConfigError::Invalid(
                "window-length-secs must be greater than zero".into(),
            ));
        }
        if self.threshold <= 0 {
            return Err(ConfigError::Invalid(format!(
                "threshold must be positive, got {}",
                self.threshold
            )));
        }
        if !self.epsilon_per_query.is_finite() || self.epsilon_per_query <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "epsilon-per-query must be positive, got {}",
                self.epsilon_per_query
            )));
        }
        if !self.lifetime_epsilon_cap.is_finite() || self.lifetime_epsilon_cap <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "lifetime-epsilon-cap must be positive, got {}",
                self.lifetime_epsilon_cap
            )));
        }
        if self.epsilon_per_query > self.lifetime_epsilon_cap + EPSILON_TOLERANCE {
            return Err(ConfigError::Invalid(format!(
                "epsilon-per-query {} exceeds lifetime-epsilon-cap {}",
                self.epsilon_per_query, self.lifetime_epsilon_cap
            )));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "confidence must be within (0, 1), got {}",
                self.confidence
            )));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "fetch-timeout-ms must be greater than zero".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll-interval-ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn window_grid(&self) -> WindowGrid {
        let length_ms = i64::try_from(self.window_length_secs)
            .unwrap_or(i64::MAX / 1_000)
            .saturating_mul(1_000);
        WindowGrid::new(self.window_origin_secs.saturating_mul(1_000), length_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `floor(cap / epsilon_per_query)`: fresh releases an item can ever get.
    pub fn max_fresh_generations(&self) -> u32 {
        ((self.lifetime_epsilon_cap + EPSILON_TOLERANCE) / self.epsilon_per_query).floor() as u32
    }
}
