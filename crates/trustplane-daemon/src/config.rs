//! Runtime configuration for the rotation subsystem.
//!
//! Loading this from disk or the environment belongs to the outer daemon;
//! this module only defines the shape, the defaults and the bounds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default grace period for staged rotations (48 hours).
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(48 * 60 * 60);

/// Default TTL of generated TLS certificate authorities (10 years).
pub const DEFAULT_CA_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Default auto-rotation worker tick interval (30 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum worker tick interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum worker tick interval; anything slower risks missing a schedule
/// segment entirely.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Errors produced by configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The poll interval is outside the accepted bounds.
    #[error("poll interval {actual} is out of bounds [{min}, {max}]")]
    PollIntervalOutOfBounds {
        /// Configured value.
        actual: String,
        /// Lower bound.
        min: String,
        /// Upper bound.
        max: String,
    },

    /// A duration that must be positive is zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// The offending field.
        field: &'static str,
    },
}

/// Configuration of the rotation driver and worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotationConfig {
    /// Grace period applied when a rotation request does not carry one.
    #[serde(default = "default_grace_period")]
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// TTL of TLS certificate authorities generated when a rotation
    /// starts.
    #[serde(default = "default_ca_ttl")]
    #[serde(with = "humantime_serde")]
    pub ca_ttl: Duration,

    /// Tick interval of the auto-rotation worker.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

const fn default_grace_period() -> Duration {
    DEFAULT_GRACE_PERIOD
}

const fn default_ca_ttl() -> Duration {
    DEFAULT_CA_TTL
}

const fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            ca_ttl: DEFAULT_CA_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl RotationConfig {
    /// Checks the configuration bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grace_period.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "grace_period",
            });
        }
        if self.ca_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "ca_ttl" });
        }
        if self.poll_interval < MIN_POLL_INTERVAL || self.poll_interval > MAX_POLL_INTERVAL {
            return Err(ConfigError::PollIntervalOutOfBounds {
                actual: humantime::format_duration(self.poll_interval).to_string(),
                min: humantime::format_duration(MIN_POLL_INTERVAL).to_string(),
                max: humantime::format_duration(MAX_POLL_INTERVAL).to_string(),
            });
        }
        Ok(())
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
