//! Connection Options
//!
//! Mode flags supplied by the caller at init, and the fixed intervals
//! that drive start-up delay, liveness checks and close settling.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-connection mode flags
///
/// Fixed once the state is initialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Connection must be established before a deadline
    pub deadline: bool,
    /// Wait before negotiating (reconnect after a network change)
    pub delay: bool,
    /// Started automatically rather than by the user
    pub automatic: bool,
}

impl Options {
    /// Options for an automatic reconnect attempt
    pub fn reconnect() -> Self {
        Self {
            deadline: false,
            delay: true,
            automatic: true,
        }
    }
}

/// Timing configuration for a connection state
///
/// Durations are written in milliseconds in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTimings {
    /// Grace interval before a delayed start proceeds
    #[serde(rename = "pre_start_delay_ms", with = "millis")]
    pub pre_start_delay: Duration,
    /// How often the watchdog wakes
    #[serde(rename = "watchdog_interval_ms", with = "millis")]
    pub watchdog_interval: Duration,
    /// Silence longer than this is reported as a dead state
    #[serde(rename = "stale_threshold_ms", with = "millis")]
    pub stale_threshold: Duration,
    /// Settle time after a close wait is released
    #[serde(rename = "close_grace_ms", with = "millis")]
    pub close_grace: Duration,
}

impl Default for StateTimings {
    fn default() -> Self {
        Self {
            pre_start_delay: Duration::from_secs(3),
            watchdog_interval: Duration::from_secs(1),
            stale_threshold: Duration::from_secs(60),
            close_grace: Duration::from_millis(50),
        }
    }
}

impl StateTimings {
    /// Validate timings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog_interval.is_zero() {
            return Err(ConfigError::ZeroWatchdogInterval);
        }
        if self.stale_threshold < self.watchdog_interval {
            return Err(ConfigError::ThresholdTooShort {
                threshold_ms: self.stale_threshold.as_millis() as u64,
                interval_ms: self.watchdog_interval.as_millis() as u64,
            });
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
