//! Error types
//!
//! Lifecycle calls never fail: redundant stops, redundant closes and
//! stale health checks are reported through the event sink. Only
//! construction and configuration can return an error.

/// Connection state errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("No tokio runtime available to run the watchdog")]
    NoRuntime,

    #[error("Invalid timings: {0}")]
    Config(#[from] ConfigError),
}

/// Timing configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Watchdog interval must be non-zero")]
    ZeroWatchdogInterval,

    #[error("Stale threshold ({threshold_ms}ms) shorter than watchdog interval ({interval_ms}ms)")]
    ThresholdTooShort { threshold_ms: u64, interval_ms: u64 },
}
