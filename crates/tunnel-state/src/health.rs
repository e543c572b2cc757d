//! Health-check bookkeeping.
//!
//! Every `is_stop()` call doubles as a heartbeat. The watchdog only reads
//! the most recent one, so a single record is kept per connection.

use chrono::{DateTime, Local};
use std::fmt;
use std::panic::Location;
use std::thread;
use tokio::time::Instant;

/// Format used for wall-clock timestamps in diagnostics.
pub(crate) const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Where a health check was made from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTrace {
    location: &'static Location<'static>,
    thread: Option<String>,
}

impl CheckTrace {
    /// Capture the caller's source location and thread name.
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
            thread: thread::current().name().map(str::to_owned),
        }
    }

    /// Source location of the check.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Name of the thread the check ran on, if it has one.
    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }
}

impl fmt::Display for CheckTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}:{}",
            self.thread.as_deref().unwrap_or("<unnamed>"),
            self.location.file(),
            self.location.line(),
            self.location.column()
        )
    }
}

/// The most recent health check.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Monotonic time of the check
    pub at: Instant,
    /// Wall-clock time of the check
    pub wall: DateTime<Local>,
    /// Caller of the check
    pub trace: CheckTrace,
}

impl HealthCheck {
    pub(crate) fn now(trace: CheckTrace) -> Self {
        Self {
            at: Instant::now(),
            wall: Local::now(),
            trace,
        }
    }

    /// Wall-clock time formatted for logs.
    pub fn wall_formatted(&self) -> String {
        self.wall.format(TIME_FORMAT).to_string()
    }
}
