//! Process-Wide Shutdown Flag
//!
//! A single switch that tells every connection in the process to stop,
//! independent of each connection's own stop request.
//!
//! # Usage
//!
//! ```rust,ignore
//! // Signal handler:
//! tunnel_state::shutdown::set_shutdown();
//!
//! // Every connection's run loop:
//! if state.is_stop() {
//!     break;
//! }
//! ```

use once_cell::sync::Lazy;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

static GLOBAL: Lazy<Arc<ShutdownFlag>> = Lazy::new(|| Arc::new(ShutdownFlag::new()));

/// Get the process-wide shutdown flag
pub fn global() -> Arc<ShutdownFlag> {
    GLOBAL.clone()
}

/// Request shutdown of every connection in the process
pub fn set_shutdown() -> bool {
    GLOBAL.set_shutdown()
}

/// Check the process-wide shutdown flag
pub fn is_shutdown() -> bool {
    GLOBAL.is_shutdown()
}

/// Shutdown switch shared by many connections
///
/// Read on every health check, so reads are a single atomic load.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    set: AtomicBool,
}

impl ShutdownFlag {
    /// Create an unset flag
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
        }
    }

    /// Set the flag
    ///
    /// Returns true only for the call that performed the transition.
    pub fn set_shutdown(&self) -> bool {
        let first = !self.set.swap(true, Ordering::SeqCst);
        if first {
            info!("shutdown: Process shutdown requested");
        }
        first
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Reset the flag
    ///
    /// Only meaningful for private flags; the process-wide flag is never
    /// cleared by the supervisor.
    pub fn clear(&self) {
        self.set.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_starts_unset() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_shutdown());
    }

    #[test]
    fn test_set_is_idempotent() {
        let flag = ShutdownFlag::new();

        assert!(flag.set_shutdown());
        assert!(!flag.set_shutdown());
        assert!(flag.is_shutdown());
    }

    #[test]
    fn test_clear() {
        let flag = ShutdownFlag::new();
        flag.set_shutdown();
        flag.clear();

        assert!(!flag.is_shutdown());
        assert!(flag.set_shutdown());
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&global(), &global()));
    }
}
