//! Watchdog task for detecting a stalled connection run loop.
//!
//! A run loop that stops calling `is_stop()` looks exactly like a hung
//! tunnel process. The watchdog turns that silence into a diagnostic;
//! it never stops the connection itself.

use crate::health::HealthCheck;
use std::sync::Weak;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Something the watchdog can observe.
pub(crate) trait Monitored: Send + Sync + 'static {
    /// The most recent health check.
    fn last_health_check(&self) -> HealthCheck;

    /// Report that the health check went silent.
    fn report_stall(&self, check: &HealthCheck);
}

/// Decides when silence has lasted long enough to report.
///
/// After an alarm the clock restarts, so continued silence produces one
/// alarm per threshold interval instead of one per tick.
#[derive(Debug, Clone)]
pub struct StallDetector {
    threshold: Duration,
    last_alarm: Option<Instant>,
}

impl StallDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_alarm: None,
        }
    }

    /// Check whether `now` is a stall given the last health check.
    pub fn observe(&mut self, last_check: Instant, now: Instant) -> bool {
        let reference = match self.last_alarm {
            Some(alarm) if alarm > last_check => alarm,
            _ => last_check,
        };

        if now.saturating_duration_since(reference) > self.threshold {
            self.last_alarm = Some(now);
            true
        } else {
            false
        }
    }
}

/// Spawn the watchdog task.
///
/// The task ends when `cancel` fires or when the target is dropped.
pub(crate) fn spawn_watchdog<T: Monitored>(
    handle: &Handle,
    target: Weak<T>,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    handle.spawn(async move {
        debug!("Watchdog started");
        run_watchdog_loop(target, interval, threshold, cancel).await;
        debug!("Watchdog stopped");
    })
}

async fn run_watchdog_loop<T: Monitored>(
    target: Weak<T>,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut detector = StallDetector::new(threshold);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(target) = target.upgrade() else {
            break;
        };

        let check = target.last_health_check();
        if detector.observe(check.at, Instant::now()) {
            target.report_stall(&check);
        }
    }
}
