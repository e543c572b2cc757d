//! Connection State
//!
//! Lifecycle control for one tunnel connection: start-up delay, stop
//! requests, the health-check heartbeat, temp path bookkeeping and the
//! close fan-out.
//!
//! # Phases
//!
//! ```text
//!   Running ──stop()──▶ Stopping ──close()──▶ Closed
//!      │                                        ▲
//!      └──────────────────close()───────────────┘
//! ```
//!
//! Transitions only move forward. A repeated `stop()` is reported as a
//! diagnostic; a repeated `close()` is silent.

use crate::connection::ConnectionFields;
use crate::error::StateError;
use crate::events::{EventSink, StateEvent, TracingSink};
use crate::health::{CheckTrace, HealthCheck};
use crate::notifier::{CloseNotifier, CloseWaiter};
use crate::options::{Options, StateTimings};
use crate::shutdown::{self, ShutdownFlag};
use crate::watchdog::{Monitored, spawn_watchdog};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle phase of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Phase {
    /// Connection should keep running
    Running = 0,
    /// Stop requested, run loop is winding down
    Stopping = 1,
    /// Teardown finished, waiters released
    Closed = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Running,
            1 => Phase::Stopping,
            _ => Phase::Closed,
        }
    }

    /// Check if the connection should keep running
    pub fn is_running(&self) -> bool {
        matches!(self, Phase::Running)
    }

    /// Check if teardown has finished
    pub fn is_closed(&self) -> bool {
        matches!(self, Phase::Closed)
    }
}

/// Serializable view of a connection state for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub state_time: DateTime<Local>,
    pub state_stop: bool,
    pub state_deadline: bool,
    pub state_delay: bool,
    pub state_automatic: bool,
    pub state_closed: bool,
    pub state_temp_paths: Vec<PathBuf>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    fields: ConnectionFields,
    options: Options,
    timings: StateTimings,
    start_time: DateTime<Local>,
    started_at: Instant,
    phase: AtomicU8,
    last_check: Mutex<HealthCheck>,
    temp_paths: Mutex<Vec<PathBuf>>,
    notifier: CloseNotifier,
    watchdog: CancellationToken,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<ShutdownFlag>,
    sink: Arc<dyn EventSink>,
}

impl Shared {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn emit(&self, event: StateEvent) {
        self.sink.emit(&self.fields, &event);
    }

    fn stop_watchdog(&self) {
        if let Some(task) = lock(&self.watchdog_task).take() {
            // Only a panic ends the task while the state is still open
            if task.is_finished() {
                warn!(
                    connection_id = %self.fields.connection_id,
                    "state: Watchdog exited before close"
                );
            }
        }
        self.watchdog.cancel();
    }
}

impl Monitored for Shared {
    fn last_health_check(&self) -> HealthCheck {
        lock(&self.last_check).clone()
    }

    fn report_stall(&self, check: &HealthCheck) {
        self.emit(StateEvent::DeadState {
            last_check: check.wall,
            trace: check.trace.to_string(),
        });
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.watchdog.cancel();
        let task = self
            .watchdog_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Builder for [`ConnectionState`]
///
/// Defaults: [`StateTimings::default`], [`TracingSink`], the process-wide
/// shutdown flag and detached connection fields.
pub struct StateBuilder {
    timings: StateTimings,
    sink: Arc<dyn EventSink>,
    shutdown: Arc<ShutdownFlag>,
    fields: ConnectionFields,
}

impl StateBuilder {
    pub fn timings(mut self, timings: StateTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use a private shutdown flag instead of the process-wide one
    pub fn shutdown_flag(mut self, shutdown: Arc<ShutdownFlag>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Identity attached to every diagnostic
    pub fn fields(mut self, fields: ConnectionFields) -> Self {
        self.fields = fields;
        self
    }

    /// Initialize the state and start its watchdog
    ///
    /// Must be called from within a tokio runtime.
    #[track_caller]
    pub fn init(self, options: Options) -> Result<ConnectionState, StateError> {
        self.timings.validate()?;
        let handle = Handle::try_current().map_err(|_| StateError::NoRuntime)?;

        let check = HealthCheck::now(CheckTrace::capture());
        let shared = Arc::new(Shared {
            fields: self.fields,
            options,
            timings: self.timings,
            start_time: check.wall,
            started_at: check.at,
            phase: AtomicU8::new(Phase::Running as u8),
            last_check: Mutex::new(check),
            temp_paths: Mutex::new(Vec::new()),
            notifier: CloseNotifier::new(),
            watchdog: CancellationToken::new(),
            watchdog_task: Mutex::new(None),
            shutdown: self.shutdown,
            sink: self.sink,
        });

        let task = spawn_watchdog(
            &handle,
            Arc::downgrade(&shared),
            shared.timings.watchdog_interval,
            shared.timings.stale_threshold,
            shared.watchdog.clone(),
        );
        *lock(&shared.watchdog_task) = Some(task);

        debug!(
            connection_id = %shared.fields.connection_id,
            deadline = options.deadline,
            delay = options.delay,
            automatic = options.automatic,
            "state: Initialized"
        );

        Ok(ConnectionState { shared })
    }
}

/// Lifecycle state of one connection
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct ConnectionState {
    shared: Arc<Shared>,
}

impl ConnectionState {
    /// Start building a state with non-default collaborators
    pub fn builder() -> StateBuilder {
        StateBuilder {
            timings: StateTimings::default(),
            sink: Arc::new(TracingSink),
            shutdown: shutdown::global(),
            fields: ConnectionFields::detached(),
        }
    }

    /// Initialize a state with default collaborators
    #[track_caller]
    pub fn init(options: Options) -> Result<Self, StateError> {
        Self::builder().init(options)
    }

    /// Wait out the start-up grace interval for delayed starts
    pub async fn pre_start(&self) {
        if self.shared.options.delay {
            tokio::time::sleep(self.shared.timings.pre_start_delay).await;
        }
    }

    /// Check if the connection should stop
    ///
    /// Also records this call as the latest health check.
    #[track_caller]
    pub fn is_stop(&self) -> bool {
        let check = HealthCheck::now(CheckTrace::capture());
        *lock(&self.shared.last_check) = check;

        self.shared.shutdown.is_shutdown() || !self.phase().is_running()
    }

    /// Request that the connection stop
    ///
    /// Only flips the phase; the run loop tears down once it sees
    /// `is_stop()` return true.
    pub fn stop(&self) {
        let result = self.shared.phase.compare_exchange(
            Phase::Running as u8,
            Phase::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        match result {
            Ok(_) => debug!(
                connection_id = %self.shared.fields.connection_id,
                "state: Stop requested"
            ),
            Err(_) => self.shared.emit(StateEvent::AlreadyStopping),
        }
    }

    /// Register a temporary path for cleanup at teardown
    pub fn add_path(&self, path: impl Into<PathBuf>) {
        lock(&self.shared.temp_paths).push(path.into());
    }

    /// Registered temp paths, in registration order
    pub fn paths(&self) -> Vec<PathBuf> {
        lock(&self.shared.temp_paths).clone()
    }

    /// Hand the registered temp paths over to teardown
    ///
    /// Leaves the list empty.
    pub fn take_paths(&self) -> Vec<PathBuf> {
        mem::take(&mut *lock(&self.shared.temp_paths))
    }

    /// Mark the connection closed and release every close waiter
    pub fn close(&self) {
        let shared = &self.shared;
        let released = shared.notifier.close_with(|| {
            let prev = shared.phase.swap(Phase::Closed as u8, Ordering::AcqRel);
            debug_assert_ne!(prev, Phase::Closed as u8);
        });

        if let Some(released) = released {
            shared.stop_watchdog();
            shared.emit(StateEvent::Closed { released });
        }
    }

    /// Wait until the connection is closed
    ///
    /// Returns at once if already closed. Otherwise returns a short grace
    /// interval after `close()`.
    pub async fn close_wait(&self) {
        self.shared.notifier.wait(self.shared.timings.close_grace).await
    }

    /// Register a close waiter now and await it later
    pub fn close_waiter(&self) -> CloseWaiter {
        self.shared.notifier.waiter(self.shared.timings.close_grace)
    }

    /// Number of close waiters not yet released
    pub fn pending_waiters(&self) -> usize {
        self.shared.notifier.pending()
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn is_closed(&self) -> bool {
        self.phase().is_closed()
    }

    pub fn is_automatic(&self) -> bool {
        self.shared.options.automatic
    }

    pub fn is_deadline(&self) -> bool {
        self.shared.options.deadline
    }

    pub fn is_delay(&self) -> bool {
        self.shared.options.delay
    }

    pub fn fields(&self) -> &ConnectionFields {
        &self.shared.fields
    }

    /// Wall-clock time the state was initialized
    pub fn start_time(&self) -> DateTime<Local> {
        self.shared.start_time
    }

    /// Time since the state was initialized
    pub fn uptime(&self) -> Duration {
        self.shared.started_at.elapsed()
    }

    /// The most recent health check
    pub fn last_health_check(&self) -> HealthCheck {
        self.shared.last_health_check()
    }

    pub(crate) fn emit(&self, event: StateEvent) {
        self.shared.emit(event);
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let phase = self.phase();
        StateSnapshot {
            state_time: self.shared.start_time,
            state_stop: !phase.is_running(),
            state_deadline: self.shared.options.deadline,
            state_delay: self.shared.options.delay,
            state_automatic: self.shared.options.automatic,
            state_closed: phase.is_closed(),
            state_temp_paths: self.paths(),
        }
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("connection_id", &self.shared.fields.connection_id)
            .field("phase", &self.phase())
            .field("options", &self.shared.options)
            .finish()
    }
}
