//! Diagnostic events.
//!
//! The state machine reports through an [`EventSink`] instead of
//! returning errors. [`TracingSink`] forwards to `tracing`;
//! [`RecordingSink`] keeps events in memory for inspection.

use crate::connection::{ConnectionFields, Profile};
use crate::health::TIME_FORMAT;
use chrono::{DateTime, Local};
use std::sync::{Mutex, PoisonError};
use tracing::Level;

/// Something worth telling an operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    /// `stop()` called while a stop is already pending
    AlreadyStopping,
    /// Health check has been silent past the stale threshold
    DeadState {
        /// Wall-clock time of the last health check
        last_check: DateTime<Local>,
        /// Caller of the last health check
        trace: String,
    },
    /// Connection is starting to negotiate with this profile
    Connecting { profile: Profile },
    /// Connection closed and its waiters were released
    Closed { released: usize },
}

impl StateEvent {
    /// Severity of the event
    pub fn level(&self) -> Level {
        match self {
            StateEvent::AlreadyStopping
            | StateEvent::DeadState { .. }
            | StateEvent::Connecting { .. } => Level::INFO,
            StateEvent::Closed { .. } => Level::DEBUG,
        }
    }

    /// Log message for the event
    pub fn message(&self) -> &'static str {
        match self {
            StateEvent::AlreadyStopping => "state: Profile already in stop",
            StateEvent::DeadState { .. } => "state: Detected dead state",
            StateEvent::Connecting { .. } => "profile: Connecting",
            StateEvent::Closed { .. } => "state: Connection closed",
        }
    }

    /// Check if this is a dead state report
    pub fn is_dead_state(&self) -> bool {
        matches!(self, StateEvent::DeadState { .. })
    }
}

/// Receiver of diagnostic events.
pub trait EventSink: Send + Sync {
    /// Record one event with the connection it belongs to.
    fn emit(&self, fields: &ConnectionFields, event: &StateEvent);
}

/// Sink that writes events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

/// `tracing::event!` needs a constant level, so dispatch on the runtime one.
macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {{
        let level = $level;
        if level == Level::ERROR {
            tracing::event!(Level::ERROR, $($arg)+)
        } else if level == Level::WARN {
            tracing::event!(Level::WARN, $($arg)+)
        } else if level == Level::INFO {
            tracing::event!(Level::INFO, $($arg)+)
        } else if level == Level::DEBUG {
            tracing::event!(Level::DEBUG, $($arg)+)
        } else {
            tracing::event!(Level::TRACE, $($arg)+)
        }
    }};
}

impl EventSink for TracingSink {
    fn emit(&self, fields: &ConnectionFields, event: &StateEvent) {
        let level = event.level();
        let message = event.message();
        match event {
            StateEvent::AlreadyStopping => {
                event_at!(
                    level,
                    connection_id = %fields.connection_id,
                    profile_id = %fields.profile_id,
                    profile_name = %fields.profile_name,
                    mode = %fields.mode,
                    "{}", message
                );
            }
            StateEvent::DeadState { last_check, trace } => {
                event_at!(
                    level,
                    connection_id = %fields.connection_id,
                    profile_id = %fields.profile_id,
                    profile_name = %fields.profile_name,
                    mode = %fields.mode,
                    last_stop_check = %last_check.format(TIME_FORMAT),
                    trace = %trace,
                    "{}", message
                );
            }
            StateEvent::Connecting { profile } => {
                event_at!(
                    level,
                    profile_id = %profile.id,
                    mode = %profile.mode,
                    dynamic_firewall = profile.dynamic_firewall,
                    device_auth = profile.device_auth,
                    disable_gateway = profile.disable_gateway,
                    disable_dns = profile.disable_dns,
                    geo_sort = %profile.geo_sort,
                    force_connect = profile.force_connect,
                    force_dns = profile.force_dns,
                    sso_auth = profile.sso_auth,
                    reconnect = profile.reconnect,
                    "{}", message
                );
            }
            StateEvent::Closed { released } => {
                event_at!(
                    level,
                    connection_id = %fields.connection_id,
                    profile_id = %fields.profile_id,
                    released = *released,
                    "{}", message
                );
            }
        }
    }
}

/// An event captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub fields: ConnectionFields,
    pub event: StateEvent,
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&StateEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| pred(&r.event))
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, fields: &ConnectionFields, event: &StateEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                fields: fields.clone(),
                event: event.clone(),
            });
    }
}
