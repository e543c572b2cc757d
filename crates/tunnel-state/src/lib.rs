//! Tunnel State - Connection Lifecycle Control
//!
//! Supervises the lifecycle of a single VPN tunnel connection
//! independent of the protocol (OpenVPN, WireGuard) behind it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Connection                          │
//! │                                                           │
//! │  ┌──────────┐  is_stop()   ┌─────────────────┐            │
//! │  │ Run loop │─────────────▶│ ConnectionState │◀── stop()  │
//! │  └──────────┘  heartbeat   │  Running        │            │
//! │                            │  Stopping       │◀── close() │
//! │                            │  Closed         │            │
//! │                            └───────┬─────────┘            │
//! │                 last check │       │ release               │
//! │              ┌─────────────▼──┐ ┌──▼────────────┐          │
//! │              │    Watchdog    │ │ CloseNotifier │◀─ wait() │
//! │              └────────────────┘ └───────────────┘          │
//! └──────────────────────────────────────────────────────────┘
//!                      ▲
//!                      │ is_shutdown()
//!              ┌───────┴───────┐
//!              │ ShutdownFlag  │  (process-wide)
//!              └───────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Idempotent stop/close**: concurrent requests collapse into one effect
//! - **Close fan-out**: every waiter registered before close is released once
//! - **Liveness**: a stalled `is_stop()` heartbeat is surfaced as a diagnostic
//!
//! # Usage
//!
//! ```rust,ignore
//! let conn = Connection::new(profile, Options::default())?;
//! conn.set_connecting();
//! conn.state().pre_start().await;
//!
//! while !conn.state().is_stop() {
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//! }
//!
//! cleanup(conn.state().take_paths());
//! conn.state().close();
//! ```

mod connection;
mod error;
mod events;
mod health;
mod notifier;
mod options;
pub mod shutdown;
mod state;
mod watchdog;

pub use connection::{
    Connection, ConnectionFields, ConnectionId, ConnectionStatus, Profile, ProfileMode,
};
pub use error::{ConfigError, StateError};
pub use events::{EventSink, RecordedEvent, RecordingSink, StateEvent, TracingSink};
pub use health::{CheckTrace, HealthCheck};
pub use notifier::{CloseNotifier, CloseWaiter};
pub use options::{Options, StateTimings};
pub use shutdown::ShutdownFlag;
pub use state::{ConnectionState, Phase, StateBuilder, StateSnapshot};
pub use watchdog::StallDetector;
