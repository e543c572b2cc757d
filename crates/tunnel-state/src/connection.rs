//! Connection
//!
//! One tunnel attempt for one profile. Owns exactly one
//! [`ConnectionState`] and supplies the identity attached to its
//! diagnostics.

use crate::error::StateError;
use crate::events::StateEvent;
use crate::options::Options;
use crate::state::{ConnectionState, StateBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::info;

/// Global connection ID counter
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique connection ID.
fn next_connection_id() -> ConnectionId {
    ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

/// Tunnel protocol behind a profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileMode {
    /// OpenVPN
    #[default]
    Ovpn,
    /// WireGuard
    Wg,
}

impl fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileMode::Ovpn => write!(f, "ovpn"),
            ProfileMode::Wg => write!(f, "wg"),
        }
    }
}

/// Profile configuration
///
/// The connection only reads these as flags; acting on them belongs to
/// the tunnel, routing and auth layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub mode: ProfileMode,
    pub dynamic_firewall: bool,
    pub device_auth: bool,
    pub disable_gateway: bool,
    pub disable_dns: bool,
    pub geo_sort: String,
    pub force_connect: bool,
    pub force_dns: bool,
    pub sso_auth: bool,
    pub reconnect: bool,
}

/// Connection status as shown to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionStatus {
    /// Check if the tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Identity attached to every diagnostic of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionFields {
    pub connection_id: ConnectionId,
    pub profile_id: String,
    pub profile_name: String,
    pub mode: ProfileMode,
}

impl ConnectionFields {
    pub fn new(connection_id: ConnectionId, profile: &Profile) -> Self {
        Self {
            connection_id,
            profile_id: profile.id.clone(),
            profile_name: profile.name.clone(),
            mode: profile.mode,
        }
    }

    /// Fields for a state not owned by any connection
    pub fn detached() -> Self {
        Self {
            connection_id: ConnectionId::new(0),
            profile_id: String::new(),
            profile_name: String::new(),
            mode: ProfileMode::default(),
        }
    }
}

/// A tunnel connection for one profile
pub struct Connection {
    id: ConnectionId,
    profile: Profile,
    status: RwLock<ConnectionStatus>,
    state: ConnectionState,
}

impl Connection {
    /// Create a connection with default state collaborators
    #[track_caller]
    pub fn new(profile: Profile, options: Options) -> Result<Self, StateError> {
        Self::with_state(profile, ConnectionState::builder(), options)
    }

    /// Create a connection, initializing its state from `builder`
    ///
    /// The builder's fields are replaced with this connection's identity.
    #[track_caller]
    pub fn with_state(
        profile: Profile,
        builder: StateBuilder,
        options: Options,
    ) -> Result<Self, StateError> {
        let id = next_connection_id();
        let state = builder
            .fields(ConnectionFields::new(id, &profile))
            .init(options)?;

        Ok(Self {
            id,
            profile,
            status: RwLock::new(ConnectionStatus::Disconnected),
            state,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn fields(&self) -> &ConnectionFields {
        self.state.fields()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Announce that negotiation is starting with this profile
    pub fn set_connecting(&self) {
        self.state.emit(StateEvent::Connecting {
            profile: self.profile.clone(),
        });
        self.set_status(ConnectionStatus::Connecting);
    }

    pub fn set_connected(&self) {
        info!(
            connection_id = %self.id,
            profile_id = %self.profile.id,
            "profile: Connected"
        );
        self.set_status(ConnectionStatus::Connected);
    }

    pub fn set_disconnecting(&self) {
        self.set_status(ConnectionStatus::Disconnecting);
    }

    pub fn set_disconnected(&self) {
        info!(
            connection_id = %self.id,
            profile_id = %self.profile.id,
            "profile: Disconnected"
        );
        self.set_status(ConnectionStatus::Disconnected);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("profile_id", &self.profile.id)
            .field("status", &self.status())
            .field("state", &self.state)
            .finish()
    }
}
