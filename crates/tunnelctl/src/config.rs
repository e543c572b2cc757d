//! Supervisor Configuration
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! heartbeat_ms = 1000
//! temp_dir = "/tmp/tunnelctl"
//!
//! [timings]
//! pre_start_delay_ms = 3000
//! stale_threshold_ms = 60000
//!
//! [[connections]]
//! run_for_ms = 30000
//! options = { delay = true, automatic = true }
//! profile = { id = "5f3c", name = "office", mode = "wg" }
//! ```

use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunnel_state::{Options, Profile, StateTimings};

/// One supervised connection
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub profile: Profile,
    #[serde(default)]
    pub options: Options,
    /// Stop the connection after this long (runs until shutdown if unset)
    #[serde(default)]
    pub run_for_ms: Option<u64>,
}

impl ConnectionConfig {
    pub fn run_for(&self) -> Option<Duration> {
        self.run_for_ms.map(Duration::from_millis)
    }
}

/// Complete supervisor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection state timings
    pub timings: StateTimings,
    /// Where per-connection temp files are written
    pub temp_dir: PathBuf,
    /// Run loop health-check period
    pub heartbeat_ms: u64,
    pub connections: Vec<ConnectionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timings: StateTimings::default(),
            temp_dir: std::env::temp_dir().join("tunnelctl"),
            heartbeat_ms: 1000,
            connections: Vec::new(),
        }
    }
}

impl Config {
    /// Configuration with a single demo profile
    pub fn demo() -> Self {
        Self {
            connections: vec![ConnectionConfig {
                profile: Profile {
                    id: "demo".to_string(),
                    name: "Demo Profile".to_string(),
                    reconnect: true,
                    ..Default::default()
                },
                options: Options::default(),
                run_for_ms: None,
            }],
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load a configuration file, falling back to the demo config if it
    /// does not exist
    pub fn load_or_demo(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(Self::demo())
            }
            other => other,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timings.validate()?;
        if self.heartbeat_ms == 0 {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.connections.is_empty() {
            return Err(ConfigError::NoConnections);
        }
        for entry in &self.connections {
            if !is_valid_profile_id(&entry.profile.id) {
                return Err(ConfigError::InvalidProfileId(entry.profile.id.clone()));
            }
        }
        Ok(())
    }
}

/// Profile ids end up in temp file names, so only plain name characters
/// are accepted.
fn is_valid_profile_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid timings: {0}")]
    Timings(#[from] tunnel_state::ConfigError),

    #[error("Heartbeat must be non-zero")]
    ZeroHeartbeat,

    #[error("No connections configured")]
    NoConnections,

    #[error("Invalid profile id {0:?}")]
    InvalidProfileId(String),
}
