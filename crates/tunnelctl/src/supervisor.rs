//! Connection supervisor - runs one loop per configured connection.
//!
//! Each run loop announces the connection, waits out a delayed start,
//! writes its temp files, then heartbeats through `is_stop()` until it
//! is asked to stop. Teardown always runs: temp paths are cleaned up
//! and the state is closed so that `close_wait()` callers are released.

use crate::cleanup::TempPathCleaner;
use crate::config::{Config, ConnectionConfig};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tunnel_state::{Connection, ConnectionState, ShutdownFlag, shutdown};

/// Runs and tears down all configured connections.
pub struct Supervisor {
    config: Config,
    shutdown: Arc<ShutdownFlag>,
    connections: Vec<(Arc<Connection>, Option<Duration>)>,
}

impl Supervisor {
    /// Create a supervisor bound to the process-wide shutdown flag.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_shutdown_flag(config, shutdown::global())
    }

    /// Create a supervisor bound to a private shutdown flag.
    pub fn with_shutdown_flag(config: Config, flag: Arc<ShutdownFlag>) -> Result<Self> {
        config.validate()?;
        let connections = config
            .connections
            .iter()
            .map(|entry| Self::build_connection(&config, &flag, entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            shutdown: flag,
            connections,
        })
    }

    fn build_connection(
        config: &Config,
        flag: &Arc<ShutdownFlag>,
        entry: &ConnectionConfig,
    ) -> Result<(Arc<Connection>, Option<Duration>)> {
        let builder = ConnectionState::builder()
            .timings(config.timings)
            .shutdown_flag(flag.clone());
        let conn = Connection::with_state(entry.profile.clone(), builder, entry.options)
            .with_context(|| format!("Failed to initialize profile {}", entry.profile.id))?;
        Ok((Arc::new(conn), entry.run_for()))
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.iter().map(|(conn, _)| conn)
    }

    /// Spawn a run loop for every connection.
    pub fn spawn_all(&self) -> Vec<JoinHandle<()>> {
        self.connections
            .iter()
            .map(|(conn, run_for)| {
                let conn = conn.clone();
                let run_for = *run_for;
                let heartbeat = self.config.heartbeat();
                let temp_dir = self.config.temp_dir.clone();
                tokio::spawn(async move {
                    run_connection(conn, run_for, heartbeat, temp_dir).await;
                })
            })
            .collect()
    }

    /// Ask every connection to stop.
    pub fn shutdown(&self) {
        self.shutdown.set_shutdown();
    }

    /// Wait until every connection has closed.
    pub async fn wait_closed(&self) {
        for conn in self.connections() {
            conn.state().close_wait().await;
        }
    }
}

/// Run one connection from announcement to close.
pub async fn run_connection(
    conn: Arc<Connection>,
    run_for: Option<Duration>,
    heartbeat: Duration,
    temp_dir: PathBuf,
) {
    if let Err(e) = run_until_stop(&conn, run_for, heartbeat, &temp_dir).await {
        warn!(
            connection_id = %conn.id(),
            profile_id = %conn.profile().id,
            error = %e,
            "profile: Connection failed"
        );
        conn.state().stop();
    }

    teardown(&conn).await;
}

async fn run_until_stop(
    conn: &Connection,
    run_for: Option<Duration>,
    heartbeat: Duration,
    temp_dir: &Path,
) -> Result<()> {
    let state = conn.state();

    conn.set_connecting();
    state.pre_start().await;
    if state.is_stop() {
        return Ok(());
    }

    let profile_path = write_profile(conn, temp_dir).await?;
    state.add_path(profile_path);

    conn.set_connected();

    let started = Instant::now();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !state.is_stop() {
        if let Some(limit) = run_for {
            if started.elapsed() >= limit {
                info!(connection_id = %conn.id(), "profile: Run time elapsed");
                state.stop();
                continue;
            }
        }
        ticker.tick().await;
    }

    Ok(())
}

/// Write the profile snapshot a tunnel process would be started with.
async fn write_profile(conn: &Connection, temp_dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(temp_dir)
        .await
        .with_context(|| format!("Failed to create {}", temp_dir.display()))?;

    let path = temp_dir.join(format!("profile-{}-{}.json", conn.profile().id, conn.id().0));
    let body = serde_json::to_vec_pretty(&ProfileFile {
        profile: conn.profile(),
        state: conn.state().snapshot(),
    })?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(path)
}

#[derive(serde::Serialize)]
struct ProfileFile<'a> {
    profile: &'a tunnel_state::Profile,
    state: tunnel_state::StateSnapshot,
}

async fn teardown(conn: &Connection) {
    let state = conn.state();
    conn.set_disconnecting();

    let report = TempPathCleaner::new().cleanup(state.take_paths()).await;
    debug!(
        connection_id = %conn.id(),
        removed = report.removed.len(),
        missing = report.missing.len(),
        "profile: Temp paths cleaned up"
    );
    if !report.is_clean() {
        warn!(
            connection_id = %conn.id(),
            failed = report.failed.len(),
            "profile: Temp path cleanup incomplete"
        );
    }

    state.close();
    conn.set_disconnected();
    info!(
        connection_id = %conn.id(),
        uptime_ms = state.uptime().as_millis() as u64,
        "profile: Disconnected"
    );
}
