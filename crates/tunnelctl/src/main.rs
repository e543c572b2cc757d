//! tunnelctl: VPN connection supervisor
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! loads the connection profiles and supervises them until they stop or
//! the process is interrupted.

mod cleanup;
mod config;
mod supervisor;

use crate::config::Config;
use crate::supervisor::Supervisor;
use anyhow::Result;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG: &str = "tunnelctl.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelctl=info,tunnel_state=info".into()),
        )
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = Config::load_or_demo(&path)?;

    info!(
        config = %path.display(),
        connections = config.connections.len(),
        "tunnelctl starting"
    );

    let supervisor = Supervisor::new(config)?;
    let handles = supervisor.spawn_all();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
            }
            info!("Interrupted, stopping connections");
            supervisor.shutdown();
        }
        _ = supervisor.wait_closed() => {}
    }

    supervisor.wait_closed().await;
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Connection task failed");
        }
    }

    info!("tunnelctl shutting down");
    Ok(())
}
