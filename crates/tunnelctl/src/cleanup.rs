//! Temp path teardown.
//!
//! Consumes the paths a connection registered and removes them in
//! registration order. Paths that are already gone are fine; anything
//! else is logged and reported, never fatal.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Failure to remove one temp path
#[derive(Debug, thiserror::Error)]
#[error("Failed to remove {}: {source}", path.display())]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Outcome of one cleanup pass
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Paths removed, in the order they were removed
    pub removed: Vec<PathBuf>,
    /// Paths that no longer existed
    pub missing: Vec<PathBuf>,
    pub failed: Vec<CleanupError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Removes a connection's temp files and directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct TempPathCleaner;

impl TempPathCleaner {
    pub fn new() -> Self {
        Self
    }

    /// Remove every path, in order.
    pub async fn cleanup(&self, paths: Vec<PathBuf>) -> CleanupReport {
        let mut report = CleanupReport::default();

        for path in paths {
            match remove_path(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "cleanup: Removed temp path");
                    report.removed.push(path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.missing.push(path);
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "cleanup: Failed to remove temp path");
                    report.failed.push(CleanupError { path, source });
                }
            }
        }

        report
    }
}

async fn remove_path(path: &Path) -> io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
