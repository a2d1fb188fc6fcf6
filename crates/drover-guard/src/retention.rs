use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use drover_core::Result;

/// Bounded retention for generated artifacts (screenshots, captures).
///
/// A pure capacity policy: once the directory holds more than
/// `max_artifacts` files, the oldest are deleted first. Artifact names
/// are timestamp-prefixed, so lexicographic order is chronological.
/// Pinned paths — artifacts an in-flight task still references — are
/// never deleted.
pub struct ArtifactSweeper {
    dir: PathBuf,
    max_artifacts: usize,
    pins: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ArtifactSweeper {
    pub fn new(dir: impl Into<PathBuf>, max_artifacts: usize) -> Self {
        Self {
            dir: dir.into(),
            max_artifacts,
            pins: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Protect an artifact for as long as the returned pin is alive.
    pub fn pin(&self, path: impl Into<PathBuf>) -> ArtifactPin {
        let path = path.into();
        self.pins.lock().insert(path.clone());
        ArtifactPin {
            pins: Arc::clone(&self.pins),
            path,
        }
    }

    /// Delete oldest-first excess artifacts. Returns how many were
    /// removed. Missing directory is not an error — there is simply
    /// nothing to sweep.
    pub async fn sweep(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }

        if files.len() <= self.max_artifacts {
            return Ok(0);
        }

        files.sort();
        let mut excess = files.len() - self.max_artifacts;
        let mut deleted = 0;

        for path in files {
            if excess == 0 {
                break;
            }
            if self.pins.lock().contains(&path) {
                debug!(path = %path.display(), "artifact pinned, skipping");
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    excess -= 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to delete artifact");
                }
            }
        }

        if deleted > 0 {
            info!(deleted, cap = self.max_artifacts, "artifact sweep complete");
        }
        Ok(deleted)
    }

    /// Run the sweep on a fixed interval. Spawn as a background task;
    /// sweep failures are logged and never fatal.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!(
            dir = %self.dir.display(),
            cap = self.max_artifacts,
            interval_secs = interval.as_secs(),
            "artifact sweeper started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the initial sweep
        // happens one full interval after startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "artifact sweep failed");
            }
        }
    }
}

/// RAII pin — dropping it makes the artifact eligible for deletion again.
pub struct ArtifactPin {
    pins: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for ArtifactPin {
    fn drop(&mut self) {
        self.pins.lock().remove(&self.path);
    }
}
