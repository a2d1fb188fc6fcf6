use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::DroverConfig;

/// Loads and optionally hot-reloads the drover configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<DroverConfig>>,
    config_path: PathBuf,
}

/// Read and parse one config file, with env overrides applied on top.
fn parse_file(path: &Path) -> drover_core::Result<DroverConfig> {
    let raw = std::fs::read_to_string(path)?;
    let config = toml::from_str::<DroverConfig>(&raw).map_err(|e| {
        drover_core::DroverError::Config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    Ok(apply_env_overrides(config))
}

/// Env var overrides (DROVER_NODE_ID, DROVER_QUEUE_URL, ...). The file
/// wins for the API key; env is the fallback.
fn apply_env_overrides(mut config: DroverConfig) -> DroverConfig {
    if let Ok(v) = std::env::var("DROVER_NODE_ID") {
        config.node.id = v;
    }
    if let Ok(v) = std::env::var("DROVER_DAEMON_URL") {
        config.daemon.base_url = v;
    }
    if let Ok(v) = std::env::var("DROVER_QUEUE_URL") {
        config.queue.base_url = v;
    }
    if let Ok(v) = std::env::var("DROVER_TUNNEL_URL") {
        config.tunnel.url = v;
    }
    if let Ok(v) = std::env::var("DROVER_SERVER_LISTEN") {
        config.server.listen = v;
    }
    if let Ok(v) = std::env::var("DROVER_LOG_LEVEL") {
        config.logging.level = v;
    }
    if config.queue.api_key.is_none() {
        if let Ok(v) = std::env::var("DROVER_QUEUE_API_KEY") {
            config.queue.api_key = Some(v);
        }
    }
    config
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > DROVER_CONFIG env > ~/.drover/drover.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("DROVER_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".drover")
            .join("drover.toml")
    }

    /// Load the config from disk, falling back to defaults when the file
    /// does not exist. Validation warnings are logged; errors abort.
    pub fn load(path: Option<&Path>) -> drover_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            apply_env_overrides(DroverConfig::default())
        };

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(drover_core::DroverError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> DroverConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<DroverConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> drover_core::Result<()> {
        if !self.config_path.exists() {
            return Err(drover_core::DroverError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        *self.config.write() = parse_file(&self.config_path)?;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that swaps the shared config in
    /// place when the file changes. A file with errors keeps the
    /// current config. Returns the watcher handle (must be kept alive).
    pub fn watch(&self) -> drover_core::Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let mut watcher =
            notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == config_path.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    match parse_file(&config_path) {
                        Ok(new_config) => {
                            *config.write() = new_config;
                            info!("configuration hot-reloaded");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            })
            .map_err(|e| {
                drover_core::DroverError::Config(format!("failed to create file watcher: {e}"))
            })?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                drover_core::DroverError::Config(format!("failed to watch config directory: {e}"))
            })?;

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().heartbeat.interval_ms, 30_000);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drover.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[node]\nid = \"node-a\"\n[heartbeat]\ninterval_ms = 15000").unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        let config = loader.get();
        assert_eq!(config.node.id, "node-a");
        assert_eq!(config.heartbeat.interval_ms, 15_000);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drover.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[heartbeat]\ninterval_ms = 0").unwrap();

        assert!(ConfigLoader::load(Some(&path)).is_err());
    }

    #[test]
    fn reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drover.toml");
        std::fs::write(&path, "[heartbeat]\ninterval_ms = 20000\n").unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().heartbeat.interval_ms, 20_000);

        std::fs::write(&path, "[heartbeat]\ninterval_ms = 45000\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().heartbeat.interval_ms, 45_000);
    }
}
