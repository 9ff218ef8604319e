//! Configuration loading and defaults for wayafk-supervisor.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::channel::ConnectPolicy;
use crate::domain::WatchConfig;

/// Directory under the data dir holding the binary and socket.
const CACHE_DIR_NAME: &str = "wayafknext";

/// Main configuration for wayafk-supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run idle detection at all (default: true).
    pub enable_detection: bool,

    /// Minutes without input before the status goes idle (default: 10).
    pub status_idle_timeout_minutes: u32,

    /// Minutes without input before notifications go AFK.
    /// Zero mirrors the status timeout (default: 0).
    pub notifications_idle_timeout_minutes: u32,

    /// Force debug logging.
    pub debug: bool,

    /// Where the monitor binary and socket live.
    /// If unset, uses `<data_dir>/wayafknext`.
    pub cache_dir: Option<PathBuf>,

    /// Fixed wait after spawn before the first connect attempt (default: 25).
    pub startup_delay_ms: u64,

    /// First retry delay while waiting for the socket (default: 25).
    pub connect_backoff_ms: u64,

    /// Retry delay cap while waiting for the socket (default: 500).
    pub connect_max_backoff_ms: u64,

    /// Give up on the socket after this long (default: 5000).
    pub startup_timeout_ms: u64,

    /// Time granted after Quit before a forceful kill (default: 50).
    pub quit_grace_ms: u64,

    /// Terminate monitors left over from an earlier run (default: true).
    pub sweep_orphans: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_detection: true,
            status_idle_timeout_minutes: 10,
            notifications_idle_timeout_minutes: 0,
            debug: false,
            cache_dir: None,
            startup_delay_ms: 25,
            connect_backoff_ms: 25,
            connect_max_backoff_ms: 500,
            startup_timeout_ms: 5000,
            quit_grace_ms: 50,
            sweep_orphans: true,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let default_path = config_dir.join("wayafk-supervisor").join("config.toml");
            if default_path.exists() {
                return Self::load(&default_path);
            }
        }

        Ok(Self::default())
    }

    /// Resolve the cache directory.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }

        dirs::data_dir()
            .map(|d| d.join(CACHE_DIR_NAME))
            .context("No data directory available; set cache_dir in config")
    }

    /// Watch timeouts with the notification timeout folded.
    pub fn watch(&self) -> WatchConfig {
        WatchConfig::new(
            self.status_idle_timeout_minutes,
            self.notifications_idle_timeout_minutes,
        )
    }

    /// Socket readiness polling.
    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            initial_delay: Duration::from_millis(self.startup_delay_ms),
            backoff: Duration::from_millis(self.connect_backoff_ms.max(1)),
            max_backoff: Duration::from_millis(self.connect_max_backoff_ms.max(1)),
            timeout: Duration::from_millis(self.startup_timeout_ms),
        }
    }

    /// Grace period between Quit and a forceful kill.
    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }
}
