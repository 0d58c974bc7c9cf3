//! Storage configuration.
//!
//! Settings are resolved in three layers: built-in defaults, an
//! optional TOML file (`trellis.toml` in the working directory, then
//! `storage.toml` under the platform config directory), and `TRELLIS_*`
//! environment variables on top. A `.env` file is honored through
//! `dotenvy` before the environment is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::StorageEngine;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Resolved storage settings for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Engine to use.
    #[serde(rename = "backend", default)]
    pub engine: StorageEngine,
    /// Directory for file-based state; platform data dir when unset.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// SQLite database file; `<base>/tasks.db` when unset.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Postgres connection URL. Required for the postgres engine.
    #[serde(default)]
    pub connection_url: Option<String>,
    /// Connection pool size for the SQL engines.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Time allowed for acquiring a connection, in milliseconds.
    #[serde(rename = "connectTimeout", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Idle time before a pooled connection is dropped, in milliseconds.
    #[serde(rename = "idleTimeout", default)]
    pub idle_timeout_ms: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: StorageEngine::default(),
            base_dir: None,
            db_path: None,
            connection_url: None,
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: None,
        }
    }
}

impl StorageConfig {
    /// Loads configuration from file and environment.
    ///
    /// A malformed file or environment value is logged and ignored
    /// rather than failing startup.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        let mut config = match find_config_file() {
            Some(path) => Self::from_file(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring unreadable storage config");
                Self::default()
            }),
            None => Self::default(),
        };

        if let Some(value) = env_var("TRELLIS_STORAGE_BACKEND") {
            match value.parse() {
                Ok(engine) => config.engine = engine,
                Err(e) => {
                    warn!(value = %value, error = %e, "ignoring invalid TRELLIS_STORAGE_BACKEND")
                }
            }
        }
        if let Some(dir) = env_var("TRELLIS_BASE_DIR") {
            config.base_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = env_var("TRELLIS_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_var("TRELLIS_DATABASE_URL") {
            config.connection_url = Some(url);
        }

        config
    }

    /// Parses configuration from a TOML file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Base directory for file-based state.
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("trellis")
        })
    }

    /// SQLite database file location.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.resolved_base_dir().join("tasks.db"))
    }

    /// JSON state file location.
    pub fn json_state_path(&self) -> PathBuf {
        self.resolved_base_dir().join("tasks.json")
    }

    /// Connection acquire timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout for pooled connections, when configured.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("trellis.toml");
    if local.exists() {
        return Some(local);
    }
    let global = dirs::config_dir()?.join("trellis").join("storage.toml");
    if global.exists() {
        return Some(global);
    }
    None
}
