//! Server configuration, loaded from RON.
//!
//! ```ron
//! (
//!     bind: "0.0.0.0:7878",
//!     database: Some("/var/lib/kioku/kioku.db"),
//!     default_owner: Some("local"),
//!     busy_retries: 5,
//! )
//! ```
//!
//! Every field is optional. Command-line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kioku_store::StoreConfig;
use kioku_store::config::{DEFAULT_BUSY_RETRIES, DEFAULT_RETRY_BACKOFF};
use kioku_store::lock::DEFAULT_LOCK_TIMEOUT;

use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_BIND_ADDRESS, DEFAULT_HISTORY_LIMIT,
    MAX_HISTORY_LIMIT,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind: String,
    /// SQLite database path; in-memory when `None`.
    pub database: Option<PathBuf>,
    /// Owner used when a request has no owner header.
    pub default_owner: Option<String>,
    pub lock_timeout_ms: u64,
    pub busy_retries: u32,
    pub retry_backoff_ms: u64,
    pub history_limit: usize,
    pub history_limit_max: usize,
    /// Age cutoff for `POST /admin/expire` when the request names none.
    pub expire_after_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND_ADDRESS.to_string(),
            database: None,
            default_owner: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            busy_retries: DEFAULT_BUSY_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_limit_max: MAX_HISTORY_LIMIT,
            expire_after_secs: None,
        }
    }
}

impl ServerConfig {
    /// `<config dir>/kioku/server.ron`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path`, or from [`default_path`](Self::default_path).
    ///
    /// An explicit path must exist. A missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_ron(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind must not be empty".into()));
        }
        if self.history_limit == 0 || self.history_limit > self.history_limit_max {
            return Err(ConfigError::Invalid(format!(
                "history_limit must be in 1..={}, got {}",
                self.history_limit_max, self.history_limit
            )));
        }
        if self.default_owner.as_deref().is_some_and(|o| o.trim().is_empty()) {
            return Err(ConfigError::Invalid("default_owner must not be empty".into()));
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            busy_retries: self.busy_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Clamp a requested history length to the configured bounds.
    pub fn history_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.history_limit)
            .clamp(1, self.history_limit_max)
    }
}
