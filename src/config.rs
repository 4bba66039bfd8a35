//! Client configuration.
//!
//! Settings are resolved in three layers, later ones winning:
//!
//! 1. Built-in defaults (`xaprun --stdio`, 30 second timeout)
//! 2. A JSON file, by default `<config dir>/xaprun/client.json`
//! 3. Environment variables `XAPRUN_PATH` and `XAPRUN_TIMEOUT_SECS`
//!
//! ```json
//! {
//!   "server_path": "/usr/local/bin/xaprun",
//!   "server_args": ["--stdio"],
//!   "timeout_secs": 5,
//!   "read_chunk": 4096
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ipc::DEFAULT_READ_CHUNK;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Environment variable overriding the server binary.
pub const ENV_SERVER_PATH: &str = "XAPRUN_PATH";

/// Environment variable overriding the request timeout (0 waits forever).
pub const ENV_TIMEOUT_SECS: &str = "XAPRUN_TIMEOUT_SECS";

/// How to start and talk to the xaprun server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server binary, looked up on `PATH` when not absolute.
    pub server_path: PathBuf,
    /// Arguments selecting stdio mode.
    pub server_args: Vec<String>,
    /// Request timeout in seconds; 0 waits indefinitely.
    pub timeout_secs: u64,
    /// Bytes requested from the transport per read.
    pub read_chunk: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_path: PathBuf::from("xaprun"),
            server_args: vec!["--stdio".to_string()],
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

/// Resolve the default config file location.
///
/// `$XDG_CONFIG_HOME/xaprun/client.json` on Linux,
/// `~/Library/Application Support/xaprun/client.json` on macOS.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("xaprun").join("client.json"))
}

impl ClientConfig {
    /// Request timeout, `None` meaning wait indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Load a config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Defaults, overlaid with `path` (or the default file if it exists),
    /// overlaid with the process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => {
                    tracing::debug!("Loading config from {}", path.display());
                    Self::load(&path)?
                }
                None => Self::default(),
            },
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_SERVER_PATH).filter(|p| !p.trim().is_empty()) {
            self.server_path = PathBuf::from(path.trim());
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            self.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value: {}", ENV_TIMEOUT_SECS, secs))?;
        }
        Ok(self)
    }
}
