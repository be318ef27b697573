//! Config loading and persistence.

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 29500;
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("cannot resolve store address {addr}: {reason}")]
    Resolve { addr: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Daemon host for clients; bind address for the server.
    pub host: String,
    /// TCP port. 0 binds an ephemeral port (server only).
    pub port: u16,
    /// Spawn the daemon in this process.
    pub is_server: bool,
    /// Expected rendezvous count; `None` disables the worker rendezvous.
    pub num_workers: Option<usize>,
    /// Default per-operation wait timeout. 0 means no timeout.
    pub timeout_ms: u64,
    /// Block `Store::open` until all workers have joined.
    pub wait_workers: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            is_server: false,
            num_workers: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            wait_workers: true,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve `host:port` to a socket address.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| ConfigError::Resolve {
                addr: addr.clone(),
                reason: err.to_string(),
            })?
            .next()
            .ok_or(ConfigError::Resolve {
                addr,
                reason: "no addresses returned".to_string(),
            })
    }
}

/// Load a config file, or defaults when `path` is `None`.
pub fn load(path: Option<&Path>) -> Result<StoreConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        }
        None => StoreConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment overrides, applied on top of file or default values.
pub fn apply_env_overrides(config: &mut StoreConfig) {
    if let Ok(host) = std::env::var("MUSTER_HOST")
        && !host.is_empty()
    {
        config.host = host;
    }
    if let Ok(port) = std::env::var("MUSTER_PORT")
        && let Ok(port) = port.parse::<u16>()
    {
        config.port = port;
    }
}
