//! Server-level configuration: the storage engine's [`EngineConfig`] plus
//! the handful of knobs specific to the TCP front end.

use crate::error::{ServerError, ServerResult};
use decuma_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

// `deny_unknown_fields` does not combine with `#[serde(flatten)]`, so unlike
// `EngineConfig` this struct accepts (and ignores) unrecognized keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    /// Address to bind the listening socket to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Maximum number of concurrently connected clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// How many idle ticks (no ready sockets) before flushing dirty
    /// segments, matching the "idle ticks flush up to 10 dirty segments"
    /// behavior.
    #[serde(default = "default_idle_commit_batch")]
    pub idle_commit_batch: usize,
    /// Milliseconds to sleep when a poll tick finds no ready sockets, so
    /// the loop doesn't spin a CPU core at 100%.
    #[serde(default = "default_patience_millis")]
    pub patience_millis: u64,
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8177".parse().unwrap()
}

fn default_max_clients() -> usize {
    64
}

fn default_idle_commit_batch() -> usize {
    10
}

fn default_patience_millis() -> u64 {
    5
}

impl ServerConfig {
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&text).map_err(|e| ServerError::InvalidConfig {
            what: format!("malformed config at {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        self.engine
            .validate()
            .map_err(|e| ServerError::InvalidConfig { what: e.to_string() })?;
        if self.max_clients == 0 {
            return Err(ServerError::InvalidConfig {
                what: "max_clients must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            engine: EngineConfig::default(),
            listen_addr: default_listen_addr(),
            max_clients: default_max_clients(),
            idle_commit_batch: default_idle_commit_batch(),
            patience_millis: default_patience_millis(),
        }
    }
}
