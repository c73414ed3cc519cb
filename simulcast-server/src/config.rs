//! Server configuration
//!
//! CLI arguments take precedence; a TOML file supplies the rest; compiled
//! defaults fill anything left over.

use serde::Deserialize;
use simulcast_common::{Error, Result};
use std::path::{Path, PathBuf};

/// Worker/server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host for workers
    pub host: String,
    /// Port of the first worker; slot N listens on base_port + N
    pub base_port: u16,
    /// Worker process count; 0 means one per available CPU
    pub workers: usize,
    pub db_path: PathBuf,
    /// Heartbeat comment cadence on viewer streams, seconds
    pub heartbeat_secs: u64,
    /// Grace between forwarding a stopped event and closing the stream, ms
    pub close_grace_ms: u64,
    /// Control bus channel capacity
    pub bus_capacity: usize,
    /// When false the fan-out medium is treated as unconfigured: the SSE
    /// endpoint fails fast and viewers rely on polling
    pub events_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            base_port: 5850,
            workers: 0,
            db_path: PathBuf::from("simulcast.db"),
            heartbeat_secs: 15,
            close_grace_ms: 500,
            bus_capacity: 256,
            events_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("invalid config file: {e}")))
            }
            None => Ok(Self::default()),
        }
    }

    /// Effective worker count: configured value, or one per CPU
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Whether this deployment can serve the control-event push stream.
    ///
    /// The event channel is process-local: a stop published in one worker
    /// never reaches connections held by another. Push is therefore only
    /// offered in single-worker deployments; with multiple workers the
    /// stream endpoint fails fast and viewers converge through status
    /// polling against the shared database.
    pub fn fanout_enabled(&self) -> bool {
        self.events_enabled && self.effective_workers() <= 1
    }
}
