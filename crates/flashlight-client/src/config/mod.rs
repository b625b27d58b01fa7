//! Configuration types for the client proxy.

mod server;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use server::{ServerInfo, DEFAULT_DIAL_TIMEOUT, DEFAULT_KEEP_ALIVE, DEFAULT_WEIGHT};

/// The unit of reconfiguration: an ordered list of upstream servers plus the
/// header-dump switch. Compared structurally so that re-applying an identical
/// config is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub servers: Vec<ServerInfo>,

    /// Dump request and response header blocks of proxied traffic to the log.
    #[serde(default)]
    pub should_dump_headers: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Listen address in `host:port` form.
    pub addr: String,
}

/// On-disk configuration for the binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileConfig {
    pub listen: ListenConfig,

    /// Read timeout for local connections in milliseconds; 0 disables it.
    #[serde(default)]
    pub read_timeout_millis: u64,

    /// Write timeout for local connections in milliseconds; 0 disables it.
    #[serde(default)]
    pub write_timeout_millis: u64,

    #[serde(default)]
    pub should_dump_headers: bool,

    #[serde(default)]
    pub servers: Vec<ServerInfo>,
}

impl FileConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: FileConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        for server in &self.servers {
            if server.host.is_empty() {
                anyhow::bail!("server entry is missing 'host'");
            }
            if server.port == 0 {
                anyhow::bail!("server '{}' is missing 'port'", server.host);
            }
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.read_timeout_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.write_timeout_millis)
    }

    /// The reconfigurable part of this file.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            servers: self.servers.clone(),
            should_dump_headers: self.should_dump_headers,
        }
    }
}

fn timeout_from_millis(millis: u64) -> Option<Duration> {
    if millis == 0 {
        None
    } else {
        Some(Duration::from_millis(millis))
    }
}
