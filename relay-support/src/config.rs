use crate::logging::LogDestination;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Queue capacity shared by all four inter-thread queues unless a relay
/// section overrides it.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayTuning {
    /// Size in bytes of the scratch buffer the Ingress Reader reads
    /// packets into.
    pub read_buffer_size: usize,
    /// How long the TCP relay sleeps between selector passes when there is
    /// no pending ingress work to drain.
    pub tcp_poll_interval_millis: u64,
    /// The device-side IPv4 address reply packets are addressed to. Fixed
    /// rather than discovered, since the virtual interface always presents
    /// a single source host (see the flow key's omission of source
    /// address) and its address is assigned out of band when the tunnel is
    /// brought up.
    pub device_addr: Ipv4Addr,
}

impl Default for RelayTuning {
    fn default() -> RelayTuning {
        RelayTuning {
            read_buffer_size: 65536,
            tcp_poll_interval_millis: 1,
            device_addr: Ipv4Addr::new(10, 0, 0, 2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub destination: LogDestination,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: "info".to_string(),
            destination: LogDestination::Stderr,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub tuning: RelayTuning,
    #[serde(default)]
    pub logging: LogConfig,
}

impl RelayConfig {
    /// Loads a `RelayConfig` from a TOML file. Missing sections fall back
    /// to their defaults, so a config file only needs to override what it
    /// cares about.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RelayConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read configuration file: {}", err),
            ConfigError::Parse(err) => write!(f, "failed to parse configuration file: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}
