// Configuration schema for the samplink protocol core.

use std::{
    env, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Datagram transport tunables shared by both roles.
    pub transport: TransportSettings,
    /// Client-role negotiation tunables.
    pub peer: PeerSettings,
    /// Server-role registry tunables.
    pub controller: ControllerSettings,
}

impl Config {
    /// Loads configuration from `SAMPLINK_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("SAMPLINK_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate().map_err(ConfigError::Validation)?;
        self.peer.validate().map_err(ConfigError::Validation)?;
        self.controller
            .validate()
            .map_err(ConfigError::Validation)?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Tunables for the datagram transport core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Outbound queue capacity; producers block while the queue is full.
    pub send_queue_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: 100,
        }
    }
}

impl TransportSettings {
    fn validate(&self) -> Result<(), String> {
        if self.send_queue_capacity == 0 {
            return Err("transport.send_queue_capacity must be > 0".into());
        }
        Ok(())
    }
}

/// Tunables for the peer-side negotiation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Negotiation cadence while disconnected, in milliseconds; 0 disables the timer.
    pub disconnected_interval_ms: u64,
    /// Negotiation cadence while connected, in milliseconds; 0 disables the timer.
    pub connected_interval_ms: u64,
    /// Capacity of the event channel handed to the subscriber.
    pub event_buffer: usize,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            disconnected_interval_ms: 3_000,
            connected_interval_ms: 60_000,
            event_buffer: 256,
        }
    }
}

impl PeerSettings {
    /// Interval between negotiation attempts while no session is held.
    pub fn disconnected_interval(&self) -> Duration {
        Duration::from_millis(self.disconnected_interval_ms)
    }

    /// Interval between keep-alive negotiations while a session is held.
    pub fn connected_interval(&self) -> Duration {
        Duration::from_millis(self.connected_interval_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.event_buffer == 0 {
            return Err("peer.event_buffer must be > 0".into());
        }
        Ok(())
    }
}

/// Tunables for the controller-side registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Age after which a peer record with no fresh negotiation is evicted, in milliseconds.
    pub peer_timeout_ms: u64,
    /// Capacity of the event channel handed to the subscriber.
    pub event_buffer: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            peer_timeout_ms: 180_000,
            event_buffer: 256,
        }
    }
}

impl ControllerSettings {
    /// Registry eviction threshold.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.peer_timeout_ms == 0 {
            return Err("controller.peer_timeout_ms must be > 0".into());
        }
        if self.event_buffer == 0 {
            return Err("controller.event_buffer must be > 0".into());
        }
        Ok(())
    }
}
