//! Configuration management for TaskMesh
//!
//! Environment-based configuration with defaults, TOML file support,
//! and validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection/negotiation configuration
    pub engine: EngineConfig,

    /// Rendezvous relay configuration
    pub relay: RelayConfig,

    /// Proximity discovery configuration
    pub discovery: DiscoveryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for a peer stuck in the Connecting state
    #[serde(with = "humantime_serde")]
    pub negotiation_timeout: Duration,

    /// Capacity of the per-peer outbound channel
    pub outbound_queue_depth: usize,

    /// Address the data-channel listener binds to (port 0 picks one)
    pub data_bind_address: String,
}

/// Rendezvous relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay service address
    pub address: String,

    /// Retry a dropped relay connection automatically
    pub reconnect: bool,

    /// Initial reconnect backoff; doubles per attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Upper bound on the reconnect backoff
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff_cap: Duration,
}

/// Proximity discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port beacons are broadcast on
    pub beacon_port: u16,

    /// Interval between advertise beacons
    #[serde(with = "humantime_serde")]
    pub beacon_interval: Duration,

    /// A peer silent for longer than this is reported lost
    #[serde(with = "humantime_serde")]
    pub peer_liveness_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            relay: RelayConfig::default(),
            discovery: DiscoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            outbound_queue_depth: 64,
            data_bind_address: "127.0.0.1:0".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            reconnect: true,
            reconnect_backoff: Duration::from_millis(500),
            reconnect_backoff_cap: Duration::from_secs(30),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            beacon_port: 41234,
            beacon_interval: Duration::from_secs(2),
            peer_liveness_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: TASKMESH_<SECTION>_<KEY>
    /// Example: TASKMESH_RELAY_ADDRESS=relay.example.com:8080
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(timeout) = env::var("TASKMESH_ENGINE_NEGOTIATION_TIMEOUT_SECS") {
            let secs: u64 = timeout.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid negotiation timeout: {}", e))
            })?;
            config.engine.negotiation_timeout = Duration::from_secs(secs);
        }
        if let Ok(addr) = env::var("TASKMESH_ENGINE_DATA_BIND_ADDRESS") {
            config.engine.data_bind_address = addr;
        }

        if let Ok(addr) = env::var("TASKMESH_RELAY_ADDRESS") {
            config.relay.address = addr;
        }
        if let Ok(reconnect) = env::var("TASKMESH_RELAY_RECONNECT") {
            config.relay.reconnect = reconnect
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid reconnect flag: {}", e)))?;
        }

        if let Ok(port) = env::var("TASKMESH_DISCOVERY_BEACON_PORT") {
            config.discovery.beacon_port = port
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid beacon port: {}", e)))?;
        }

        if let Ok(level) = env::var("TASKMESH_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("TASKMESH_LOG_JSON") {
            config.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.negotiation_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "negotiation_timeout must be greater than zero".to_string(),
            ));
        }

        if self.engine.outbound_queue_depth == 0 {
            return Err(ConfigError::Validation(
                "outbound_queue_depth must be greater than 0".to_string(),
            ));
        }

        if self.relay.reconnect_backoff > self.relay.reconnect_backoff_cap {
            return Err(ConfigError::Validation(
                "reconnect_backoff must not exceed reconnect_backoff_cap".to_string(),
            ));
        }

        if self.discovery.beacon_interval >= self.discovery.peer_liveness_timeout {
            return Err(ConfigError::Validation(
                "beacon_interval must be shorter than peer_liveness_timeout".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::Write(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.engine.negotiation_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.reconnect_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.beacon_interval = Duration::from_secs(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskmesh.toml");

        let mut config = Config::default();
        config.relay.address = "10.0.0.1:9000".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.relay.address, "10.0.0.1:9000");
        assert_eq!(loaded.engine.negotiation_timeout, Duration::from_secs(15));
    }
}
