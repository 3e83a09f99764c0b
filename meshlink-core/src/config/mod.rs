//! Configuration management for MeshLink
//!
//! This module provides file and environment based configuration with
//! support for defaults and validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long shutdown waits for background tasks to drain
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Signaling server configuration
    pub signaling: SignalingConfig,

    /// Direct transport lifecycle configuration
    pub connection: ConnectionConfig,

    /// Client-side signaling link configuration
    pub link: LinkConfig,

    /// Causal synchronization configuration
    pub sync: SyncConfig,

    /// Local store configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Listen address for the WebSocket/health server
    pub bind_address: SocketAddr,

    /// Accepted `Origin` header value, `*` accepts any origin
    pub allowed_origin: String,

    /// Maximum members per room
    pub max_peers_per_room: usize,

    /// Expected client heartbeat period; peers silent for twice this are evicted
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Rate limit window per signaling connection
    #[serde(with = "humantime_serde")]
    pub rate_limit_window: Duration,

    /// Maximum messages per connection per window
    pub rate_limit_max: u32,
}

/// Direct transport lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Delay before a failed/disconnected transport is forced closed
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Round-trip time sampling period
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,

    /// STUN/TURN URLs handed to transport implementations
    pub ice_servers: Vec<String>,
}

/// Client-side signaling link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Signaling server WebSocket URL
    pub url: String,

    /// First reconnect delay
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Reconnect delay ceiling
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Heartbeat period sent while connected
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

/// Causal synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of recent message ids recorded as causal dependencies
    pub dependency_count: usize,

    /// Messages closer than this without a causal link are concurrent
    #[serde(with = "humantime_serde")]
    pub conflict_window: Duration,

    /// Maximum messages returned per sync request
    pub sync_batch_limit: usize,

    /// Maximum messages kept in history
    pub max_history: usize,

    /// History and pending buffer time horizon
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Messages sent per gossip round
    pub gossip_count: usize,

    /// Period between unsolicited gossip rounds
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Period between retention sweeps
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory for persistent storage
    pub data_dir: PathBuf,

    /// Number of room slices kept in the hot cache
    pub cache_rooms: usize,

    /// Most recent messages cached per room
    pub cache_messages_per_room: usize,

    /// Batch flush period
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,

    /// Metrics bind address
    pub bind_address: SocketAddr,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            allowed_origin: "*".to_string(),
            max_peers_per_room: 50,
            heartbeat_interval: Duration::from_secs(30),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 100,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            health_interval: Duration::from_secs(5),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dependency_count: 5,
            conflict_window: Duration::from_secs(1),
            sync_batch_limit: 100,
            max_history: 1000,
            retention: Duration::from_secs(3600),
            gossip_count: 10,
            gossip_interval: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_rooms: 32,
            cache_messages_per_room: 200,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

/// Read `key` from the environment and parse it, if set
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

/// Read a humantime duration (`30s`, `5m`) from the environment, if set
fn env_duration(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Environment variables follow the pattern: MESHLINK_<SECTION>_<KEY>
    /// Example: MESHLINK_SIGNALING_BIND_ADDRESS=0.0.0.0:8080
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let mut config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `MESHLINK_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Signaling
        if let Some(addr) = env_parse("MESHLINK_SIGNALING_BIND_ADDRESS")? {
            self.signaling.bind_address = addr;
        }
        if let Ok(origin) = env::var("MESHLINK_SIGNALING_ALLOWED_ORIGIN") {
            self.signaling.allowed_origin = origin;
        }
        if let Some(max) = env_parse("MESHLINK_SIGNALING_MAX_PEERS_PER_ROOM")? {
            self.signaling.max_peers_per_room = max;
        }
        if let Some(interval) = env_duration("MESHLINK_SIGNALING_HEARTBEAT_INTERVAL")? {
            self.signaling.heartbeat_interval = interval;
        }
        if let Some(window) = env_duration("MESHLINK_SIGNALING_RATE_LIMIT_WINDOW")? {
            self.signaling.rate_limit_window = window;
        }
        if let Some(max) = env_parse("MESHLINK_SIGNALING_RATE_LIMIT_MAX")? {
            self.signaling.rate_limit_max = max;
        }

        // Link
        if let Ok(url) = env::var("MESHLINK_LINK_URL") {
            self.link.url = url;
        }

        // Store
        if let Ok(data_dir) = env::var("MESHLINK_STORE_DATA_DIR") {
            self.store.data_dir = PathBuf::from(data_dir);
        }

        // Logging
        if let Ok(level) = env::var("MESHLINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = env_parse("MESHLINK_LOG_JSON")? {
            self.logging.json_format = json;
        }

        // Metrics
        if let Some(enabled) = env_parse("MESHLINK_METRICS_ENABLED")? {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = env_parse("MESHLINK_METRICS_BIND_ADDRESS")? {
            self.metrics.bind_address = addr;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling.max_peers_per_room == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_peers_per_room must be greater than 0".to_string(),
            ));
        }

        if self.signaling.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        if self.signaling.rate_limit_max == 0 || self.signaling.rate_limit_window.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "rate limit window and max must be greater than 0".to_string(),
            ));
        }

        if self.link.initial_backoff.is_zero() || self.link.initial_backoff > self.link.max_backoff {
            return Err(ConfigError::ValidationFailed(
                "initial_backoff must be non-zero and not exceed max_backoff".to_string(),
            ));
        }

        if self.connection.health_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "health_interval must be greater than 0".to_string(),
            ));
        }

        if self.sync.max_history == 0 || self.sync.sync_batch_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_history and sync_batch_limit must be greater than 0".to_string(),
            ));
        }

        if self.store.cache_rooms == 0 || self.store.cache_messages_per_room == 0 {
            return Err(ConfigError::ValidationFailed(
                "store cache sizes must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;
        Ok(())
    }

    /// Render as pretty TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            connection: ConnectionConfig::default(),
            link: LinkConfig::default(),
            sync: SyncConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.dependency_count, 5);
        assert_eq!(config.sync.sync_batch_limit, 100);
        assert_eq!(config.connection.grace_period, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.signaling.max_peers_per_room = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.link.initial_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());

        config = Config::default();
        config.signaling.rate_limit_max = 0;
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
    fn test_toml_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshlink.toml");
        std::fs::write(
            &path,
            r#"
            [signaling]
            heartbeat_interval = "10s"
            max_peers_per_room = 8

            [sync]
            retention = "30m"
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.signaling.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.signaling.max_peers_per_room, 8);
        assert_eq!(config.sync.retention, Duration::from_secs(1800));
        // Untouched sections keep their defaults
        assert_eq!(config.store.flush_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");

        let mut config = Config::default();
        config.signaling.allowed_origin = "https://mesh.example".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.signaling.allowed_origin, "https://mesh.example");
    }
}
