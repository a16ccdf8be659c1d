//! Configuration loading for kinlink-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section and field is optional.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for kinlink-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Pairing code configuration.
    pub pairing: PairingConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    pub http: HttpConfig,
    /// Cleanup task configuration.
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Pairing code configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingConfig {
    /// How long an issued code stays redeemable, in seconds (default: 10 minutes).
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum connection attempts per device id per minute (default: 30).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
    /// Maximum pairing code redemption attempts per guardian per minute (default: 5).
    #[serde(default = "default_redeem_attempts_per_minute")]
    pub redeem_attempts_per_minute: u32,
    /// Maximum simultaneously registered devices (default: 10000).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest inbound WebSocket message in bytes (default: 64KB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Back-to-back transport errors after which a connection is treated as
    /// gone (default: 8).
    #[serde(default = "default_max_transport_errors")]
    pub max_transport_errors: u32,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 300 = 5 minutes).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("kinlink.db")
}

fn default_code_ttl_secs() -> u64 {
    10 * 60
}

fn default_connections_per_minute() -> u32 {
    30
}

fn default_redeem_attempts_per_minute() -> u32 {
    5
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_max_transport_errors() -> u32 {
    8
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: default_code_ttl_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_minute: default_connections_per_minute(),
            redeem_attempts_per_minute: default_redeem_attempts_per_minute(),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_transport_errors: default_max_transport_errors(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
