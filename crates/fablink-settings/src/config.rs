//! Configuration and settings management for FabLink
//!
//! Provides configuration file handling and validation.
//! Supports JSON and TOML file formats stored in platform-specific directories.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (ports, baud rate, probe and request timeouts)
//! - Heartbeat settings (report interval, watchdog window)
//! - Transfer settings (chunk sizes, idle timeout)
//! - Storage settings (staging directory)

use crate::error::{ConfigError, SettingsError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// TCP port of the SACP service
    pub sacp_tcp_port: u16,
    /// UDP port of the SACP service
    pub sacp_udp_port: u16,
    /// HTTP port of the legacy API
    pub http_port: u16,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Per-probe timeout during protocol detection, in milliseconds
    pub probe_timeout_ms: u64,
    /// Request/response timeout, in milliseconds
    pub request_timeout_ms: u64,
    /// Client name announced in the SACP handshake
    pub client_name: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            sacp_tcp_port: 8888,
            sacp_udp_port: 8889,
            http_port: 8080,
            baud_rate: 115200,
            probe_timeout_ms: 1500,
            request_timeout_ms: 5000,
            client_name: "FabLink".to_string(),
        }
    }
}

/// Heartbeat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Interval the machine is asked to report at, in milliseconds
    pub interval_ms: u64,
    /// Silence after which the connection is considered lost, in milliseconds
    pub watchdog_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            watchdog_ms: 10000,
        }
    }
}

/// File transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Chunk size for regular uploads, in bytes
    pub chunk_size: usize,
    /// Chunk size for large uploads and firmware images, in bytes
    pub large_chunk_size: usize,
    /// Files above this size use the large chunk size, in bytes
    pub large_file_threshold: u64,
    /// Time without chunk activity before an upload fails, in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            large_chunk_size: 60 * 1024,
            large_file_threshold: 10 * 1024 * 1024,
            idle_timeout_ms: 30000,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory for staged uploads and exported logs; system temp dir when unset
    pub tmp_dir: Option<PathBuf>,
}

/// Complete application configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Heartbeat settings
    pub heartbeat: HeartbeatSettings,
    /// Transfer settings
    pub transfer: TransferSettings,
    /// Storage settings
    pub storage: StorageSettings,
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform config file location (`<config dir>/fablink/config.toml`)
    pub fn default_path() -> SettingsResult<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            ConfigError::UnsupportedPlatform(std::env::consts::OS.to_string())
        })?;
        Ok(dir.join("fablink").join("config.toml"))
    }

    /// Load the config at the default location, falling back to defaults if absent
    pub fn load_or_default() -> SettingsResult<Self> {
        let path = Self::default_path()?;
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or_default().to_string(),
                )
                .into())
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or_default().to_string(),
                )
                .into())
            }
        };

        let write_error = |source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        std::fs::write(path, content).map_err(write_error)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(key: &str, value: impl ToString) -> ConfigError {
            ConfigError::ValueOutOfRange {
                key: key.to_string(),
                value: value.to_string(),
            }
        }

        if self.connection.baud_rate == 0 {
            return Err(out_of_range("connection.baud_rate", 0));
        }
        if self.connection.probe_timeout_ms == 0 {
            return Err(out_of_range("connection.probe_timeout_ms", 0));
        }
        if self.connection.request_timeout_ms == 0 {
            return Err(out_of_range("connection.request_timeout_ms", 0));
        }

        if self.heartbeat.interval_ms == 0 || self.heartbeat.interval_ms > u16::MAX as u64 {
            return Err(out_of_range(
                "heartbeat.interval_ms",
                self.heartbeat.interval_ms,
            ));
        }
        // The watchdog must tolerate at least one missed report.
        if self.heartbeat.watchdog_ms <= self.heartbeat.interval_ms {
            return Err(out_of_range(
                "heartbeat.watchdog_ms",
                self.heartbeat.watchdog_ms,
            ));
        }

        for (key, size) in [
            ("transfer.chunk_size", self.transfer.chunk_size),
            ("transfer.large_chunk_size", self.transfer.large_chunk_size),
        ] {
            // Chunks travel as u16-length blobs inside one frame.
            if size == 0 || size > 60 * 1024 {
                return Err(out_of_range(key, size));
            }
        }
        if self.transfer.idle_timeout_ms == 0 {
            return Err(out_of_range("transfer.idle_timeout_ms", 0));
        }

        Ok(())
    }
}
