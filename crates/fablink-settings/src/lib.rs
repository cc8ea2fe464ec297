//! FabLink Settings Crate
//!
//! Handles connection-layer configuration (ports, timeouts, heartbeat,
//! transfer sizes) and the storage location used for staged files.

pub mod config;
pub mod error;
pub mod storage;

pub use config::{
    Config, ConnectionSettings, HeartbeatSettings, StorageSettings, TransferSettings,
};
pub use error::{ConfigError, SettingsError, SettingsResult};
pub use storage::StorageLocation;
