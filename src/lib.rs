//! # FabLink
//!
//! Connection and protocol layer for Snapmaker-style fabrication machines:
//! 3D printers, laser engravers and CNC mills reached over TCP, UDP,
//! serial ports or the HTTP API of older firmware.
//!
//! ## Architecture
//!
//! FabLink is organized as a workspace with multiple crates:
//!
//! 1. **fablink-core** - Shared data types, error taxonomy, event bus
//! 2. **fablink-settings** - Configuration file and storage locations
//! 3. **fablink-communication** - Transports, SACP, channels, connection manager
//! 4. **fablink** - The JSON-lines IPC binary that hosts one manager

pub mod ipc;

pub use fablink_communication::{
    list_ports, Channel, ChannelEvent, Command, ConnectionManager, ConnectionTarget,
    ManagerState, OpenRequest, Response, SerialPortInfo, StartOptions,
};
pub use fablink_core::{
    AppEvent, ChannelError, ConnectionError, Error, EventBus, EventCategory, EventFilter,
    MachineModel, MachineStatus,
    Protocol, ProtocolError, Result,
};
pub use fablink_settings::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Logs go to stderr; stdout carries the IPC stream. The level comes from
/// `RUST_LOG`, INFO when unset.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
