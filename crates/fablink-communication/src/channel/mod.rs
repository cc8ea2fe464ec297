//! Protocol channels
//!
//! A [`Channel`] owns one machine connection over one protocol. Lifecycle
//! calls open and close it; everything else is reached through capability
//! accessors that return `None` when the protocol does not offer the
//! capability, so callers never downcast.
//!
//! Implementations:
//! - [`sacp::SacpChannel`]: SACP over TCP, UDP or serial, all capabilities
//! - [`sstp::SstpChannel`]: HTTP API of older network firmware
//! - [`text_serial::TextSerialChannel`]: G-code lines over a serial port

pub mod lifecycle;
pub mod sacp;
pub mod sstp;
pub mod text_serial;
pub mod watchdog;

use crate::sacp::messages::{
    Axis, CoordinateInfo, CrosshairOffset, NetworkConfiguration, NetworkSettings, StationState,
    WifiNetwork,
};
use async_trait::async_trait;
use fablink_core::{
    ChannelError, ChannelState, DisconnectReason, Error, HeadType, MachineModel, MachineStatus,
    Protocol, TransferEvent,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

pub use lifecycle::Lifecycle;
pub use watchdog::Watchdog;

/// Result of a capability call
pub type ChannelResult<T> = fablink_core::Result<T>;

/// Capacity of a channel's event broadcast
pub const EVENT_CAPACITY: usize = 128;

/// Typed channel lifecycle and status events
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Transport opening
    Connecting,
    /// Transport open
    Connected,
    /// Handshake complete
    Ready {
        /// Identified model
        machine: MachineModel,
        /// Mounted head, when the handshake reports it
        head_type: Option<HeadType>,
    },
    /// Heartbeat or poll result
    Status(MachineStatus),
    /// Upload progress
    Transfer(TransferEvent),
    /// Channel closed
    Closed {
        /// Why
        reason: DisconnectReason,
    },
}

/// Options for [`Channel::connection_open`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Session token from a previous HTTP connection
    pub token: Option<String>,
}

/// A local file to upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions {
    /// File on disk
    pub path: PathBuf,
    /// Name on the machine; the local file name when absent
    pub target_name: Option<String>,
}

impl UploadOptions {
    /// Upload `path` under its own file name
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            target_name: None,
        }
    }

    /// Name the file will have on the machine
    pub fn target_name(&self) -> String {
        self.target_name.clone().unwrap_or_else(|| file_name(&self.path))
    }
}

/// A job to run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    /// Local G-code file
    pub path: PathBuf,
    /// Name of the uploaded copy on the machine
    pub target_name: String,
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.gcode".to_string())
}

/// Error for a capability the protocol does not offer
pub fn unsupported(capability: &str, protocol: Protocol) -> Error {
    ChannelError::Unsupported {
        capability: capability.to_string(),
        protocol: protocol.to_string(),
    }
    .into()
}

/// Machine connection over one protocol
#[async_trait]
pub trait Channel: Send + Sync {
    /// Wire protocol
    fn protocol(&self) -> Protocol;

    /// Current lifecycle state
    fn state(&self) -> ChannelState;

    /// Receive lifecycle and status events
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Last known machine status
    fn status(&self) -> MachineStatus;

    /// Open the transport and run the handshake; true once Ready
    async fn connection_open(&self, options: &OpenOptions) -> bool;

    /// Close the connection; `force` skips the goodbye exchange
    async fn connection_close(&self, force: bool) -> bool;

    /// Start heartbeat reports and the watchdog
    async fn start_heartbeat(&self) -> bool;

    /// Stop heartbeat reports and the watchdog
    async fn stop_heartbeat(&self) -> bool;

    fn gcode(&self) -> Option<&dyn GcodeChannel> {
        None
    }

    fn file(&self) -> Option<&dyn FileChannel> {
        None
    }

    fn laser(&self) -> Option<&dyn LaserChannel> {
        None
    }

    fn cnc(&self) -> Option<&dyn CncChannel> {
        None
    }

    fn network_service(&self) -> Option<&dyn NetworkServiceChannel> {
        None
    }

    fn system(&self) -> Option<&dyn SystemChannel> {
        None
    }

    fn motion(&self) -> Option<&dyn MotionChannel> {
        None
    }

    fn printer(&self) -> Option<&dyn PrinterChannel> {
        None
    }

    fn print(&self) -> Option<&dyn PrintChannel> {
        None
    }

    fn enclosure(&self) -> Option<&dyn EnclosureChannel> {
        None
    }
}

/// Raw G-code execution
#[async_trait]
pub trait GcodeChannel: Send + Sync {
    /// Run one or more lines; returns the reply text
    async fn execute_gcode(&self, gcode: &str) -> ChannelResult<String>;
}

/// File upload
#[async_trait]
pub trait FileChannel: Send + Sync {
    /// Upload a file; returns the bytes transferred
    async fn upload_file(&self, options: &UploadOptions) -> ChannelResult<u64>;

    /// Upload a compressed copy of a file
    async fn compress_upload_file(&self, _options: &UploadOptions) -> ChannelResult<u64> {
        Err(ChannelError::Unsupported {
            capability: "compress_upload_file".to_string(),
            protocol: "any".to_string(),
        }
        .into())
    }
}

/// Laser head control
#[async_trait]
pub trait LaserChannel: Send + Sync {
    async fn get_crosshair_offset(&self) -> ChannelResult<CrosshairOffset>;
    async fn set_crosshair_offset(&self, offset: CrosshairOffset) -> ChannelResult<()>;
    async fn get_fire_sensor_sensitivity(&self) -> ChannelResult<u16>;
    async fn set_fire_sensor_sensitivity(&self, sensitivity: u16) -> ChannelResult<()>;
    /// Power in percent
    async fn set_laser_power(&self, power: f64) -> ChannelResult<()>;
    /// Move the head to `height` above the material and zero Z there
    async fn set_work_height(&self, height: f64) -> ChannelResult<()>;
    /// Measure material thickness; returns millimetres
    async fn start_material_thickness_measure(&self) -> ChannelResult<f64>;
    async fn abort_material_thickness_measure(&self) -> ChannelResult<()>;
}

/// CNC spindle control
#[async_trait]
pub trait CncChannel: Send + Sync {
    async fn set_spindle_speed(&self, rpm: u32) -> ChannelResult<()>;
    async fn set_spindle_speed_percentage(&self, percent: u8) -> ChannelResult<()>;
    async fn spindle_on(&self) -> ChannelResult<()>;
    async fn spindle_off(&self) -> ChannelResult<()>;
}

/// Machine Wi-Fi management
#[async_trait]
pub trait NetworkServiceChannel: Send + Sync {
    async fn get_network_configuration(&self) -> ChannelResult<NetworkConfiguration>;
    async fn get_network_station_state(&self) -> ChannelResult<StationState>;
    async fn configure_network(&self, settings: &NetworkSettings) -> ChannelResult<()>;
    async fn list_wifi_networks(&self) -> ChannelResult<Vec<WifiNetwork>>;
}

/// Firmware and logs
#[async_trait]
pub trait SystemChannel: Send + Sync {
    async fn get_firmware_version(&self) -> ChannelResult<String>;
    async fn upgrade_firmware_from_file(&self, path: &Path) -> ChannelResult<()>;
    async fn export_log_to_external_storage(&self) -> ChannelResult<()>;
}

/// Typed motion commands
#[async_trait]
pub trait MotionChannel: Send + Sync {
    /// Home `axes` (all when empty)
    async fn home(&self, axes: &[Axis]) -> ChannelResult<()>;
    /// Absolute move
    async fn move_to(&self, moves: &[(Axis, f64)], feed_rate: Option<u32>) -> ChannelResult<()>;
    /// Current position becomes the work origin
    async fn set_work_origin(&self) -> ChannelResult<()>;
    /// Feed-rate override in percent
    async fn set_speed_factor(&self, percent: u16) -> ChannelResult<()>;
    async fn get_coordinates(&self) -> ChannelResult<CoordinateInfo>;
}

/// Extruder and bed control
#[async_trait]
pub trait PrinterChannel: Send + Sync {
    async fn set_nozzle_temperature(&self, extruder: u8, celsius: f64) -> ChannelResult<()>;
    async fn set_bed_temperature(&self, celsius: f64) -> ChannelResult<()>;
    async fn switch_extruder(&self, extruder: u8) -> ChannelResult<()>;
    async fn load_filament(&self, extruder: u8) -> ChannelResult<()>;
    async fn unload_filament(&self, extruder: u8) -> ChannelResult<()>;
    async fn set_z_offset(&self, extruder: u8, offset: f64) -> ChannelResult<()>;
}

/// Job control
#[async_trait]
pub trait PrintChannel: Send + Sync {
    /// Start a job; the file must already be on the machine unless the channel streams
    async fn start_print(&self, job: &PrintJob) -> ChannelResult<()>;
    async fn pause_print(&self) -> ChannelResult<()>;
    async fn resume_print(&self) -> ChannelResult<()>;
    async fn stop_print(&self) -> ChannelResult<()>;
}

/// Enclosure accessories
#[async_trait]
pub trait EnclosureChannel: Send + Sync {
    /// Light brightness 0-100
    async fn set_enclosure_light(&self, brightness: u8) -> ChannelResult<()>;
    /// Fan speed 0-100
    async fn set_enclosure_fan(&self, speed: u8) -> ChannelResult<()>;
    async fn set_door_detection(&self, enabled: bool) -> ChannelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_target_name_defaults_to_file_name() {
        let options = UploadOptions::new("/tmp/jobs/part.nc");
        assert_eq!(options.target_name(), "part.nc");

        let options = UploadOptions {
            path: PathBuf::from("/tmp/jobs/part.nc"),
            target_name: Some("renamed.nc".to_string()),
        };
        assert_eq!(options.target_name(), "renamed.nc");
    }

    #[test]
    fn test_unsupported_names_capability() {
        let err = unsupported("laser", Protocol::Text);
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("laser"));
    }
}
