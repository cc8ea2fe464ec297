//! Data models shared across the connection stack
//!
//! This module provides:
//! - The closed set of wire protocols and their families
//! - Connection kind (network or serial)
//! - Channel lifecycle states
//! - Tool heads and machine models
//! - Position and machine status snapshots

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire protocol spoken by a connected machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// SACP binary frames over a TCP stream
    SacpTcp,
    /// SACP binary frames, one per UDP datagram
    SacpUdp,
    /// SACP binary frames over a serial port
    SacpSerial,
    /// Legacy HTTP API ("SSTP")
    Sstp,
    /// Legacy line-oriented G-code over a serial port
    Text,
    /// Detection did not recognise the machine
    Unknown,
}

impl Protocol {
    /// Protocol generation the machine belongs to
    pub fn family(&self) -> ProtocolFamily {
        match self {
            Protocol::SacpTcp | Protocol::SacpUdp | Protocol::SacpSerial => ProtocolFamily::Sacp,
            Protocol::Sstp | Protocol::Text | Protocol::Unknown => ProtocolFamily::Legacy,
        }
    }

    /// Whether the protocol travels over a network link
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Protocol::SacpSerial | Protocol::Text => ConnectionType::Serial,
            _ => ConnectionType::Network,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SacpTcp => write!(f, "SACP/TCP"),
            Self::SacpUdp => write!(f, "SACP/UDP"),
            Self::SacpSerial => write!(f, "SACP/Serial"),
            Self::Sstp => write!(f, "SSTP/HTTP"),
            Self::Text => write!(f, "Text/Serial"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Protocol generation: typed commands or synthesized G-code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolFamily {
    /// Structured binary commands
    Sacp,
    /// G-code strings
    Legacy,
}

/// Transport kind of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Wi-Fi / Ethernet
    Network,
    /// USB / RS-232
    Serial,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Serial => write!(f, "serial"),
        }
    }
}

/// Lifecycle state of a protocol channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChannelState {
    /// No transport open
    #[default]
    Disconnected,
    /// Transport is being opened
    Connecting,
    /// Transport open, machine not yet identified
    Connected,
    /// Machine identified, capability calls allowed
    Ready,
    /// Tear-down in progress
    Closing,
}

impl ChannelState {
    /// Whether `next` is a legal successor of this state
    ///
    /// Any state may fall back to `Closing` or `Disconnected` when the
    /// transport dies; forward moves must go one step at a time.
    pub fn can_transition_to(&self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Ready)
                | (Connecting | Connected | Ready, Closing)
                | (Connecting | Connected | Ready | Closing, Disconnected)
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Ready => write!(f, "Ready"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

/// Tool head mounted on the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeadType {
    /// FDM extruder(s)
    #[default]
    Printing,
    /// Laser module
    Laser,
    /// CNC spindle
    Cnc,
}

impl fmt::Display for HeadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Printing => write!(f, "printing"),
            Self::Laser => write!(f, "laser"),
            Self::Cnc => write!(f, "cnc"),
        }
    }
}

/// Machine model reported during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineModel {
    /// Snapmaker 2.0 A150
    A150,
    /// Snapmaker 2.0 A250
    A250,
    /// Snapmaker 2.0 A350
    A350,
    /// Snapmaker Artisan (dual extruder)
    Artisan,
    /// Snapmaker J1 (IDEX dual extruder)
    J1,
    /// Snapmaker Ray (laser)
    Ray,
    /// Unrecognised model identifier
    Unknown(u8),
}

impl MachineModel {
    /// Map the machine-info model byte
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => Self::A150,
            1 => Self::A250,
            2 => Self::A350,
            3 => Self::Artisan,
            4 => Self::J1,
            5 => Self::Ray,
            other => Self::Unknown(other),
        }
    }

    /// Map the series string the HTTP API and text firmware report
    pub fn from_series(series: &str) -> Self {
        let s = series.trim().to_ascii_uppercase();
        if s.contains("A150") || s.contains("ORIGINAL") {
            Self::A150
        } else if s.contains("A250") {
            Self::A250
        } else if s.contains("A350") || s.contains("A400") {
            Self::A350
        } else if s.contains("ARTISAN") {
            Self::Artisan
        } else if s.contains("J1") {
            Self::J1
        } else if s.contains("RAY") {
            Self::Ray
        } else {
            Self::Unknown(0xff)
        }
    }

    /// Whether the machine carries two extruders
    pub fn is_dual_extruder(&self) -> bool {
        matches!(self, Self::Artisan | Self::J1)
    }
}

impl fmt::Display for MachineModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A150 => write!(f, "A150"),
            Self::A250 => write!(f, "A250"),
            Self::A350 => write!(f, "A350"),
            Self::Artisan => write!(f, "Artisan"),
            Self::J1 => write!(f, "J1"),
            Self::Ray => write!(f, "Ray"),
            Self::Unknown(id) => write!(f, "Unknown({})", id),
        }
    }
}

/// Machine position in millimetres; `b` is the rotary axis in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
    /// Rotary B-axis position
    pub b: Option<f64>,
}

impl Position {
    /// Create a three-axis position
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, b: None }
    }
}

/// Print / job state reported by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PrintState {
    /// Nothing running
    #[default]
    Idle,
    /// Job starting
    Starting,
    /// Job running
    Running,
    /// Pause requested
    Pausing,
    /// Job paused
    Paused,
    /// Stop requested
    Stopping,
    /// Job stopped
    Stopped,
    /// Job finished
    Completed,
    /// Resume after power loss or pause
    Recovering,
}

impl PrintState {
    /// Map the heartbeat status byte
    pub fn from_status_byte(status: u8) -> Self {
        match status {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Pausing,
            4 => Self::Paused,
            5 => Self::Stopping,
            6 => Self::Stopped,
            7 | 8 => Self::Completed,
            9 | 10 => Self::Recovering,
            _ => Self::Idle,
        }
    }

    /// Map the status strings of the HTTP API
    pub fn from_status_str(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "PAUSED" => Self::Paused,
            "PAUSING" => Self::Pausing,
            "STOPPED" => Self::Stopped,
            "STOPPING" => Self::Stopping,
            "COMPLETED" | "FINISHED" => Self::Completed,
            "STARTING" => Self::Starting,
            _ => Self::Idle,
        }
    }
}

/// Snapshot of the machine status cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MachineStatus {
    /// Job state
    pub print_state: PrintState,
    /// Work position, when reported
    pub position: Option<Position>,
    /// Nozzle temperatures (current, target) per extruder
    pub nozzle_temperatures: Vec<(f64, f64)>,
    /// Bed temperature (current, target)
    pub bed_temperature: Option<(f64, f64)>,
    /// Laser focal length in millimetres
    pub laser_focal_length: Option<f64>,
    /// Mounted tool head
    pub head_type: Option<HeadType>,
}
