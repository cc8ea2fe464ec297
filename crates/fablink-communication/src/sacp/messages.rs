//! Typed SACP payloads
//!
//! Builders for request bodies and parsers for ack data. Ack data here is
//! what follows the result byte (see [`SacpResponse`](super::SacpResponse)).

use crate::codec::{ByteReader, ByteWriter};
use fablink_core::{MachineModel, Position, PrintState, ProtocolError};
use serde::{Deserialize, Serialize};

/// Motion axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
    /// Rotary axis
    B,
}

impl Axis {
    /// Wire id
    pub fn id(self) -> u8 {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::B => 3,
        }
    }

    /// Letter used in G-code words
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::B => 'B',
        }
    }
}

/// Bit mask selecting axes for homing; empty means all
pub fn axis_mask(axes: &[Axis]) -> u8 {
    if axes.is_empty() {
        return 0xff;
    }
    axes.iter().fold(0u8, |mask, axis| mask | (1 << axis.id()))
}

/// Identification returned by the machine-info query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Machine model
    pub model: MachineModel,
    /// Hardware revision
    pub hardware_version: String,
    /// Serial number
    pub serial_number: String,
    /// Firmware version
    pub firmware_version: String,
}

impl MachineInfo {
    /// Parse `[model u8, hw string, serial string, fw string]`
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(data);
        Ok(Self {
            model: MachineModel::from_id(reader.u8()?),
            hardware_version: reader.string()?,
            serial_number: reader.string()?,
            firmware_version: reader.string()?,
        })
    }
}

/// Coordinate report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateInfo {
    /// All axes homed
    pub homed: bool,
    /// Work position
    pub position: Position,
}

impl CoordinateInfo {
    /// Parse `[homed u8, x f32, y f32, z f32, b f32]`
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(data);
        let homed = reader.u8()? != 0;
        let x = reader.f32()? as f64;
        let y = reader.f32()? as f64;
        let z = reader.f32()? as f64;
        let b = if reader.remaining() >= 4 {
            Some(reader.f32()? as f64)
        } else {
            None
        };
        Ok(Self {
            homed,
            position: Position { x, y, z, b },
        })
    }
}

/// Parse a heartbeat report body `[status u8]`
pub fn parse_heartbeat(data: &[u8]) -> Result<PrintState, ProtocolError> {
    Ok(PrintState::from_status_byte(ByteReader::new(data).u8()?))
}

/// Build the move body `[count u8, (axis u8, pos f32)*, feed u16]`
pub fn move_payload(moves: &[(Axis, f64)], feed_rate: u16) -> Vec<u8> {
    moves
        .iter()
        .fold(ByteWriter::new().u8(moves.len() as u8), |w, (axis, pos)| {
            w.u8(axis.id()).f32(*pos as f32)
        })
        .u16(feed_rate)
        .finish()
}

/// Subscription body `[set, id, interval u16]`
pub fn subscribe_payload(set: u8, id: u8, interval_ms: u16) -> Vec<u8> {
    ByteWriter::new().u8(set).u8(id).u16(interval_ms).finish()
}

/// Crosshair offset of the laser module, in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CrosshairOffset {
    /// X offset
    pub x: f64,
    /// Y offset
    pub y: f64,
}

impl CrosshairOffset {
    /// Parse `[x f32, y f32]`
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(data);
        Ok(Self {
            x: reader.f32()? as f64,
            y: reader.f32()? as f64,
        })
    }

    /// Encode `[x f32, y f32]`
    pub fn encode(&self) -> Vec<u8> {
        ByteWriter::new().f32(self.x as f32).f32(self.y as f32).finish()
    }
}

/// Network mode of the machine's Wi-Fi module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Joined to an access point
    Station,
    /// Hosting its own access point
    AccessPoint,
}

impl NetworkMode {
    fn from_u8(value: u8) -> Self {
        if value == 1 {
            NetworkMode::AccessPoint
        } else {
            NetworkMode::Station
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            NetworkMode::Station => 0,
            NetworkMode::AccessPoint => 1,
        }
    }
}

/// Current network configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    /// Station or access point
    pub mode: NetworkMode,
    /// SSID in use
    pub ssid: String,
    /// Assigned address
    pub ip: String,
}

impl NetworkConfiguration {
    /// Parse `[mode u8, ssid string, ip string]`
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(data);
        Ok(Self {
            mode: NetworkMode::from_u8(reader.u8()?),
            ssid: reader.string()?,
            ip: reader.string()?,
        })
    }
}

/// Request to join a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Station or access point
    pub mode: NetworkMode,
    /// SSID to join or host
    pub ssid: String,
    /// Passphrase
    pub password: String,
}

impl NetworkSettings {
    /// Encode `[mode u8, ssid string, password string]`
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(ByteWriter::new()
            .u8(self.mode.as_u8())
            .string(&self.ssid)?
            .string(&self.password)?
            .finish())
    }
}

/// Station connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationState {
    /// Not associated
    Disconnected,
    /// Associating
    Connecting,
    /// Associated and addressed
    Connected,
}

impl StationState {
    /// Parse `[state u8]`
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match ByteReader::new(data).u8()? {
            2 => StationState::Connected,
            1 => StationState::Connecting,
            _ => StationState::Disconnected,
        })
    }
}

/// One scanned access point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    /// SSID
    pub ssid: String,
    /// Signal strength in dBm
    pub rssi: i32,
}

/// Parse `[count u8, (ssid string, rssi i32)*]`
pub fn parse_wifi_list(data: &[u8]) -> Result<Vec<WifiNetwork>, ProtocolError> {
    let mut reader = ByteReader::new(data);
    let count = reader.u8()?;
    (0..count)
        .map(|_| {
            Ok(WifiNetwork {
                ssid: reader.string()?,
                rssi: reader.i32()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_info() {
        let data = ByteWriter::new()
            .u8(3)
            .string("HW2")
            .unwrap()
            .string("SN-42")
            .unwrap()
            .string("1.2.3")
            .unwrap()
            .finish();
        let info = MachineInfo::parse(&data).unwrap();
        assert_eq!(info.model, MachineModel::Artisan);
        assert_eq!(info.serial_number, "SN-42");
        assert_eq!(info.firmware_version, "1.2.3");
    }

    #[test]
    fn test_coordinate_info_without_b() {
        let data = ByteWriter::new().u8(1).f32(10.0).f32(20.5).f32(3.0).finish();
        let info = CoordinateInfo::parse(&data).unwrap();
        assert!(info.homed);
        assert_eq!(info.position.y, 20.5);
        assert_eq!(info.position.b, None);
    }

    #[test]
    fn test_move_payload_layout() {
        let payload = move_payload(&[(Axis::X, 1.0), (Axis::Z, -2.0)], 3000);
        assert_eq!(payload[0], 2);
        assert_eq!(payload[1], 0);
        assert_eq!(&payload[2..6], &1.0f32.to_le_bytes());
        assert_eq!(payload[6], 2);
        assert_eq!(&payload[11..], &3000u16.to_le_bytes());
    }

    #[test]
    fn test_axis_mask() {
        assert_eq!(axis_mask(&[]), 0xff);
        assert_eq!(axis_mask(&[Axis::X, Axis::Z]), 0b101);
    }

    #[test]
    fn test_wifi_list() {
        let data = ByteWriter::new()
            .u8(2)
            .string("shop")
            .unwrap()
            .i32(-40)
            .string("guest")
            .unwrap()
            .i32(-71)
            .finish();
        let list = parse_wifi_list(&data).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].rssi, -71);

        let truncated = &data[..data.len() - 1];
        assert!(parse_wifi_list(truncated).is_err());
    }
}
