//! Commands accepted at the manager boundary and their responses
//!
//! A command arrives as `{ "event": "<name>", "options": { .. } }` and is
//! always answered with one [`Response`] carrying the same event name.

use super::ConnectionTarget;
use crate::sacp::messages::{Axis, CrosshairOffset, NetworkSettings};
use fablink_core::{Error, HeadType, Protocol};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Open request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    /// Host or serial port
    pub target: ConnectionTarget,
    /// Skip detection and use this protocol
    #[serde(default)]
    pub protocol: Option<Protocol>,
    /// Token from an earlier HTTP session
    #[serde(default)]
    pub token: Option<String>,
}

/// Where the material thickness for a laser job comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MaterialThicknessSource {
    /// Value given with the job
    #[default]
    Manual,
    /// Measured by the head before the job
    Auto,
}

/// Move the head to a point and make it the work origin before the job
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSnap {
    /// X in machine coordinates
    pub x: f64,
    /// Y in machine coordinates
    pub y: f64,
}

/// Options of `connection:startGcode`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// G-code file on disk
    pub path: PathBuf,
    /// Name on the machine; the local file name when absent
    #[serde(default)]
    pub target_name: Option<String>,
    /// Head the job was generated for; the connected head when absent
    #[serde(default)]
    pub head_type: Option<HeadType>,
    /// Material thickness in millimetres
    #[serde(default)]
    pub material_thickness: f64,
    /// Manual or measured thickness
    #[serde(default)]
    pub material_thickness_source: MaterialThicknessSource,
    /// Laser focal length in millimetres; the reported one when absent
    #[serde(default)]
    pub focal_length: Option<f64>,
    /// Job runs on the rotary module
    #[serde(default)]
    pub is_rotate: bool,
    /// Workpiece radius on the rotary module
    #[serde(default)]
    pub cylinder_radius: Option<f64>,
    /// Coordinate snap for background-mode jobs
    #[serde(default)]
    pub background: Option<BackgroundSnap>,
    /// Laser power the job runs at, restored on resume
    #[serde(default)]
    pub laser_power: Option<f64>,
    /// Spindle speed the job runs at, restored on resume
    #[serde(default)]
    pub spindle_rpm: Option<u32>,
}

impl StartOptions {
    /// Job for `path` with every optional step off
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            target_name: None,
            head_type: None,
            material_thickness: 0.0,
            material_thickness_source: MaterialThicknessSource::Manual,
            focal_length: None,
            is_rotate: false,
            cylinder_radius: None,
            background: None,
            laser_power: None,
            spindle_rpm: None,
        }
    }
}

/// One axis target of a coordinate move
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisMove {
    /// Axis
    pub axis: Axis,
    /// Absolute position
    pub position: f64,
}

/// Every command the manager answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "options")]
pub enum Command {
    #[serde(rename = "connection:open")]
    Open(OpenRequest),
    #[serde(rename = "connection:close")]
    Close {
        #[serde(default)]
        force: bool,
    },
    #[serde(rename = "connection:getActiveConnection")]
    GetActiveConnection,
    #[serde(rename = "connection:listSerialPorts")]
    ListSerialPorts,
    #[serde(rename = "connection:executeGcode")]
    ExecuteGcode { gcode: String },
    #[serde(rename = "connection:goHome")]
    Home {
        #[serde(default)]
        axes: Vec<Axis>,
    },
    #[serde(rename = "connection:coordinateMove", rename_all = "camelCase")]
    CoordinateMove {
        moves: Vec<AxisMove>,
        #[serde(default)]
        feed_rate: Option<u32>,
    },
    #[serde(rename = "connection:setWorkOrigin")]
    SetWorkOrigin,
    #[serde(rename = "connection:updateWorkSpeedFactor")]
    SpeedFactor { percent: u16 },
    #[serde(rename = "connection:switchExtruder")]
    SwitchExtruder { extruder: u8 },
    #[serde(rename = "connection:updateNozzleTemperature")]
    NozzleTemperature {
        #[serde(default)]
        extruder: u8,
        temperature: f64,
    },
    #[serde(rename = "connection:updateBedTemperature")]
    BedTemperature { temperature: f64 },
    #[serde(rename = "connection:loadFilament")]
    LoadFilament {
        #[serde(default)]
        extruder: u8,
    },
    #[serde(rename = "connection:unloadFilament")]
    UnloadFilament {
        #[serde(default)]
        extruder: u8,
    },
    #[serde(rename = "connection:updateZOffset", rename_all = "camelCase")]
    ZOffset {
        #[serde(default)]
        extruder: u8,
        z_offset: f64,
    },
    #[serde(rename = "connection:updateLaserPower", rename_all = "camelCase")]
    LaserPower {
        laser_power: f64,
        #[serde(default)]
        is_printing: bool,
    },
    #[serde(rename = "connection:getCrosshairOffset")]
    GetCrosshairOffset,
    #[serde(rename = "connection:setCrosshairOffset")]
    SetCrosshairOffset(CrosshairOffset),
    #[serde(rename = "connection:getFireSensorSensitivity")]
    GetFireSensorSensitivity,
    #[serde(rename = "connection:setFireSensorSensitivity")]
    SetFireSensorSensitivity { sensitivity: u16 },
    #[serde(rename = "connection:materialThickness")]
    MaterialThickness,
    #[serde(rename = "connection:materialThickness_abort")]
    AbortMaterialThickness,
    #[serde(rename = "connection:updateWorkHeight")]
    WorkHeight { height: f64 },
    #[serde(rename = "connection:switchCNC")]
    Spindle {
        on: bool,
        #[serde(default)]
        rpm: Option<u32>,
    },
    #[serde(rename = "connection:updateToolHeadSpeed")]
    SpindleSpeed { rpm: u32 },
    #[serde(rename = "connection:updateToolHeadSpeedPercentage")]
    SpindleSpeedPercentage { percent: u8 },
    #[serde(rename = "connection:updateEnclosureLight")]
    EnclosureLight { value: u8 },
    #[serde(rename = "connection:updateEnclosureFan")]
    EnclosureFan { value: u8 },
    #[serde(rename = "connection:updateEnclosureDoorDetection")]
    EnclosureDoorDetection { enabled: bool },
    #[serde(rename = "connection:uploadFile", rename_all = "camelCase")]
    UploadFile {
        path: PathBuf,
        #[serde(default)]
        target_name: Option<String>,
    },
    #[serde(rename = "connection:getNetworkConfiguration")]
    GetNetworkConfiguration,
    #[serde(rename = "connection:getNetworkStationState")]
    GetNetworkStationState,
    #[serde(rename = "connection:configureNetwork")]
    ConfigureNetwork(NetworkSettings),
    #[serde(rename = "connection:getWifiNetworks")]
    ListWifiNetworks,
    #[serde(rename = "connection:getFirmwareVersion")]
    GetFirmwareVersion,
    #[serde(rename = "connection:upgradeFirmware")]
    UpgradeFirmware { path: PathBuf },
    #[serde(rename = "connection:exportLog")]
    ExportLog,
    #[serde(rename = "connection:startGcode")]
    StartGcode(StartOptions),
    #[serde(rename = "connection:pauseGcode")]
    PauseGcode,
    #[serde(rename = "connection:resumeGcode")]
    ResumeGcode,
    #[serde(rename = "connection:stopGcode")]
    StopGcode,
}

impl Command {
    /// Event name, also used for the response
    pub fn name(&self) -> &'static str {
        match self {
            Command::Open(_) => "connection:open",
            Command::Close { .. } => "connection:close",
            Command::GetActiveConnection => "connection:getActiveConnection",
            Command::ListSerialPorts => "connection:listSerialPorts",
            Command::ExecuteGcode { .. } => "connection:executeGcode",
            Command::Home { .. } => "connection:goHome",
            Command::CoordinateMove { .. } => "connection:coordinateMove",
            Command::SetWorkOrigin => "connection:setWorkOrigin",
            Command::SpeedFactor { .. } => "connection:updateWorkSpeedFactor",
            Command::SwitchExtruder { .. } => "connection:switchExtruder",
            Command::NozzleTemperature { .. } => "connection:updateNozzleTemperature",
            Command::BedTemperature { .. } => "connection:updateBedTemperature",
            Command::LoadFilament { .. } => "connection:loadFilament",
            Command::UnloadFilament { .. } => "connection:unloadFilament",
            Command::ZOffset { .. } => "connection:updateZOffset",
            Command::LaserPower { .. } => "connection:updateLaserPower",
            Command::GetCrosshairOffset => "connection:getCrosshairOffset",
            Command::SetCrosshairOffset(_) => "connection:setCrosshairOffset",
            Command::GetFireSensorSensitivity => "connection:getFireSensorSensitivity",
            Command::SetFireSensorSensitivity { .. } => "connection:setFireSensorSensitivity",
            Command::MaterialThickness => "connection:materialThickness",
            Command::AbortMaterialThickness => "connection:materialThickness_abort",
            Command::WorkHeight { .. } => "connection:updateWorkHeight",
            Command::Spindle { .. } => "connection:switchCNC",
            Command::SpindleSpeed { .. } => "connection:updateToolHeadSpeed",
            Command::SpindleSpeedPercentage { .. } => "connection:updateToolHeadSpeedPercentage",
            Command::EnclosureLight { .. } => "connection:updateEnclosureLight",
            Command::EnclosureFan { .. } => "connection:updateEnclosureFan",
            Command::EnclosureDoorDetection { .. } => "connection:updateEnclosureDoorDetection",
            Command::UploadFile { .. } => "connection:uploadFile",
            Command::GetNetworkConfiguration => "connection:getNetworkConfiguration",
            Command::GetNetworkStationState => "connection:getNetworkStationState",
            Command::ConfigureNetwork(_) => "connection:configureNetwork",
            Command::ListWifiNetworks => "connection:getWifiNetworks",
            Command::GetFirmwareVersion => "connection:getFirmwareVersion",
            Command::UpgradeFirmware { .. } => "connection:upgradeFirmware",
            Command::ExportLog => "connection:exportLog",
            Command::StartGcode(_) => "connection:startGcode",
            Command::PauseGcode => "connection:pauseGcode",
            Command::ResumeGcode => "connection:resumeGcode",
            Command::StopGcode => "connection:stopGcode",
        }
    }
}

/// Answer to one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Event name of the command
    pub event: String,
    /// 0 on success, 1 on failure
    pub err: u8,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub msg: Option<String>,
    /// Result payload
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

impl Response {
    /// Success, with an optional payload
    pub fn ok(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            err: 0,
            msg: None,
            data,
        }
    }

    /// Failure carrying the error's message
    pub fn error(event: impl Into<String>, error: &Error) -> Self {
        Self {
            event: event.into(),
            err: 1,
            msg: Some(error.to_string()),
            data: None,
        }
    }

    /// Whether the command succeeded
    pub fn is_ok(&self) -> bool {
        self.err == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_from_json() {
        let command: Command = serde_json::from_value(json!({
            "event": "connection:updateLaserPower",
            "options": { "laserPower": 50.0, "isPrinting": true }
        }))
        .unwrap();
        assert_eq!(
            command,
            Command::LaserPower {
                laser_power: 50.0,
                is_printing: true
            }
        );
        assert_eq!(command.name(), "connection:updateLaserPower");

        let command: Command = serde_json::from_value(json!({ "event": "connection:pauseGcode" })).unwrap();
        assert_eq!(command, Command::PauseGcode);
    }

    #[test]
    fn test_open_request_from_json() {
        let command: Command = serde_json::from_value(json!({
            "event": "connection:open",
            "options": { "target": { "type": "network", "host": "192.168.1.20" } }
        }))
        .unwrap();
        match command {
            Command::Open(request) => {
                assert_eq!(
                    request.target,
                    ConnectionTarget::Network {
                        host: "192.168.1.20".to_string()
                    }
                );
                assert!(request.protocol.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::error(
            "connection:goHome",
            &fablink_core::ChannelError::NotConnected.into(),
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({ "event": "connection:goHome", "err": 1, "msg": "Machine is not connected" })
        );
    }
}
