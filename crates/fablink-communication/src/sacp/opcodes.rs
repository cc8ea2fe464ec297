//! SACP opcode table

use super::packet::CommandId;

// System
pub const SUBSCRIBE: CommandId = CommandId::new(0x01, 0x00);
pub const UNSUBSCRIBE: CommandId = CommandId::new(0x01, 0x01);
pub const EXECUTE_GCODE: CommandId = CommandId::new(0x01, 0x02);
pub const CONNECT: CommandId = CommandId::new(0x01, 0x05);
pub const DISCONNECT: CommandId = CommandId::new(0x01, 0x06);
pub const MACHINE_INFO: CommandId = CommandId::new(0x01, 0x21);
pub const COORDINATE_INFO: CommandId = CommandId::new(0x01, 0x30);
pub const SET_WORK_ORIGIN: CommandId = CommandId::new(0x01, 0x32);
pub const MOVE: CommandId = CommandId::new(0x01, 0x34);
pub const HOME: CommandId = CommandId::new(0x01, 0x35);
pub const SPEED_FACTOR: CommandId = CommandId::new(0x01, 0x37);
pub const HEARTBEAT: CommandId = CommandId::new(0x01, 0xA0);

// Extruders
pub const NOZZLE_TEMPERATURE: CommandId = CommandId::new(0x10, 0x02);
pub const LOAD_FILAMENT: CommandId = CommandId::new(0x10, 0x04);
pub const UNLOAD_FILAMENT: CommandId = CommandId::new(0x10, 0x05);
pub const SWITCH_EXTRUDER: CommandId = CommandId::new(0x10, 0x06);
pub const Z_OFFSET: CommandId = CommandId::new(0x10, 0x08);

// Spindle
pub const SPINDLE_SPEED: CommandId = CommandId::new(0x11, 0x01);
pub const SPINDLE_SPEED_PERCENTAGE: CommandId = CommandId::new(0x11, 0x02);
pub const SPINDLE_ON: CommandId = CommandId::new(0x11, 0x03);
pub const SPINDLE_OFF: CommandId = CommandId::new(0x11, 0x04);

// Laser
pub const LASER_POWER: CommandId = CommandId::new(0x12, 0x01);
pub const WORK_HEIGHT: CommandId = CommandId::new(0x12, 0x02);
pub const GET_CROSSHAIR_OFFSET: CommandId = CommandId::new(0x12, 0x07);
pub const SET_CROSSHAIR_OFFSET: CommandId = CommandId::new(0x12, 0x08);
pub const GET_FIRE_SENSOR_SENSITIVITY: CommandId = CommandId::new(0x12, 0x0C);
pub const SET_FIRE_SENSOR_SENSITIVITY: CommandId = CommandId::new(0x12, 0x0D);
pub const START_THICKNESS_MEASURE: CommandId = CommandId::new(0x12, 0x0E);
pub const ABORT_THICKNESS_MEASURE: CommandId = CommandId::new(0x12, 0x0F);

// Heated bed
pub const BED_TEMPERATURE: CommandId = CommandId::new(0x14, 0x02);

// Enclosure
pub const ENCLOSURE_LIGHT: CommandId = CommandId::new(0x15, 0x02);
pub const ENCLOSURE_FAN: CommandId = CommandId::new(0x15, 0x04);
pub const ENCLOSURE_DOOR_DETECTION: CommandId = CommandId::new(0x15, 0x05);

// Network
pub const NETWORK_CONFIGURATION: CommandId = CommandId::new(0x16, 0x01);
pub const NETWORK_STATION_STATE: CommandId = CommandId::new(0x16, 0x02);
pub const CONFIGURE_NETWORK: CommandId = CommandId::new(0x16, 0x03);
pub const WIFI_LIST: CommandId = CommandId::new(0x16, 0x04);

// Print jobs
pub const PRINT_START: CommandId = CommandId::new(0xAC, 0x03);
pub const PRINT_PAUSE: CommandId = CommandId::new(0xAC, 0x04);
pub const PRINT_RESUME: CommandId = CommandId::new(0xAC, 0x05);
pub const PRINT_STOP: CommandId = CommandId::new(0xAC, 0x06);

// Firmware and logs
pub const FIRMWARE_VERSION: CommandId = CommandId::new(0xAD, 0x01);
pub const UPGRADE_FIRMWARE: CommandId = CommandId::new(0xAD, 0x02);
pub const EXPORT_LOG: CommandId = CommandId::new(0xAD, 0x03);

// File transfer
pub const FILE_UPLOAD_START: CommandId = CommandId::new(0xB0, 0x00);
pub const FILE_CHUNK_REQUEST: CommandId = CommandId::new(0xB0, 0x01);
pub const FILE_UPLOAD_FINISHED: CommandId = CommandId::new(0xB0, 0x02);

/// Result code answering a chunk request for an unknown file or index
pub const RESULT_BAD_CHUNK: u8 = 9;
