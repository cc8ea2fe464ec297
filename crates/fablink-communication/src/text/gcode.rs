//! G-code synthesis for legacy protocols
//!
//! Every machine operation the legacy firmware only understands as G-code
//! is built here, so both the HTTP channel and the serial text channel send
//! identical strings. Multi-line programs are joined with `\n`.

use crate::sacp::messages::Axis;
use fablink_core::{HeadType, Position};
use regex::Regex;
use std::sync::OnceLock;

/// Temperature report query
pub const QUERY_TEMPERATURE: &str = "M105";
/// Firmware identification query
pub const QUERY_FIRMWARE: &str = "M1005";
/// Laser / spindle off
pub const TOOL_OFF: &str = "M5";

/// Feed rate for XY travel when recovering a paused job
pub const RECOVERY_TRAVEL_FEED: u32 = 3000;
/// Feed rate for Z moves when recovering a paused job
pub const RECOVERY_Z_FEED: u32 = 1000;
/// Feed rate of the work-height move
pub const WORK_HEIGHT_FEED: u32 = 1500;

/// Format a number without trailing zeros (`127.5`, `50`, `0.125`)
pub fn num(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

/// Laser power command
///
/// While a job runs, or while the beam is already on, the new power is
/// applied immediately as `M3 P<percent> S<percent*255/100>`; an idle
/// machine with the beam off gets `M5`.
pub fn laser_power(power: f64, is_printing: bool, laser_on: bool) -> String {
    if is_printing || laser_on {
        format!("M3 P{} S{}", num(power), num(power * 255.0 / 100.0))
    } else {
        TOOL_OFF.to_string()
    }
}

/// Home the given axes (all when empty)
pub fn home(axes: &[Axis]) -> String {
    axes.iter().fold("G28".to_string(), |mut line, axis| {
        line.push(' ');
        line.push(axis.letter());
        line
    })
}

/// Absolute rapid move
pub fn move_to(moves: &[(Axis, f64)], feed_rate: Option<u32>) -> String {
    let mut line = String::from("G0");
    for (axis, pos) in moves {
        line.push_str(&format!(" {}{}", axis.letter(), num(*pos)));
    }
    if let Some(feed) = feed_rate {
        line.push_str(&format!(" F{}", feed));
    }
    format!("G90\n{}", line)
}

/// Make the current position the work origin
pub fn set_work_origin(axes: &[Axis]) -> String {
    let axes: &[Axis] = if axes.is_empty() {
        &[Axis::X, Axis::Y, Axis::Z]
    } else {
        axes
    };
    axes.iter().fold("G92".to_string(), |line, axis| {
        format!("{} {}0", line, axis.letter())
    })
}

/// Feed-rate override in percent
pub fn speed_factor(percent: u16) -> String {
    format!("M220 S{}", percent)
}

/// Nozzle target temperature; `extruder` selects a tool on dual-head machines
pub fn nozzle_temperature(extruder: Option<u8>, celsius: f64) -> String {
    match extruder {
        Some(tool) => format!("M104 T{} S{}", tool, num(celsius)),
        None => format!("M104 S{}", num(celsius)),
    }
}

/// Bed target temperature
pub fn bed_temperature(celsius: f64) -> String {
    format!("M140 S{}", num(celsius))
}

/// Select the active extruder
pub fn switch_extruder(extruder: u8) -> String {
    format!("T{}", extruder)
}

/// Load filament into `extruder`
pub fn load_filament(extruder: u8) -> String {
    format!("M701 T{}", extruder)
}

/// Unload filament from `extruder`
pub fn unload_filament(extruder: u8) -> String {
    format!("M702 T{}", extruder)
}

/// Adjust the Z offset live (babystep) by `offset` millimetres
pub fn z_offset(offset: f64) -> String {
    format!("M290 Z{}", num(offset))
}

/// Move Z to the work height (machine coordinates) and zero work Z there
pub fn work_height(height: f64) -> String {
    format!(
        "G53\nG0 Z{} F{}\nG54\nG92 Z0",
        num(height),
        WORK_HEIGHT_FEED
    )
}

/// Spindle on at `rpm`, or at full power when unspecified
pub fn spindle_on(rpm: Option<u32>) -> String {
    match rpm {
        Some(rpm) => format!("M3 S{}", rpm),
        None => "M3 P100".to_string(),
    }
}

/// Spindle speed in rpm
pub fn spindle_speed(rpm: u32) -> String {
    format!("M3 S{}", rpm)
}

/// Spindle speed in percent of maximum
pub fn spindle_speed_percentage(percent: u8) -> String {
    format!("M3 P{}", percent)
}

/// Enclosure light brightness (0-100)
pub fn enclosure_light(brightness: u8) -> String {
    format!("M1010 S3 P{}", brightness)
}

/// Enclosure fan speed (0-100)
pub fn enclosure_fan(speed: u8) -> String {
    format!("M1010 S4 P{}", speed)
}

/// Enclosure door detection on/off
pub fn enclosure_door_detection(enabled: bool) -> String {
    format!("M1010 S1 P{}", u8::from(enabled))
}

/// Switch the tool off after a stopped job
pub fn tool_off(head: HeadType) -> String {
    match head {
        HeadType::Printing => "M104 S0\nM140 S0\nM107".to_string(),
        HeadType::Laser | HeadType::Cnc => TOOL_OFF.to_string(),
    }
}

/// Extract `;max_z(mm): <v>` from a G-code header
pub fn parse_max_z(header: &str) -> Option<f64> {
    static MAX_Z_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = MAX_Z_REGEX.get_or_init(|| {
        Regex::new(r"(?m)^;\s*max_z\(mm\):\s*(-?\d+(?:\.\d+)?)\s*$").expect("invalid regex pattern")
    });
    regex.captures(header)?[1].parse().ok()
}

/// Tool state to restore when resuming a paused job
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToolRestore {
    /// Nothing to re-enable
    None,
    /// Laser at `power` percent
    Laser {
        /// Power percent
        power: f64,
    },
    /// Spindle at `rpm`
    Spindle {
        /// Spindle speed
        rpm: u32,
    },
}

impl ToolRestore {
    /// Pick the restore step for `head`
    pub fn for_head(head: HeadType, laser_power: Option<f64>, spindle_rpm: Option<u32>) -> Self {
        match (head, laser_power, spindle_rpm) {
            (HeadType::Laser, Some(power), _) if power > 0.0 => ToolRestore::Laser { power },
            (HeadType::Cnc, _, Some(rpm)) if rpm > 0 => ToolRestore::Spindle { rpm },
            _ => ToolRestore::None,
        }
    }
}

/// Position-recovery program replayed before resuming a legacy job
///
/// Re-homes Z, travels back over the pause point, descends through the
/// header's `max_z` clearance when known, then to the pause height, and
/// finally re-enables the tool. A missing or malformed header skips the
/// clearance step.
pub fn resume_snippet(pause: &Position, gcode_header: Option<&str>, tool: ToolRestore) -> String {
    let mut lines = vec!["G90".to_string(), "G28 Z".to_string()];

    let mut travel = format!("G0 X{} Y{}", num(pause.x), num(pause.y));
    if let Some(b) = pause.b {
        travel.push_str(&format!(" B{}", num(b)));
    }
    travel.push_str(&format!(" F{}", RECOVERY_TRAVEL_FEED));
    lines.push(travel);

    if let Some(max_z) = gcode_header.and_then(parse_max_z) {
        lines.push(format!("G0 Z{} F{}", num(max_z), RECOVERY_Z_FEED));
    } else {
        tracing::warn!("No usable max_z header, resuming without the clearance move");
    }
    lines.push(format!("G0 Z{} F{}", num(pause.z), RECOVERY_Z_FEED));

    match tool {
        ToolRestore::Laser { power } => lines.push(laser_power(power, true, true)),
        ToolRestore::Spindle { rpm } => lines.push(spindle_speed(rpm)),
        ToolRestore::None => {}
    }

    lines.join("\n")
}
