//! Reply parsing for the line-oriented G-code protocol

use fablink_core::MachineModel;
use regex::Regex;
use std::sync::OnceLock;

/// Classification of one received line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine {
    /// Command acknowledged
    Ok,
    /// Command failed
    Error(String),
    /// Informational echo
    Echo(String),
    /// Anything else (reports, banners)
    Data(String),
}

impl ReplyLine {
    /// Classify a trimmed line
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == "ok" || line.starts_with("ok ") {
            ReplyLine::Ok
        } else if let Some(rest) = strip_prefix_ci(line, "error:") {
            ReplyLine::Error(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("echo:") {
            ReplyLine::Echo(rest.trim().to_string())
        } else {
            ReplyLine::Data(line.to_string())
        }
    }

    /// Whether the line ends a command's reply
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplyLine::Ok | ReplyLine::Error(_))
    }
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &line[prefix.len()..])
}

/// Whether a probe reply looks like text firmware
pub fn is_legible_reply(line: &str) -> bool {
    let line = line.trim();
    line == "ok"
        || line.starts_with("ok ")
        || line.starts_with("echo:")
        || line.starts_with("Firmware")
        || strip_prefix_ci(line, "error:").is_some()
}

/// Temperatures from an `M105`-style report
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemperatureReport {
    /// (current, target) per extruder, in tool order
    pub nozzles: Vec<(f64, f64)>,
    /// (current, target) of the bed
    pub bed: Option<(f64, f64)>,
}

/// Parse `T:<cur> /<target> B:<cur> /<target>` (also `T0:` / `T1:`)
///
/// Values keep their decimals. Returns `None` when the line carries no
/// temperature pair.
pub fn parse_temperature(line: &str) -> Option<TemperatureReport> {
    static TEMPERATURE_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = TEMPERATURE_REGEX.get_or_init(|| {
        Regex::new(r"\b(T\d?|B):\s*(-?\d+(?:\.\d+)?)\s*/\s*(-?\d+(?:\.\d+)?)")
            .expect("invalid regex pattern")
    });

    let mut report = TemperatureReport::default();
    let mut plain_nozzle = None;
    for caps in regex.captures_iter(line) {
        let (Ok(current), Ok(target)) = (caps[2].parse::<f64>(), caps[3].parse::<f64>()) else {
            continue;
        };
        match &caps[1] {
            "B" => report.bed = Some((current, target)),
            "T" => plain_nozzle = Some((current, target)),
            _ => report.nozzles.push((current, target)),
        }
    }
    // Marlin repeats the active tool as plain `T:` when `T0:`/`T1:` are present.
    if report.nozzles.is_empty() {
        report.nozzles.extend(plain_nozzle);
    }

    (!report.nozzles.is_empty() || report.bed.is_some()).then_some(report)
}

/// Firmware version from an `M1005` reply line
pub fn parse_firmware_version(line: &str) -> Option<String> {
    static VERSION_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = VERSION_REGEX.get_or_init(|| {
        Regex::new(r"(?i)firmware version:\s*(\S+)").expect("invalid regex pattern")
    });
    regex.captures(line).map(|caps| caps[1].to_string())
}

/// Machine model from an `M1005` size line (`Machine Size: L`)
pub fn parse_machine_size(line: &str) -> Option<MachineModel> {
    static SIZE_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = SIZE_REGEX.get_or_init(|| {
        Regex::new(r"(?i)machine size:\s*(\w+)").expect("invalid regex pattern")
    });
    let size = regex.captures(line)?;
    Some(match size[1].to_ascii_uppercase().as_str() {
        "S" | "A150" => MachineModel::A150,
        "M" | "A250" => MachineModel::A250,
        "L" | "A350" => MachineModel::A350,
        other => MachineModel::from_series(other),
    })
}
