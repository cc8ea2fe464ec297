//! Serial port transport
//!
//! Provides port enumeration and a byte stream over a USB / RS-232 port.
//!
//! `serialport` is blocking, so an open port is served by two threads:
//! - a reader polling the port with a short timeout and forwarding bytes
//! - a writer draining the outbound queue
//!
//! Both are bridged to async code with `tokio::sync::mpsc`.

use super::{ByteStream, PumpGuard};
use fablink_core::{ConnectionError, Result};
use std::io::{self, Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Information about an available serial port
#[derive(Debug, Clone, serde::Serialize)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports a machine may be attached to
///
/// Filters to the patterns USB machine controllers enumerate as:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        ConnectionError::SerialError {
            reason: format!("Failed to enumerate ports: {}", e),
        }
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_machine_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, get_port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb_info) => {
                    let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                    if let Some(ref mfg) = usb_info.manufacturer {
                        info = info.with_manufacturer(mfg);
                    }
                    if let Some(ref serial) = usb_info.serial_number {
                        info = info.with_serial_number(serial);
                    }
                    info
                }
                _ => info,
            }
        })
        .collect())
}

/// Check if a port name matches machine controller patterns
fn is_machine_port(port_name: &str) -> bool {
    // Windows COM ports
    if let Some(num) = port_name.strip_prefix("COM") {
        return !num.is_empty() && num.chars().all(|c| c.is_ascii_digit());
    }

    // Linux USB and ACM devices
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }

    // macOS serial and modem devices
    port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem")
}

/// Get a user-friendly description for a port
fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Open `port` at `baud_rate` (8N1, no flow control)
pub fn open(port: &str, baud_rate: u32) -> Result<ByteStream> {
    let reader = serialport::new(port, baud_rate)
        .timeout(Duration::from_millis(10)) // Short timeout so the reader notices cancellation
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| {
            tracing::warn!("Failed to open serial port {}: {}", port, e);
            match e.kind() {
                serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                    port: port.to_string(),
                },
                _ => ConnectionError::FailedToOpen {
                    port: port.to_string(),
                    reason: e.to_string(),
                },
            }
        })?;
    let writer = reader.try_clone().map_err(|e| ConnectionError::FailedToOpen {
        port: port.to_string(),
        reason: e.to_string(),
    })?;

    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(super::STREAM_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(super::STREAM_CAPACITY);
    let cancel = CancellationToken::new();
    let (stream, guard) = ByteStream::tracked(out_tx, in_rx, cancel.clone());

    spawn_reader(port.to_string(), reader, in_tx, cancel.clone(), guard.clone())?;
    spawn_writer(port.to_string(), writer, out_rx, cancel, guard)?;

    tracing::info!("Opened serial port {} at {} baud", port, baud_rate);
    Ok(stream)
}

fn spawn_reader(
    name: String,
    mut port: Box<dyn serialport::SerialPort>,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    guard: PumpGuard,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("serial-read {}", name))
        .spawn(move || {
            let _guard = guard;
            let mut buf = [0u8; 1024];
            while !cancel.is_cancelled() {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("Serial read on {} failed: {}", name, e);
                        break;
                    }
                }
            }
            drop(port);
            tracing::debug!("Serial reader for {} stopped", name);
        })?;
    Ok(())
}

fn spawn_writer(
    name: String,
    mut port: Box<dyn serialport::SerialPort>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    guard: PumpGuard,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("serial-write {}", name))
        .spawn(move || {
            let _guard = guard;
            while let Some(bytes) = rx.blocking_recv() {
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = port.write_all(&bytes).and_then(|_| port.flush()) {
                    tracing::warn!("Serial write on {} failed: {}", name, e);
                    cancel.cancel();
                    break;
                }
            }
            drop(port);
            tracing::debug!("Serial writer for {} stopped", name);
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_port_patterns() {
        assert!(is_machine_port("COM3"));
        assert!(is_machine_port("/dev/ttyUSB0"));
        assert!(is_machine_port("/dev/ttyACM1"));
        assert!(is_machine_port("/dev/cu.usbmodem14101"));
        assert!(!is_machine_port("COM"));
        assert!(!is_machine_port("COMX"));
        assert!(!is_machine_port("/dev/ttyS0"));
    }

    #[test]
    fn test_port_info_builder() {
        let info = SerialPortInfo::new("/dev/ttyACM0", "USB Snapmaker")
            .with_usb_ids(0x0483, 0x5740)
            .with_serial_number("SN1");
        assert_eq!(info.vid, Some(0x0483));
        assert_eq!(info.serial_number.as_deref(), Some("SN1"));
        assert!(info.manufacturer.is_none());
    }

    #[test]
    fn test_open_missing_port_fails() {
        assert!(open("/dev/ttyUSB-does-not-exist", 115200).is_err());
    }
}
