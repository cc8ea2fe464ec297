//! # FabLink Communication
//!
//! Machine connection layer for FabLink.
//! Detects which protocol a machine speaks, opens the matching channel over
//! TCP, UDP, HTTP or a serial port and routes commands through the
//! [`manager::ConnectionManager`].
//!
//! Layers, bottom up:
//! - [`codec`]: little-endian payload primitives
//! - [`transport`]: byte pumps for sockets and serial ports
//! - [`sacp`]: framing, request correlation and file transfer
//! - [`text`]: line protocol sessions and G-code synthesis
//! - [`detector`]: protocol probes
//! - [`channel`]: one connection per protocol, capabilities per trait
//! - [`machine`]: model-specific startup
//! - [`manager`]: the owner of the active connection

pub mod channel;
pub mod codec;
pub mod detector;
pub mod machine;
pub mod manager;
pub mod sacp;
pub mod text;
pub mod transport;

pub use channel::{
    Channel, ChannelEvent, ChannelResult, CncChannel, EnclosureChannel, FileChannel,
    GcodeChannel, LaserChannel, MotionChannel, NetworkServiceChannel, OpenOptions, PrintChannel,
    PrintJob, PrinterChannel, SystemChannel, UploadOptions,
};
pub use detector::{DefaultDetector, NetworkProtocol, ProtocolDetector, SerialPortProtocol};
pub use machine::{create_machine_instance, MachineInstance};
pub use manager::{
    ActiveConnection, ChannelFactory, Command, ConnectionManager, ConnectionTarget,
    DefaultChannelFactory, ManagerState, OpenRequest, Response, StartOptions,
};
pub use sacp::{Dispatcher, Packet, PeerId};
pub use transport::serial::{list_ports, SerialPortInfo};
