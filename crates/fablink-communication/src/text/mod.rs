//! Legacy line-oriented G-code protocol
//!
//! - [`gcode`]: command synthesis shared by every legacy channel
//! - [`response`]: reply classification and report parsing
//! - [`session`]: one-command-at-a-time exchange over a serial line

pub mod gcode;
pub mod response;
pub mod session;

pub use response::{parse_temperature, ReplyLine, TemperatureReport};
pub use session::TextSession;
