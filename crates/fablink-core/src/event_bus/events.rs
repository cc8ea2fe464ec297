//! Event type definitions for the event bus.
//!
//! This module defines all connection-layer events organized by category.
//! Events are cloneable and serializable so the IPC boundary can forward
//! them verbatim.

use serde::{Deserialize, Serialize};

use crate::data::{MachineModel, MachineStatus, Protocol};

/// Root event enum for all application events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppEvent {
    /// Connection lifecycle events
    Connection(ConnectionEvent),
    /// Machine state and status
    Machine(MachineEvent),
    /// File transfer progress
    Transfer(TransferEvent),
    /// Error and diagnostic events
    Error(ErrorEvent),
}

impl AppEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            AppEvent::Connection(_) => EventCategory::Connection,
            AppEvent::Machine(_) => EventCategory::Machine,
            AppEvent::Transfer(_) => EventCategory::Transfer,
            AppEvent::Error(_) => EventCategory::Error,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            AppEvent::Connection(e) => e.description(),
            AppEvent::Machine(e) => e.description(),
            AppEvent::Transfer(e) => e.description(),
            AppEvent::Error(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Connection lifecycle events.
    Connection,
    /// Machine state and status events.
    Machine,
    /// File transfer events.
    Transfer,
    /// Error and diagnostic events.
    Error,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Machine => write!(f, "Machine"),
            EventCategory::Transfer => write!(f, "Transfer"),
            EventCategory::Error => write!(f, "Error"),
        }
    }
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// User requested disconnect
    UserRequested,
    /// Heartbeat watchdog expired
    HeartbeatLost,
    /// Socket or port closed underneath us
    TransportClosed,
    /// A newer connection replaced this one
    Replaced,
    /// Error occurred
    Error(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequested => write!(f, "user requested"),
            Self::HeartbeatLost => write!(f, "heartbeat lost"),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::Replaced => write!(f, "replaced by a new connection"),
            Self::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Connection-related events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Protocol detection finished.
    ProtocolDetected {
        /// Address or serial port probed.
        target: String,
        /// Detected protocol.
        protocol: Protocol,
    },
    /// Channel transport is opening.
    Connecting {
        /// Address or serial port.
        target: String,
        /// Protocol in use.
        protocol: Protocol,
    },
    /// Channel transport is open.
    Connected {
        /// Address or serial port.
        target: String,
        /// Protocol in use.
        protocol: Protocol,
    },
    /// Machine identified; commands are accepted.
    Ready {
        /// Address or serial port.
        target: String,
        /// Protocol in use.
        protocol: Protocol,
        /// Identified machine model.
        model: MachineModel,
    },
    /// Connection attempt failed.
    ConnectionFailed {
        /// Address or serial port.
        target: String,
        /// Error message describing the failure.
        error: String,
    },
    /// Connection closed.
    Closed {
        /// Address or serial port.
        target: String,
        /// Why the connection closed.
        reason: DisconnectReason,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::ProtocolDetected { target, protocol } => {
                format!("Detected {} on {}", protocol, target)
            }
            ConnectionEvent::Connecting { target, protocol } => {
                format!("Connecting to {} ({})", target, protocol)
            }
            ConnectionEvent::Connected { target, protocol } => {
                format!("Connected to {} ({})", target, protocol)
            }
            ConnectionEvent::Ready {
                target,
                protocol,
                model,
            } => format!("{} ready on {} ({})", model, target, protocol),
            ConnectionEvent::ConnectionFailed { target, error } => {
                format!("Connection to {} failed: {}", target, error)
            }
            ConnectionEvent::Closed { target, reason } => {
                format!("Connection to {} closed: {}", target, reason)
            }
        }
    }
}

/// Machine state events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MachineEvent {
    /// Status cache updated from a heartbeat or poll.
    StatusUpdated(MachineStatus),
    /// Material thickness measured by the laser head.
    MaterialThicknessMeasured {
        /// Measured thickness in millimetres.
        thickness: f64,
    },
}

impl MachineEvent {
    fn description(&self) -> String {
        match self {
            MachineEvent::StatusUpdated(status) => {
                format!("Status: {:?}", status.print_state)
            }
            MachineEvent::MaterialThicknessMeasured { thickness } => {
                format!("Material thickness {:.2} mm", thickness)
            }
        }
    }
}

/// File transfer events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferEvent {
    /// Upload accepted by the machine.
    Started {
        /// Target file name on the machine.
        file: String,
        /// File size in bytes.
        total_bytes: u64,
    },
    /// Chunk served.
    Progress {
        /// Target file name on the machine.
        file: String,
        /// Distinct bytes served so far.
        bytes_transferred: u64,
        /// File size in bytes.
        total_bytes: u64,
    },
    /// Upload verified and finished.
    Completed {
        /// Target file name on the machine.
        file: String,
    },
    /// Upload failed.
    Failed {
        /// Target file name on the machine.
        file: String,
        /// Error message.
        error: String,
    },
}

impl TransferEvent {
    fn description(&self) -> String {
        match self {
            TransferEvent::Started { file, total_bytes } => {
                format!("Uploading {} ({} bytes)", file, total_bytes)
            }
            TransferEvent::Progress {
                file,
                bytes_transferred,
                total_bytes,
            } => format!("{}: {}/{} bytes", file, bytes_transferred, total_bytes),
            TransferEvent::Completed { file } => format!("Uploaded {}", file),
            TransferEvent::Failed { file, error } => format!("Upload of {} failed: {}", file, error),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Warning (non-blocking).
    Warning,
    /// Error (may be recoverable).
    Error,
}

/// Error and diagnostic events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ErrorEvent {
    /// Warning (non-blocking).
    Warning {
        /// Warning code identifier.
        code: String,
        /// Human-readable warning message.
        message: String,
    },
    /// Error (may be recoverable).
    Error {
        /// Error code identifier.
        code: String,
        /// Human-readable error message.
        message: String,
    },
}

impl ErrorEvent {
    fn description(&self) -> String {
        match self {
            ErrorEvent::Warning { code, message } => {
                format!("Warning [{}]: {}", code, message)
            }
            ErrorEvent::Error { code, message } => {
                format!("Error [{}]: {}", code, message)
            }
        }
    }

    /// Get the severity of this error event
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorEvent::Warning { .. } => ErrorSeverity::Warning,
            ErrorEvent::Error { .. } => ErrorSeverity::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PrintState;

    #[test]
    fn test_event_category() {
        let event = AppEvent::Connection(ConnectionEvent::Connected {
            target: "192.168.1.20".to_string(),
            protocol: Protocol::SacpTcp,
        });
        assert_eq!(event.category(), EventCategory::Connection);

        let event = AppEvent::Transfer(TransferEvent::Completed {
            file: "part.nc".to_string(),
        });
        assert_eq!(event.category(), EventCategory::Transfer);
    }

    #[test]
    fn test_event_description() {
        let event = AppEvent::Connection(ConnectionEvent::Ready {
            target: "/dev/ttyACM0".to_string(),
            protocol: Protocol::SacpSerial,
            model: MachineModel::Artisan,
        });
        assert!(event.description().contains("Artisan"));
        assert!(event.description().contains("SACP/Serial"));

        let event = AppEvent::Connection(ConnectionEvent::Closed {
            target: "10.0.0.2".to_string(),
            reason: DisconnectReason::HeartbeatLost,
        });
        assert!(event.description().contains("heartbeat lost"));
    }

    #[test]
    fn test_event_serialization() {
        let status = MachineStatus {
            print_state: PrintState::Paused,
            ..Default::default()
        };
        let event = AppEvent::Machine(MachineEvent::StatusUpdated(status));
        let json = serde_json::to_string(&event).expect("Should serialize");
        let parsed: AppEvent = serde_json::from_str(&json).expect("Should deserialize");

        if let AppEvent::Machine(MachineEvent::StatusUpdated(status)) = parsed {
            assert_eq!(status.print_state, PrintState::Paused);
        } else {
            panic!("Wrong event type after deserialization");
        }
    }

    #[test]
    fn test_error_severity() {
        let warning = ErrorEvent::Warning {
            code: "W001".to_string(),
            message: "Test".to_string(),
        };
        assert_eq!(warning.severity(), ErrorSeverity::Warning);

        let error = ErrorEvent::Error {
            code: "E001".to_string(),
            message: "Test".to_string(),
        };
        assert_eq!(error.severity(), ErrorSeverity::Error);
    }
}
