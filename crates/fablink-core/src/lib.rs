//! # FabLink Core
//!
//! Core types, errors, and events shared by every FabLink crate.
//! Provides the protocol and lifecycle enumerations, the layered error
//! taxonomy, and the event bus the connection layer publishes to.

pub mod data;
pub mod error;
pub mod event_bus;

pub use data::{
    ChannelState, ConnectionType, HeadType, MachineModel, MachineStatus, Position, PrintState,
    Protocol, ProtocolFamily,
};

pub use error::{ChannelError, ConnectionError, Error, ProtocolError, Result};

pub use event_bus::{
    AppEvent, ConnectionEvent, DisconnectReason, ErrorEvent, EventBus, EventBusError,
    EventCategory, EventFilter, MachineEvent, SubscriptionId, TransferEvent,
};
