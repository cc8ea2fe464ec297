//! Events reported by the connection layer.
//!
//! Channels never talk to the host directly. The manager republishes channel
//! lifecycle changes, status reports and transfer progress as [`AppEvent`]s
//! on its [`EventBus`], and the IPC loop forwards them as output lines.
//!
//! ```rust,ignore
//! let bus = EventBus::new();
//! bus.subscribe(EventFilter::only(EventCategory::Transfer), |event| {
//!     tracing::info!("{:?}", event);
//! });
//! let mut everything = bus.receiver();
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
