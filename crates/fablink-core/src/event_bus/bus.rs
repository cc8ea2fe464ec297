//! Per-manager event bus.
//!
//! Async consumers (the IPC forwarder) take a `broadcast` receiver; in-process
//! observers register a filtered callback that runs on the publishing task.

use parking_lot::RwLock;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{AppEvent, EventCategory};

/// Default number of events a slow receiver may fall behind before lagging.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.0.simple().to_string();
        write!(f, "listener-{}", &id[..8])
    }
}

/// Which events a listener wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventFilter {
    #[default]
    All,
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    pub fn only(category: EventCategory) -> Self {
        Self::Categories(vec![category])
    }

    pub fn matches(&self, event: &AppEvent) -> bool {
        match self {
            Self::All => true,
            Self::Categories(wanted) => wanted.contains(&event.category()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("No active subscribers")]
    NoSubscribers,
}

type Callback = Box<dyn Fn(&AppEvent) + Send + Sync>;

struct Listener {
    id: SubscriptionId,
    filter: EventFilter,
    callback: Callback,
}

/// Fan-out point for [`AppEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
    listeners: RwLock<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Deliver `event` to matching listeners, then to every receiver.
    ///
    /// Returns how many parties saw the event. `NoSubscribers` means nobody
    /// was listening at all, which callers usually ignore.
    pub fn publish(&self, event: AppEvent) -> Result<usize, EventBusError> {
        let mut delivered = 0;
        for listener in self.listeners.read().iter() {
            if listener.filter.matches(&event) {
                (listener.callback)(&event);
                delivered += 1;
            }
        }

        match self.sender.send(event) {
            Ok(receivers) => Ok(delivered + receivers),
            Err(_) if delivered > 0 => Ok(delivered),
            Err(_) => Err(EventBusError::NoSubscribers),
        }
    }

    /// Register a callback. It must not block or publish on this bus.
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        self.listeners.write().push(Listener {
            id,
            filter,
            callback: Box::new(callback),
        });
        tracing::debug!("Event bus: {} registered", id);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        before != listeners.len()
    }

    pub fn receiver(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Number of registered callbacks (receivers are not counted).
    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.subscriber_count())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
