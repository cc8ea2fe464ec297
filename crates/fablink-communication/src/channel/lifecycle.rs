//! Channel lifecycle state machine
//!
//! `Disconnected -> Connecting -> Connected -> Ready -> Closing -> Disconnected`,
//! with any open state allowed to fall back to `Disconnected`. Every change
//! goes through [`Lifecycle::transition`], which rejects illegal moves.

use super::{ChannelEvent, EVENT_CAPACITY};
use fablink_core::{ChannelError, ChannelState, DisconnectReason, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Lifecycle state plus the channel's event broadcast
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    state: Mutex<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl Lifecycle {
    /// New lifecycle in `Disconnected`; `name` labels log lines
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.into(),
            state: Mutex::new(ChannelState::Disconnected),
            events,
        }
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Receive events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event; having no receivers is fine
    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Move to `next` if the state machine allows it
    pub fn transition(&self, next: ChannelState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(ChannelError::InvalidStateTransition {
                current: state.to_string(),
                requested: next.to_string(),
            }
            .into());
        }
        tracing::info!("{}: {} -> {}", self.name, *state, next);
        *state = next;
        Ok(())
    }

    /// Fail unless the handshake has completed
    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ChannelState::Ready => Ok(()),
            other => Err(ChannelError::NotReady {
                state: other.to_string(),
            }
            .into()),
        }
    }

    /// Enter `Connecting` and announce it; false when already open
    pub fn begin_open(&self) -> bool {
        match self.transition(ChannelState::Connecting) {
            Ok(()) => {
                self.emit(ChannelEvent::Connecting);
                true
            }
            Err(e) => {
                tracing::warn!("{}: cannot open: {}", self.name, e);
                false
            }
        }
    }

    /// Enter `Connected` and announce it
    pub fn connected(&self) -> Result<()> {
        self.transition(ChannelState::Connected)?;
        self.emit(ChannelEvent::Connected);
        Ok(())
    }

    /// Drop back to `Disconnected` after a failed open, without a `Closed` event
    pub fn abort_open(&self) {
        let mut state = self.state.lock();
        if *state != ChannelState::Disconnected {
            tracing::info!("{}: open aborted in {}", self.name, *state);
            *state = ChannelState::Disconnected;
        }
    }

    /// Enter `Closing`; false when there is nothing to close
    pub fn begin_close(&self) -> bool {
        self.transition(ChannelState::Closing).is_ok()
    }

    /// Finish closing and emit exactly one `Closed` per connection
    pub fn finish_close(&self, reason: DisconnectReason) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Disconnected {
                return false;
            }
            tracing::info!("{}: {} -> Disconnected ({})", self.name, *state, reason);
            *state = ChannelState::Disconnected;
        }
        self.emit(ChannelEvent::Closed { reason });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let lifecycle = Lifecycle::new("test");
        let mut events = lifecycle.subscribe();
        assert!(lifecycle.begin_open());
        lifecycle.connected().unwrap();
        assert!(lifecycle.ensure_ready().is_err());
        lifecycle.transition(ChannelState::Ready).unwrap();
        assert!(lifecycle.ensure_ready().is_ok());
        assert!(lifecycle.begin_close());
        assert!(lifecycle.finish_close(DisconnectReason::UserRequested));

        assert!(matches!(events.try_recv().unwrap(), ChannelEvent::Connecting));
        assert!(matches!(events.try_recv().unwrap(), ChannelEvent::Connected));
        assert!(matches!(
            events.try_recv().unwrap(),
            ChannelEvent::Closed {
                reason: DisconnectReason::UserRequested
            }
        ));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let lifecycle = Lifecycle::new("test");
        assert!(lifecycle.transition(ChannelState::Ready).is_err());
        assert_eq!(lifecycle.state(), ChannelState::Disconnected);
        assert!(!lifecycle.begin_close());
    }

    #[test]
    fn test_closed_emitted_once() {
        let lifecycle = Lifecycle::new("test");
        let mut events = lifecycle.subscribe();
        lifecycle.begin_open();
        lifecycle.connected().unwrap();
        assert!(lifecycle.finish_close(DisconnectReason::HeartbeatLost));
        assert!(!lifecycle.finish_close(DisconnectReason::TransportClosed));

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ChannelEvent::Closed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[test]
    fn test_abort_open_is_silent() {
        let lifecycle = Lifecycle::new("test");
        let mut events = lifecycle.subscribe();
        lifecycle.begin_open();
        lifecycle.abort_open();
        assert_eq!(lifecycle.state(), ChannelState::Disconnected);
        assert!(matches!(events.try_recv().unwrap(), ChannelEvent::Connecting));
        assert!(events.try_recv().is_err());
    }
}
