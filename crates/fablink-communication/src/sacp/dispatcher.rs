//! Request/response and publish/subscribe multiplexer over a packet link
//!
//! A [`Dispatcher`] owns the reader task for one [`PacketLink`]. Outbound
//! requests get a fresh sequence number and a pending entry; the reader
//! task matches acks by sequence, routes subscribed reports to their
//! callbacks and answers remote-initiated requests with registered
//! handlers.

use super::opcodes;
use super::packet::{Attribute, CommandId, Packet, PeerId, SacpResponse};
use super::messages::subscribe_payload;
use fablink_core::{ChannelError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capacity of the packet queues between a transport pump and a dispatcher
pub const LINK_CAPACITY: usize = 256;

/// Packet queues connecting a dispatcher to a transport pump
#[derive(Debug)]
pub struct PacketLink {
    /// Frames to write to the wire
    pub outbound: mpsc::Sender<Packet>,
    /// Frames decoded from the wire
    pub inbound: mpsc::Receiver<Packet>,
}

impl PacketLink {
    /// Two links wired back to back; what one sends the other receives
    pub fn pair() -> (PacketLink, PacketLink) {
        let (a_tx, a_rx) = mpsc::channel(LINK_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(LINK_CAPACITY);
        (
            PacketLink {
                outbound: a_tx,
                inbound: b_rx,
            },
            PacketLink {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Callback invoked with every report of a subscribed command
pub type SubscriptionCallback = Arc<dyn Fn(&Packet) + Send + Sync>;

/// Handler answering a remote-initiated request; returns the ack payload
pub type RequestHandler = Arc<dyn Fn(&Packet) -> Vec<u8> + Send + Sync>;

/// Identifies one registered subscription callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: Uuid,
    command: CommandId,
}

impl SubscriptionHandle {
    /// Subscribed command
    pub fn command(&self) -> CommandId {
        self.command
    }
}

#[derive(Default)]
struct PendingTable {
    next_sequence: u16,
    waiters: HashMap<u16, oneshot::Sender<Packet>>,
}

impl PendingTable {
    /// Next free sequence number, skipping values still in flight
    fn allocate(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            if !self.waiters.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

#[derive(Default)]
struct Shared {
    pending: Mutex<PendingTable>,
    subscriptions: Mutex<HashMap<CommandId, Vec<(Uuid, SubscriptionCallback)>>>,
    handlers: Mutex<HashMap<CommandId, RequestHandler>>,
}

/// SACP client/server endpoint over one packet link
pub struct Dispatcher {
    outbound: mpsc::Sender<Packet>,
    shared: Arc<Shared>,
    request_timeout: Duration,
    cancel: CancellationToken,
    transport_closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start dispatching over `link`
    pub fn new(link: PacketLink, request_timeout: Duration) -> Arc<Self> {
        let PacketLink { outbound, inbound } = link;
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();
        let transport_closed = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            inbound,
            outbound.clone(),
            shared.clone(),
            cancel.clone(),
            transport_closed.clone(),
        ));

        Arc::new(Self {
            outbound,
            shared,
            request_timeout,
            cancel,
            transport_closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Token cancelled when the transport stops delivering frames
    pub fn transport_closed(&self) -> CancellationToken {
        self.transport_closed.clone()
    }

    /// Token cancelled by [`dispose`](Self::dispose)
    pub fn disposed(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of requests awaiting an ack
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().waiters.len()
    }

    /// Send a request and wait for its ack
    pub async fn send(
        &self,
        command: CommandId,
        peer: PeerId,
        payload: Vec<u8>,
    ) -> Result<SacpResponse> {
        if self.is_disposed() {
            return Err(ChannelError::Closed.into());
        }

        let (tx, rx) = oneshot::channel();
        let sequence = {
            let mut pending = self.shared.pending.lock();
            let sequence = pending.allocate().ok_or_else(|| ChannelError::Rejected {
                reason: "no free sequence number".to_string(),
            })?;
            pending.waiters.insert(sequence, tx);
            sequence
        };

        tracing::debug!("SACP -> {} seq={} ({} bytes)", command, sequence, payload.len());
        let packet = Packet::request(command, peer, sequence, payload);
        if self.outbound.send(packet).await.is_err() {
            self.shared.pending.lock().waiters.remove(&sequence);
            return Err(ChannelError::Closed.into());
        }

        let result = tokio::time::timeout(self.request_timeout, rx).await;

        // Late acks for this sequence find no entry and are dropped.
        self.shared.pending.lock().waiters.remove(&sequence);

        match result {
            Ok(Ok(ack)) => Ok(SacpResponse::from_payload(&ack.payload)?),
            Ok(Err(_)) => Err(ChannelError::Closed.into()),
            Err(_) => {
                tracing::warn!("SACP {} seq={} timed out", command, sequence);
                Err(ChannelError::Timeout {
                    timeout_ms: self.request_timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Send to the controller and return the ack data, failing on a non-zero result
    pub async fn call(&self, command: CommandId, payload: Vec<u8>) -> Result<Vec<u8>> {
        let response = self.send(command, PeerId::Controller, payload).await?;
        Ok(response.into_data(command)?)
    }

    /// Ask the remote to push `command` every `interval_ms` and route the reports to `callback`
    pub async fn subscribe(
        &self,
        command: CommandId,
        interval_ms: u16,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionHandle> {
        let handle = SubscriptionHandle {
            id: Uuid::new_v4(),
            command,
        };
        self.shared
            .subscriptions
            .lock()
            .entry(command)
            .or_default()
            .push((handle.id, callback));

        let payload = subscribe_payload(command.set, command.id, interval_ms);
        if let Err(e) = self.call(opcodes::SUBSCRIBE, payload).await {
            self.remove_callback(&handle);
            return Err(e);
        }
        tracing::debug!("Subscribed to {} every {}ms", command, interval_ms);
        Ok(handle)
    }

    /// Remove a subscription callback; the remote is told to stop once none remain
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if !self.remove_callback(&handle) {
            return Ok(());
        }
        let payload = vec![handle.command.set, handle.command.id];
        self.call(opcodes::UNSUBSCRIBE, payload).await?;
        tracing::debug!("Unsubscribed from {}", handle.command);
        Ok(())
    }

    /// Drop the callback; returns true when it was the last one for its command
    fn remove_callback(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscriptions = self.shared.subscriptions.lock();
        let Some(callbacks) = subscriptions.get_mut(&handle.command) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != handle.id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            subscriptions.remove(&handle.command);
        }
        removed && !subscriptions.contains_key(&handle.command)
    }

    /// Answer remote requests for `command` with `handler`
    pub fn set_handler(&self, command: CommandId, handler: RequestHandler) {
        self.shared.handlers.lock().insert(command, handler);
    }

    /// Stop answering remote requests for `command`
    pub fn remove_handler(&self, command: CommandId) {
        self.shared.handlers.lock().remove(&command);
    }

    /// Whether a handler is registered for `command`
    pub fn has_handler(&self, command: CommandId) -> bool {
        self.shared.handlers.lock().contains_key(&command)
    }

    /// Stop the reader and fail everything outstanding with `Closed`
    pub fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let dropped = {
            let mut pending = self.shared.pending.lock();
            let count = pending.waiters.len();
            pending.waiters.clear();
            count
        };
        self.shared.subscriptions.lock().clear();
        self.shared.handlers.lock().clear();
        tracing::debug!("Dispatcher disposed ({} pending requests failed)", dropped);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn read_loop(
    mut inbound: mpsc::Receiver<Packet>,
    outbound: mpsc::Sender<Packet>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    transport_closed: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            packet = inbound.recv() => packet,
        };
        let Some(packet) = packet else {
            tracing::info!("SACP transport closed");
            shared.pending.lock().waiters.clear();
            transport_closed.cancel();
            return;
        };

        match packet.attribute {
            Attribute::Ack => {
                let waiter = shared.pending.lock().waiters.remove(&packet.sequence);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(packet);
                    }
                    None => tracing::debug!(
                        "Dropping ack {} seq={} with no pending request",
                        packet.command,
                        packet.sequence
                    ),
                }
            }
            Attribute::Request => {
                let handler = shared.handlers.lock().get(&packet.command).cloned();
                if let Some(handler) = handler {
                    let ack = packet.ack(handler(&packet));
                    if outbound.send(ack).await.is_err() {
                        tracing::debug!("Could not ack {}: link closed", packet.command);
                    }
                    continue;
                }

                let callbacks: Vec<SubscriptionCallback> = shared
                    .subscriptions
                    .lock()
                    .get(&packet.command)
                    .map(|cbs| cbs.iter().map(|(_, cb)| cb.clone()).collect())
                    .unwrap_or_default();
                if callbacks.is_empty() {
                    tracing::debug!("Unhandled SACP request {}", packet.command);
                }
                for callback in callbacks {
                    callback(&packet);
                }
            }
        }
    }
}
