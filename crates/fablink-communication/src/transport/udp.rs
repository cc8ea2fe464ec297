//! UDP transport
//!
//! One SACP frame per datagram. A [`UdpEndpoint`] owns a single local
//! socket for its whole lifetime; each connection re-points it at a new
//! remote by replacing the pumps, there is no connection object to
//! recreate.

use crate::sacp::dispatcher::LINK_CAPACITY;
use crate::sacp::{Packet, PacketLink};
use fablink_core::{ConnectionError, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 65_535;

/// Resolve `host:port` to the first socket address
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ConnectionError::InvalidHostname {
            hostname: format!("{}: {}", host, e),
        })?
        .next()
        .ok_or_else(|| {
            ConnectionError::InvalidHostname {
                hostname: host.to_string(),
            }
            .into()
        })
}

/// Long-lived local UDP socket
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    current: Mutex<Option<CancellationToken>>,
}

impl UdpEndpoint {
    /// Bind an ephemeral local port
    pub async fn bind() -> Result<Arc<Self>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ConnectionError::UdpError {
                reason: e.to_string(),
            })?;
        tracing::debug!("UDP endpoint bound to {:?}", socket.local_addr().ok());
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            current: Mutex::new(None),
        }))
    }

    /// Local address of the socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Point the socket at `remote`, replacing any previous link
    pub fn connect_link(&self, remote: SocketAddr) -> PacketLink {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Packet>(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Packet>(LINK_CAPACITY);

        let socket = self.socket.clone();
        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    packet = out_rx.recv() => packet,
                };
                let Some(packet) = packet else { break };
                let frame = match packet.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Dropping unencodable {} frame: {}", packet.command, e);
                        continue;
                    }
                };
                if let Err(e) = socket.send_to(&frame, remote).await {
                    tracing::warn!("UDP send to {} failed: {}", remote, e);
                }
            }
        });

        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((n, from)) if from == remote => match Packet::decode(&buf[..n]) {
                        Ok(packet) => {
                            if in_tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!("Ignoring datagram from {}: {}", from, e),
                    },
                    Ok((_, from)) => tracing::debug!("Ignoring datagram from stray peer {}", from),
                    Err(e) => {
                        // ICMP errors surface here on some platforms; the peer may come back.
                        tracing::debug!("UDP receive error: {}", e);
                    }
                }
            }
        });

        PacketLink {
            outbound: out_tx,
            inbound: in_rx,
        }
    }

    /// Stop the current pumps; the socket stays bound
    pub fn release(&self) {
        if let Some(current) = self.current.lock().take() {
            current.cancel();
        }
    }
}
