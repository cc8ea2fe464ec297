//! Transports: serial ports, TCP streams and UDP datagrams
//!
//! Stream transports expose a [`ByteStream`]; [`sacp_link`] and
//! [`line_link`] layer SACP framing or newline framing on top. UDP carries
//! one SACP frame per datagram and is handled by [`udp::UdpEndpoint`].

pub mod serial;
pub mod tcp;
pub mod udp;

use crate::sacp::{FrameDecoder, Packet, PacketLink};
use crate::sacp::dispatcher::LINK_CAPACITY;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) const STREAM_CAPACITY: usize = 256;

/// Longest [`ByteStream::close`] waits for pump threads to let go of the device
const PUMP_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Held by each pump thread; the device is released once every guard is dropped
pub(crate) type PumpGuard = mpsc::Sender<()>;

/// Bidirectional raw byte stream fed by transport pumps
#[derive(Debug)]
pub struct ByteStream {
    /// Bytes to write
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Bytes read
    pub inbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    pumps: Option<mpsc::Receiver<()>>,
}

impl ByteStream {
    /// Wrap pump queues; cancelling `cancel` stops the pumps
    pub fn new(
        outbound: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            cancel,
            pumps: None,
        }
    }

    /// Stream whose pumps hold the guards of the returned tracker
    pub(crate) fn tracked(
        outbound: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> (Self, PumpGuard) {
        let (guard, pumps) = mpsc::channel(1);
        let mut stream = Self::new(outbound, inbound, cancel);
        stream.pumps = Some(pumps);
        (stream, guard)
    }

    /// In-memory stream pair for tests and simulators
    pub fn pair() -> (ByteStream, ByteStream) {
        let (a_tx, a_rx) = mpsc::channel(STREAM_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(STREAM_CAPACITY);
        let cancel = CancellationToken::new();
        (
            ByteStream::new(a_tx, b_rx, cancel.clone()),
            ByteStream::new(b_tx, a_rx, cancel),
        )
    }

    /// Token stopping the underlying pumps
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the pumps and wait until they have exited
    ///
    /// Dropping a stream only signals the pumps. A port that is reopened
    /// right away must be closed this way, since an exclusive device stays
    /// busy while a pump thread still holds it.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let pumps = self.pumps.take();
        // Unblocks a writer parked on the outbound queue.
        drop(self);
        let Some(mut pumps) = pumps else { return };
        if tokio::time::timeout(PUMP_EXIT_TIMEOUT, pumps.recv())
            .await
            .is_err()
        {
            tracing::warn!("Transport pumps still running {:?} after close", PUMP_EXIT_TIMEOUT);
        }
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Layer SACP framing over a byte stream
pub fn sacp_link(stream: ByteStream) -> PacketLink {
    let bytes_out = stream.outbound.clone();
    let cancel = stream.cancel_token();
    let (packet_out_tx, mut packet_out_rx) = mpsc::channel::<Packet>(LINK_CAPACITY);
    let (packet_in_tx, packet_in_rx) = mpsc::channel::<Packet>(LINK_CAPACITY);

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let packet = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                packet = packet_out_rx.recv() => packet,
            };
            let Some(packet) = packet else { break };
            match packet.encode() {
                Ok(frame) => {
                    if bytes_out.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Dropping unencodable {} frame: {}", packet.command, e),
            }
        }
    });

    tokio::spawn(async move {
        let mut stream = stream;
        let mut decoder = FrameDecoder::new();
        'read: loop {
            let bytes = tokio::select! {
                _ = cancel.cancelled() => break,
                bytes = stream.inbound.recv() => bytes,
            };
            let Some(bytes) = bytes else { break };
            for packet in decoder.push(&bytes) {
                if packet_in_tx.send(packet).await.is_err() {
                    break 'read;
                }
            }
        }
        stream.close().await;
    });

    PacketLink {
        outbound: packet_out_tx,
        inbound: packet_in_rx,
    }
}

/// Newline-framed text over a byte stream
#[derive(Debug)]
pub struct LineLink {
    /// Lines to send; the newline is appended
    pub outbound: mpsc::Sender<String>,
    /// Received lines, trimmed, empty lines skipped
    pub inbound: mpsc::Receiver<String>,
}

/// Layer newline framing over a byte stream
pub fn line_link(stream: ByteStream) -> LineLink {
    let bytes_out = stream.outbound.clone();
    let cancel = stream.cancel_token();
    let (line_out_tx, mut line_out_rx) = mpsc::channel::<String>(STREAM_CAPACITY);
    let (line_in_tx, line_in_rx) = mpsc::channel::<String>(STREAM_CAPACITY);

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                line = line_out_rx.recv() => line,
            };
            let Some(mut line) = line else { break };
            if !line.ends_with('\n') {
                line.push('\n');
            }
            if bytes_out.send(line.into_bytes()).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut stream = stream;
        let mut buffer: Vec<u8> = Vec::new();
        'read: loop {
            let bytes = tokio::select! {
                _ = cancel.cancelled() => break,
                bytes = stream.inbound.recv() => bytes,
            };
            let Some(bytes) = bytes else { break };
            buffer.extend_from_slice(&bytes);

            // Decode whole lines only; a multibyte character may straddle reads.
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if !line.is_empty() && line_in_tx.send(line).await.is_err() {
                    break 'read;
                }
            }
        }
        stream.close().await;
    });

    LineLink {
        outbound: line_out_tx,
        inbound: line_in_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sacp::{CommandId, PeerId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sacp_link_frames_both_ways() {
        let (local, mut remote) = ByteStream::pair();
        let mut link = sacp_link(local);

        let packet = Packet::request(CommandId::new(0x01, 0x21), PeerId::Controller, 1, vec![]);
        link.outbound.send(packet.clone()).await.unwrap();
        let frame = remote.inbound.recv().await.unwrap();
        assert_eq!(Packet::decode(&frame).unwrap(), packet);

        let ack = packet.ack(vec![0]).encode().unwrap();
        let (head, tail) = ack.split_at(4);
        remote.outbound.send(head.to_vec()).await.unwrap();
        remote.outbound.send(tail.to_vec()).await.unwrap();
        let received = link.inbound.recv().await.unwrap();
        assert_eq!(received.payload, vec![0]);
    }

    #[tokio::test]
    async fn test_close_waits_for_pump_threads() {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(4);
        let (_in_tx, in_rx) = mpsc::channel::<Vec<u8>>(4);
        let cancel = CancellationToken::new();
        let (stream, guard) = ByteStream::tracked(out_tx, in_rx, cancel.clone());
        let released = Arc::new(AtomicUsize::new(0));

        let writer_guard = guard.clone();
        let writer_released = released.clone();
        std::thread::spawn(move || {
            let _guard = writer_guard;
            while out_rx.blocking_recv().is_some() {}
            std::thread::sleep(Duration::from_millis(20));
            writer_released.fetch_add(1, Ordering::SeqCst);
        });
        let reader_released = released.clone();
        std::thread::spawn(move || {
            let _guard = guard;
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(10));
            }
            reader_released.fetch_add(1, Ordering::SeqCst);
        });

        stream.close().await;
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_line_link_splits_lines() {
        let (local, mut remote) = ByteStream::pair();
        let mut link = line_link(local);

        remote.outbound.send(b"ok\r\nT:20".to_vec()).await.unwrap();
        remote.outbound.send(b"0.5 /210\n\n".to_vec()).await.unwrap();
        assert_eq!(link.inbound.recv().await.unwrap(), "ok");
        assert_eq!(link.inbound.recv().await.unwrap(), "T:200.5 /210");

        link.outbound.send("M105".to_string()).await.unwrap();
        assert_eq!(remote.inbound.recv().await.unwrap(), b"M105\n");
    }

    #[tokio::test]
    async fn test_line_link_keeps_split_multibyte_characters() {
        let (local, mut remote) = ByteStream::pair();
        let mut link = line_link(local);

        let text = "echo:Düse 210°C\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        remote.outbound.send(text[..split].to_vec()).await.unwrap();
        remote.outbound.send(text[split..].to_vec()).await.unwrap();
        assert_eq!(link.inbound.recv().await.unwrap(), "echo:Düse 210°C");
    }
}
