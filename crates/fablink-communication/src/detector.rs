//! Protocol detection
//!
//! Probes a network host or a serial port and reports which wire protocol
//! the machine answers to. Detection never fails: anything that does not
//! answer a probe is reported as `Unknown`, and callers fall back to the
//! most backward-compatible channel.

use crate::codec::ByteWriter;
use crate::sacp::{opcodes, FrameDecoder, Packet, PeerId};
use crate::text::response::is_legible_reply;
use crate::text::gcode::QUERY_FIRMWARE;
use crate::transport::serial::SerialPortInfo;
use crate::transport::{self, ByteStream};
use async_trait::async_trait;
use fablink_core::{Protocol, Result};
use fablink_settings::ConnectionSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Result of probing a network host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkProtocol {
    /// SACP over TCP port 8888
    SacpTcp,
    /// SACP over UDP port 8889
    SacpUdp,
    /// HTTP API on port 8080
    Sstp,
    /// Nothing answered
    Unknown,
}

impl NetworkProtocol {
    /// Channel protocol to open; `Unknown` falls back to HTTP
    pub fn channel_protocol(self) -> Protocol {
        match self {
            NetworkProtocol::SacpTcp => Protocol::SacpTcp,
            NetworkProtocol::SacpUdp => Protocol::SacpUdp,
            NetworkProtocol::Sstp | NetworkProtocol::Unknown => Protocol::Sstp,
        }
    }
}

/// Result of probing a serial port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialPortProtocol {
    /// Valid SACP frame received
    Sacp,
    /// Legible text reply received
    Text,
    /// Garbage or silence
    Unknown,
}

impl SerialPortProtocol {
    /// Channel protocol to open; `Unknown` falls back to text
    pub fn channel_protocol(self) -> Protocol {
        match self {
            SerialPortProtocol::Sacp => Protocol::SacpSerial,
            SerialPortProtocol::Text | SerialPortProtocol::Unknown => Protocol::Text,
        }
    }
}

/// Protocol detection seam used by the connection manager
#[async_trait]
pub trait ProtocolDetector: Send + Sync {
    /// Probe `host` over TCP, UDP and HTTP in that order
    async fn detect_network_protocol(&self, host: &str) -> NetworkProtocol;

    /// Probe a serial port with a SACP frame and a text query
    async fn detect_serial_port_protocol(&self, port: &str, baud_rate: u32) -> SerialPortProtocol;

    /// Serial ports a machine may be attached to
    fn list_serial_ports(&self) -> Result<Vec<SerialPortInfo>> {
        transport::serial::list_ports()
    }
}

/// Detector probing real sockets and ports
#[derive(Debug, Clone)]
pub struct DefaultDetector {
    settings: ConnectionSettings,
    http: reqwest::Client,
}

impl DefaultDetector {
    /// Create a detector using the configured ports and probe timeout
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.probe_timeout_ms)
    }

    fn probe_frame(&self, command: crate::sacp::CommandId, payload: Vec<u8>) -> Option<Vec<u8>> {
        Packet::request(command, PeerId::Controller, 0, payload)
            .encode()
            .ok()
    }

    fn connect_payload(&self) -> Vec<u8> {
        ByteWriter::new()
            .string(&self.settings.client_name)
            .map(ByteWriter::finish)
            .unwrap_or_default()
    }

    async fn probe_tcp(&self, host: &str) -> bool {
        let Some(frame) = self.probe_frame(opcodes::CONNECT, self.connect_payload()) else {
            return false;
        };
        let timeout = self.probe_timeout();
        let probe = async {
            let stream =
                transport::tcp::connect(host, self.settings.sacp_tcp_port, timeout).await.ok()?;
            stream.outbound.send(frame).await.ok()?;
            first_sacp_frame(stream).await
        };
        matches!(tokio::time::timeout(timeout, probe).await, Ok(Some(_)))
    }

    async fn probe_udp(&self, host: &str) -> bool {
        let Some(frame) = self.probe_frame(opcodes::CONNECT, self.connect_payload()) else {
            return false;
        };
        let probe = async {
            let remote = transport::udp::resolve(host, self.settings.sacp_udp_port)
                .await
                .ok()?;
            let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
            socket.send_to(&frame, remote).await.ok()?;
            let mut buf = vec![0u8; 2048];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.ok()?;
                if from == remote && Packet::decode(&buf[..n]).is_ok() {
                    return Some(());
                }
            }
        };
        matches!(
            tokio::time::timeout(self.probe_timeout(), probe).await,
            Ok(Some(()))
        )
    }

    async fn probe_http(&self, host: &str) -> bool {
        let url = format!(
            "http://{}:{}/api/v1/status",
            host, self.settings.http_port
        );
        match self
            .http
            .get(&url)
            .timeout(self.probe_timeout())
            .send()
            .await
        {
            Ok(response) => {
                tracing::debug!("HTTP probe {} answered {}", url, response.status());
                true
            }
            Err(e) => {
                tracing::debug!("HTTP probe {} failed: {}", url, e);
                false
            }
        }
    }
}

#[async_trait]
impl ProtocolDetector for DefaultDetector {
    async fn detect_network_protocol(&self, host: &str) -> NetworkProtocol {
        let detected = if self.probe_tcp(host).await {
            NetworkProtocol::SacpTcp
        } else if self.probe_udp(host).await {
            NetworkProtocol::SacpUdp
        } else if self.probe_http(host).await {
            NetworkProtocol::Sstp
        } else {
            NetworkProtocol::Unknown
        };
        tracing::info!("Network protocol of {}: {:?}", host, detected);
        detected
    }

    async fn detect_serial_port_protocol(&self, port: &str, baud_rate: u32) -> SerialPortProtocol {
        let stream = match transport::serial::open(port, baud_rate) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Cannot probe {}: {}", port, e);
                return SerialPortProtocol::Unknown;
            }
        };
        let Some(frame) = self.probe_frame(opcodes::MACHINE_INFO, Vec::new()) else {
            stream.close().await;
            return SerialPortProtocol::Unknown;
        };
        // Closes the port before returning, so the channel can reopen it.
        let detected = classify_serial_stream(stream, frame, self.probe_timeout()).await;
        tracing::info!("Serial protocol of {}: {:?}", port, detected);
        detected
    }
}

async fn first_sacp_frame(mut stream: ByteStream) -> Option<Packet> {
    let mut decoder = FrameDecoder::new();
    while let Some(bytes) = stream.inbound.recv().await {
        if let Some(packet) = decoder.push(&bytes).into_iter().next() {
            return Some(packet);
        }
    }
    None
}

/// Send both probes over an open stream, classify what comes back, then close it
pub async fn classify_serial_stream(
    mut stream: ByteStream,
    sacp_probe: Vec<u8>,
    probe_timeout: Duration,
) -> SerialPortProtocol {
    let detected = classify_replies(&mut stream, sacp_probe, probe_timeout).await;
    stream.close().await;
    detected
}

async fn classify_replies(
    stream: &mut ByteStream,
    sacp_probe: Vec<u8>,
    probe_timeout: Duration,
) -> SerialPortProtocol {
    let text_probe = format!("{}\n", QUERY_FIRMWARE).into_bytes();
    if stream.outbound.send(sacp_probe).await.is_err()
        || stream.outbound.send(text_probe).await.is_err()
    {
        return SerialPortProtocol::Unknown;
    }

    let mut decoder = FrameDecoder::new();
    let mut text = Vec::new();
    let deadline = tokio::time::Instant::now() + probe_timeout;
    loop {
        let bytes = match tokio::time::timeout_at(deadline, stream.inbound.recv()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) | Err(_) => return SerialPortProtocol::Unknown,
        };
        if !decoder.push(&bytes).is_empty() {
            return SerialPortProtocol::Sacp;
        }
        text.extend_from_slice(&bytes);
        while let Some(pos) = text.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = text.drain(..=pos).collect();
            if is_legible_reply(&String::from_utf8_lossy(&line)) {
                return SerialPortProtocol::Text;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sacp::CommandId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn machine_info_probe() -> Vec<u8> {
        Packet::request(opcodes::MACHINE_INFO, PeerId::Controller, 0, vec![])
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_serial_text_reply() {
        let (host, mut machine) = ByteStream::pair();
        let classify = tokio::spawn(classify_serial_stream(
            host,
            machine_info_probe(),
            Duration::from_millis(500),
        ));
        machine.inbound.recv().await.unwrap();
        machine.inbound.recv().await.unwrap();
        machine
            .outbound
            .send(b"Firmware Version: Snapmaker-Base-2.2\nok\n".to_vec())
            .await
            .unwrap();
        assert_eq!(classify.await.unwrap(), SerialPortProtocol::Text);
    }

    #[tokio::test]
    async fn test_serial_sacp_reply() {
        let (host, mut machine) = ByteStream::pair();
        let classify = tokio::spawn(classify_serial_stream(
            host,
            machine_info_probe(),
            Duration::from_millis(500),
        ));
        let probe = machine.inbound.recv().await.unwrap();
        let request = Packet::decode(&probe).unwrap();
        let reply = request.ack(vec![0, 2]).encode().unwrap();
        // Split delivery to exercise reassembly.
        machine.outbound.send(reply[..5].to_vec()).await.unwrap();
        machine.outbound.send(reply[5..].to_vec()).await.unwrap();
        assert_eq!(classify.await.unwrap(), SerialPortProtocol::Sacp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_garbage_is_unknown() {
        let (host, machine) = ByteStream::pair();
        let classify = tokio::spawn(classify_serial_stream(
            host,
            machine_info_probe(),
            Duration::from_millis(500),
        ));
        machine.outbound.send(vec![0xff, 0x00, 0x13, 0x37]).await.unwrap();
        assert_eq!(classify.await.unwrap(), SerialPortProtocol::Unknown);
        drop(machine);
    }

    #[tokio::test]
    async fn test_classification_releases_the_port() {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(4);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(4);
        let (stream, guard) = ByteStream::tracked(out_tx, in_rx, CancellationToken::new());
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        // Stands in for the serial pump threads.
        std::thread::spawn(move || {
            let _guard = guard;
            let mut answered = false;
            while out_rx.blocking_recv().is_some() {
                if !answered {
                    let _ = in_tx.blocking_send(b"ok\n".to_vec());
                    answered = true;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
        });

        let detected =
            classify_serial_stream(stream, machine_info_probe(), Duration::from_millis(500)).await;
        assert_eq!(detected, SerialPortProtocol::Text);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_network_prefers_sacp_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            let request = Packet::decode(&buf[..n]).unwrap();
            assert_eq!(request.command, CommandId::new(0x01, 0x05));
            socket
                .write_all(&request.ack(vec![0]).encode().unwrap())
                .await
                .unwrap();
        });

        let settings = ConnectionSettings {
            sacp_tcp_port: port,
            probe_timeout_ms: 1000,
            ..Default::default()
        };
        let detector = DefaultDetector::new(settings);
        assert_eq!(
            detector.detect_network_protocol("127.0.0.1").await,
            NetworkProtocol::SacpTcp
        );
    }

    #[test]
    fn test_fallback_protocols() {
        assert_eq!(NetworkProtocol::Unknown.channel_protocol(), Protocol::Sstp);
        assert_eq!(SerialPortProtocol::Unknown.channel_protocol(), Protocol::Text);
        assert_eq!(SerialPortProtocol::Sacp.channel_protocol(), Protocol::SacpSerial);
    }
}
