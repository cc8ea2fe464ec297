//! TCP transport

use super::{ByteStream, STREAM_CAPACITY};
use fablink_core::{ConnectionError, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Connect to `host:port` within `timeout`
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<ByteStream> {
    let address = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| ConnectionError::ConnectionTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| ConnectionError::TcpError {
            reason: format!("{}: {}", address, e),
        })?;
    let _ = stream.set_nodelay(true);
    tracing::debug!("TCP connected to {}", address);
    Ok(spawn_pumps(stream, address))
}

fn spawn_pumps(stream: TcpStream, address: String) -> ByteStream {
    let (mut read_half, mut write_half) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(STREAM_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(STREAM_CAPACITY);
    let cancel = CancellationToken::new();

    let read_cancel = cancel.clone();
    let read_address = address.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let read = tokio::select! {
                _ = read_cancel.cancelled() => break,
                read = read_half.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    tracing::info!("TCP peer {} closed the connection", read_address);
                    break;
                }
                Ok(n) => {
                    if in_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("TCP read from {} failed: {}", read_address, e);
                    break;
                }
            }
        }
    });

    let write_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let bytes = tokio::select! {
                _ = write_cancel.cancelled() => break,
                bytes = out_rx.recv() => bytes,
            };
            let Some(bytes) = bytes else { break };
            if let Err(e) = write_half.write_all(&bytes).await {
                tracing::warn!("TCP write to {} failed: {}", address, e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    ByteStream::new(out_tx, in_rx, cancel)
}
