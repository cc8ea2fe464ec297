//! JSON-lines boundary between the host application and the manager
//!
//! Each input line is a command `{"event": "connection:...", "options": {...}}`.
//! Each output line is either the response to a command or a bus event
//! wrapped as `{"event": "event:<category>", "err": 0, "data": {...}}`.
//! Commands run concurrently, so a pause can overtake a running start.

use fablink_communication::{Command, ConnectionManager, Response};
use fablink_core::{AppEvent, EventCategory};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

/// Event name used when a line cannot be attributed to a command
pub const INVALID_EVENT: &str = "ipc:invalid";

/// Parse one input line into a command, or the error response to send back
pub fn parse_command(line: &str) -> Result<Command, Response> {
    serde_json::from_str::<Command>(line).map_err(|e| {
        let event = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|value| value.get("event")?.as_str().map(str::to_string))
            .unwrap_or_else(|| INVALID_EVENT.to_string());
        Response {
            event,
            err: 1,
            msg: Some(format!("Invalid request: {}", e)),
            data: None,
        }
    })
}

/// Bus event as an output line
pub fn event_response(event: &AppEvent) -> Response {
    let name = match event.category() {
        EventCategory::Connection => "event:connection",
        EventCategory::Machine => "event:machine",
        EventCategory::Transfer => "event:transfer",
        EventCategory::Error => "event:error",
    };
    Response::ok(name, serde_json::to_value(event).ok())
}

fn encode(response: &Response) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::error!("Cannot encode response to {}: {}", response.event, e);
            None
        }
    }
}

/// Serve commands from `input` until it ends, writing to `output`
///
/// Returns once every command read has been answered.
pub async fn serve<R, W>(
    manager: Arc<ConnectionManager>,
    input: R,
    mut output: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        while let Some(response) = out_rx.recv().await {
            let Some(mut line) = encode(&response) else {
                continue;
            };
            line.push('\n');
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut bus = manager.bus().receiver();
    let events_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match bus.recv().await {
                Ok(event) => {
                    if events_tx.send(event_response(&event)).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("IPC dropped {} bus events", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let mut commands = tokio::task::JoinSet::new();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_command(line) {
            Ok(command) => {
                tracing::debug!("IPC command {}", command.name());
                let manager = manager.clone();
                let out_tx = out_tx.clone();
                commands.spawn(async move {
                    let _ = out_tx.send(manager.dispatch(command).await);
                });
            }
            Err(response) => {
                tracing::warn!("Rejected IPC line: {}", line);
                let _ = out_tx.send(response);
            }
        }
    }
    while commands.join_next().await.is_some() {}

    forwarder.abort();
    drop(out_tx);
    writer.await??;
    Ok(())
}
