//! Command/reply session over a newline-framed link
//!
//! The text protocol has no correlation ids, so one command is in flight at
//! a time: a line is sent, replies are collected until `ok` or `Error:`.
//! Lines arriving while no command is waiting (auto-reports, banners) are
//! broadcast to [`TextSession::unsolicited`] subscribers.

use super::response::ReplyLine;
use crate::transport::LineLink;
use fablink_core::{ChannelError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

type ReplySink = Arc<Mutex<Option<mpsc::UnboundedSender<ReplyLine>>>>;

/// Serialized command/reply exchange
pub struct TextSession {
    outbound: mpsc::Sender<String>,
    current: ReplySink,
    unsolicited: broadcast::Sender<String>,
    turn: tokio::sync::Mutex<()>,
    timeout: Duration,
    closed: CancellationToken,
}

impl TextSession {
    /// Start reading `link`
    pub fn new(link: LineLink, timeout: Duration) -> Arc<Self> {
        let LineLink {
            outbound,
            mut inbound,
        } = link;
        let current: ReplySink = Arc::new(Mutex::new(None));
        let (unsolicited, _) = broadcast::channel(64);
        let closed = CancellationToken::new();

        {
            let current = current.clone();
            let unsolicited = unsolicited.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let line = tokio::select! {
                        _ = closed.cancelled() => break,
                        line = inbound.recv() => line,
                    };
                    let Some(line) = line else { break };
                    tracing::debug!("<< {}", line);
                    let sink = current.lock().clone();
                    match sink {
                        Some(tx) => {
                            let _ = tx.send(ReplyLine::parse(&line));
                        }
                        None => {
                            let _ = unsolicited.send(line);
                        }
                    }
                }
                current.lock().take();
                closed.cancel();
                tracing::debug!("Text session reader stopped");
            });
        }

        Arc::new(Self {
            outbound,
            current,
            unsolicited,
            turn: tokio::sync::Mutex::new(()),
            timeout,
            closed,
        })
    }

    /// Lines received outside any command exchange
    pub fn unsolicited(&self) -> broadcast::Receiver<String> {
        self.unsolicited.subscribe()
    }

    /// Token cancelled when the link stops delivering lines
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Stop the reader; pending commands fail with `Closed`
    pub fn close(&self) {
        self.closed.cancel();
        self.current.lock().take();
    }

    /// Send one line and collect its reply lines (excluding the final `ok`)
    ///
    /// The timeout counts silence, not total duration: every intermediate
    /// line (`echo:busy`, temperature reports while heating) restarts it.
    pub async fn execute_line(&self, line: &str) -> Result<Vec<String>> {
        let line = line.trim();
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed.into());
        }
        let _turn = self.turn.lock().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.current.lock() = Some(tx);
        let _sink = SinkGuard(&self.current);

        tracing::debug!(">> {}", line);
        self.outbound
            .send(line.to_string())
            .await
            .map_err(|_| ChannelError::Closed)?;

        let mut replies = Vec::new();
        let mut deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let reply = tokio::select! {
                _ = self.closed.cancelled() => return Err(ChannelError::Closed.into()),
                reply = tokio::time::timeout_at(deadline, rx.recv()) => reply,
            };
            match reply {
                Ok(Some(ReplyLine::Ok)) => return Ok(replies),
                Ok(Some(ReplyLine::Error(reason))) => {
                    tracing::warn!("'{}' failed: {}", line, reason);
                    return Err(ChannelError::Rejected { reason }.into());
                }
                Ok(Some(ReplyLine::Echo(text))) | Ok(Some(ReplyLine::Data(text))) => {
                    deadline = tokio::time::Instant::now() + self.timeout;
                    replies.push(text)
                }
                Ok(None) => return Err(ChannelError::Closed.into()),
                Err(_) => {
                    return Err(ChannelError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                    .into())
                }
            }
        }
    }

    /// Run a multi-line program line by line; returns all reply text
    pub async fn execute(&self, program: &str) -> Result<String> {
        let mut output = Vec::new();
        for line in program_lines(program) {
            output.extend(self.execute_line(line).await?);
        }
        Ok(output.join("\n"))
    }
}

/// Executable lines of a program: trimmed, without blanks or comment lines
pub fn program_lines(program: &str) -> impl Iterator<Item = &str> {
    program
        .lines()
        .map(|line| match line.find(';') {
            Some(pos) => line[..pos].trim(),
            None => line.trim(),
        })
        .filter(|line| !line.is_empty())
}

struct SinkGuard<'a>(&'a ReplySink);

impl Drop for SinkGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(timeout_ms: u64) -> (Arc<TextSession>, mpsc::Receiver<String>, mpsc::Sender<String>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let link = LineLink {
            outbound: out_tx,
            inbound: in_rx,
        };
        (
            TextSession::new(link, Duration::from_millis(timeout_ms)),
            out_rx,
            in_tx,
        )
    }

    #[tokio::test]
    async fn test_collects_until_ok() {
        let (session, mut sent, replies) = session(1000);
        let machine = tokio::spawn(async move {
            assert_eq!(sent.recv().await.unwrap(), "M105");
            replies.send("T:20.5 /0.0".to_string()).await.unwrap();
            replies.send("ok".to_string()).await.unwrap();
        });
        let lines = session.execute_line("M105").await.unwrap();
        assert_eq!(lines, vec!["T:20.5 /0.0".to_string()]);
        machine.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_rejects() {
        let (session, mut sent, replies) = session(1000);
        tokio::spawn(async move {
            sent.recv().await.unwrap();
            replies.send("Error:Unknown command".to_string()).await.unwrap();
        });
        let err = session.execute_line("M9999").await.unwrap_err();
        assert!(err.to_string().contains("Unknown command"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (session, _sent, _replies) = session(500);
        let err = session.execute_line("G28").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_keepalive_outlasts_timeout() {
        let (session, mut sent, replies) = session(5000);
        tokio::spawn(async move {
            assert_eq!(sent.recv().await.unwrap(), "M109 S210");
            for _ in 0..8 {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                replies.send("echo:busy: processing".to_string()).await.unwrap();
            }
            replies.send("ok".to_string()).await.unwrap();
        });
        let started = tokio::time::Instant::now();
        let lines = session.execute_line("M109 S210").await.unwrap();
        assert_eq!(lines.len(), 8);
        assert!(started.elapsed() >= Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_after_keepalive_still_times_out() {
        let (session, mut sent, replies) = session(500);
        tokio::spawn(async move {
            sent.recv().await.unwrap();
            replies.send("T:150.0 /210.0".to_string()).await.unwrap();
            // Keep the link open but silent.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(replies);
        });
        let err = session.execute_line("M109 S210").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_unsolicited_lines_broadcast() {
        let (session, _sent, replies) = session(1000);
        let mut rx = session.unsolicited();
        replies.send("echo:busy: processing".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "echo:busy: processing");
    }

    #[test]
    fn test_program_lines() {
        let lines: Vec<&str> = program_lines("G90\n\n; comment\nG0 X1 ; move\n").collect();
        assert_eq!(lines, vec!["G90", "G0 X1"]);
    }
}
