//! Legacy text channel over a serial port
//!
//! The machine only understands G-code lines, so jobs are streamed from
//! the host one line at a time, each waiting for its `ok`. Pause and stop
//! act between lines. The position of the last motion line sent is kept
//! in the status cache so a paused job can be resumed from it.

use super::{
    unsupported, Channel, ChannelEvent, ChannelResult, GcodeChannel, Lifecycle, OpenOptions,
    PrintChannel, PrintJob, SystemChannel, Watchdog,
};
use crate::text::gcode::{QUERY_FIRMWARE, QUERY_TEMPERATURE};
use crate::text::response::{parse_firmware_version, parse_machine_size, parse_temperature};
use crate::text::session::{program_lines, TextSession};
use crate::transport::{self, ByteStream};
use async_trait::async_trait;
use fablink_core::{
    ChannelError, ChannelState, DisconnectReason, MachineModel, MachineStatus, Position,
    PrintState, Protocol, Result,
};
use fablink_settings::Config;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Where a text channel connects to
#[derive(Clone)]
pub enum TextTarget {
    /// Serial port
    Serial {
        /// Port name
        port: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// An already open byte stream, usable for one connection
    Stream(Arc<Mutex<Option<ByteStream>>>),
}

impl TextTarget {
    /// Wrap an open stream (simulators, tests)
    pub fn stream(stream: ByteStream) -> Self {
        TextTarget::Stream(Arc::new(Mutex::new(Some(stream))))
    }

    fn describe(&self) -> String {
        match self {
            TextTarget::Serial { port, .. } => port.clone(),
            TextTarget::Stream(_) => "stream".to_string(),
        }
    }

    fn open_stream(&self) -> Result<ByteStream> {
        match self {
            TextTarget::Serial { port, baud_rate } => transport::serial::open(port, *baud_rate),
            TextTarget::Stream(stream) => stream.lock().take().ok_or_else(|| {
                ChannelError::Rejected {
                    reason: "byte stream already used".to_string(),
                }
                .into()
            }),
        }
    }
}

/// Streaming job control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Running,
    Paused,
    Stopped,
}

/// Tracks the machine position implied by the motion lines sent
#[derive(Debug, Default, Clone, Copy)]
pub struct PositionTracker {
    position: Position,
    relative: bool,
}

impl PositionTracker {
    /// Start from `position`
    pub fn new(position: Position) -> Self {
        Self {
            position,
            relative: false,
        }
    }

    /// Current position
    pub fn position(&self) -> Position {
        self.position
    }

    /// Account for one sent line
    pub fn track(&mut self, line: &str) {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else { return };
        match command.to_ascii_uppercase().as_str() {
            "G90" => self.relative = false,
            "G91" => self.relative = true,
            "G0" | "G00" | "G1" | "G01" => {
                for word in words {
                    let mut chars = word.chars();
                    let Some(axis) = chars.next() else { continue };
                    let Ok(value) = chars.as_str().parse::<f64>() else { continue };
                    let target = match axis.to_ascii_uppercase() {
                        'X' => &mut self.position.x,
                        'Y' => &mut self.position.y,
                        'Z' => &mut self.position.z,
                        'B' => self.position.b.get_or_insert(0.0),
                        _ => continue,
                    };
                    if self.relative {
                        *target += value;
                    } else {
                        *target = value;
                    }
                }
            }
            _ => {}
        }
    }
}

struct Poller {
    cancel: CancellationToken,
    watchdog: Arc<Watchdog>,
}

struct Inner {
    target: TextTarget,
    config: Config,
    lifecycle: Lifecycle,
    session: Mutex<Option<Arc<TextSession>>>,
    binding: Mutex<Option<CancellationToken>>,
    status: Mutex<MachineStatus>,
    firmware_version: Mutex<Option<String>>,
    poller: Mutex<Option<Poller>>,
    job: Mutex<Option<watch::Sender<JobState>>>,
}

impl Inner {
    fn current_session(&self) -> Result<Arc<TextSession>> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::Closed.into())
    }

    fn ready_session(&self) -> Result<Arc<TextSession>> {
        self.lifecycle.ensure_ready()?;
        self.current_session()
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        let stream = self.target.open_stream()?;
        let timeout = Duration::from_millis(self.config.connection.request_timeout_ms);
        let session = TextSession::new(transport::line_link(stream), timeout);
        *self.session.lock() = Some(session.clone());
        self.lifecycle.connected()?;

        let reply = session.execute_line(QUERY_FIRMWARE).await?;
        let version = reply.iter().find_map(|line| parse_firmware_version(line));
        let model = reply
            .iter()
            .find_map(|line| parse_machine_size(line))
            .unwrap_or(MachineModel::Unknown(0xff));
        tracing::info!(
            "Text firmware {} on {}",
            version.as_deref().unwrap_or("unknown"),
            self.target.describe()
        );
        *self.firmware_version.lock() = version;
        *self.status.lock() = MachineStatus::default();

        self.lifecycle.transition(ChannelState::Ready)?;
        self.lifecycle.emit(ChannelEvent::Ready {
            machine: model,
            head_type: None,
        });
        self.watch_session(&session);
        Ok(())
    }

    fn watch_session(self: &Arc<Self>, session: &TextSession) {
        let binding = CancellationToken::new();
        if let Some(previous) = self.binding.lock().replace(binding.clone()) {
            previous.cancel();
        }
        let closed = session.closed();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = binding.cancelled() => {}
                _ = closed.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        inner.close_now(DisconnectReason::TransportClosed);
                    }
                }
            }
        });
    }

    async fn poll_temperature(&self) -> Result<MachineStatus> {
        let reply = self.current_session()?.execute_line(QUERY_TEMPERATURE).await?;
        let mut status = self.status.lock();
        if let Some(report) = reply.iter().find_map(|line| parse_temperature(line)) {
            if !report.nozzles.is_empty() {
                status.nozzle_temperatures = report.nozzles;
            }
            if report.bed.is_some() {
                status.bed_temperature = report.bed;
            }
        }
        Ok(status.clone())
    }

    fn set_print_state(&self, state: PrintState) {
        let snapshot = {
            let mut status = self.status.lock();
            status.print_state = state;
            status.clone()
        };
        self.lifecycle.emit(ChannelEvent::Status(snapshot));
    }

    fn teardown(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel.cancel();
            poller.watchdog.stop();
        }
        if let Some(job) = self.job.lock().take() {
            let _ = job.send(JobState::Stopped);
        }
        if let Some(binding) = self.binding.lock().take() {
            binding.cancel();
        }
        if let Some(session) = self.session.lock().take() {
            session.close();
        }
    }

    fn close_now(&self, reason: DisconnectReason) {
        if self.lifecycle.state() == ChannelState::Disconnected {
            return;
        }
        tracing::warn!("{} closing: {}", self.target.describe(), reason);
        self.teardown();
        self.lifecycle.finish_close(reason);
    }

    async fn stream_job(self: Arc<Self>, lines: Vec<String>, mut control: watch::Receiver<JobState>) {
        let mut tracker = PositionTracker::new(self.status.lock().position.unwrap_or_default());
        let total = lines.len();
        let mut sent = 0;
        let mut outcome = PrintState::Completed;

        for line in lines {
            while *control.borrow_and_update() == JobState::Paused {
                if control.changed().await.is_err() {
                    break;
                }
            }
            if *control.borrow() != JobState::Running {
                outcome = PrintState::Stopped;
                break;
            }

            let session = match self.current_session() {
                Ok(session) => session,
                Err(_) => {
                    outcome = PrintState::Stopped;
                    break;
                }
            };
            if let Err(e) = session.execute_line(&line).await {
                tracing::error!("Streaming stopped at line {} ('{}'): {}", sent + 1, line, e);
                outcome = PrintState::Stopped;
                break;
            }
            tracker.track(&line);
            self.status.lock().position = Some(tracker.position());
            sent += 1;
        }

        tracing::info!("Streamed {}/{} lines", sent, total);
        self.job.lock().take();
        self.set_print_state(outcome);
    }

    fn control_job(&self, state: JobState) -> Result<()> {
        let job = self.job.lock();
        let Some(job) = job.as_ref() else {
            return Err(ChannelError::Rejected {
                reason: "no job is running".to_string(),
            }
            .into());
        };
        let _ = job.send(state);
        Ok(())
    }
}

/// Channel speaking G-code lines over a serial port
pub struct TextSerialChannel {
    inner: Arc<Inner>,
}

impl TextSerialChannel {
    /// Create a closed channel for `target`
    pub fn new(target: TextTarget, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(format!("Text {}", target.describe())),
                target,
                config,
                session: Mutex::new(None),
                binding: Mutex::new(None),
                status: Mutex::new(MachineStatus::default()),
                firmware_version: Mutex::new(None),
                poller: Mutex::new(None),
                job: Mutex::new(None),
            }),
        }
    }

    /// Whether a streamed job is in progress
    pub fn is_streaming(&self) -> bool {
        self.inner.job.lock().is_some()
    }
}

impl Drop for TextSerialChannel {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

#[async_trait]
impl Channel for TextSerialChannel {
    fn protocol(&self) -> Protocol {
        Protocol::Text
    }

    fn state(&self) -> ChannelState {
        self.inner.lifecycle.state()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.lifecycle.subscribe()
    }

    fn status(&self) -> MachineStatus {
        self.inner.status.lock().clone()
    }

    async fn connection_open(&self, _options: &OpenOptions) -> bool {
        if !self.inner.lifecycle.begin_open() {
            return false;
        }
        match self.inner.open().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Opening {} failed: {}", self.inner.target.describe(), e);
                self.inner.teardown();
                self.inner.lifecycle.abort_open();
                false
            }
        }
    }

    async fn connection_close(&self, _force: bool) -> bool {
        if !self.inner.lifecycle.begin_close() {
            return false;
        }
        self.inner.teardown();
        self.inner
            .lifecycle
            .finish_close(DisconnectReason::UserRequested)
    }

    async fn start_heartbeat(&self) -> bool {
        let inner = &self.inner;
        if inner.lifecycle.ensure_ready().is_err() {
            return false;
        }
        if inner.poller.lock().is_some() {
            return true;
        }

        let window = Duration::from_millis(inner.config.heartbeat.watchdog_ms);
        let weak = Arc::downgrade(inner);
        let watchdog = Arc::new(Watchdog::start(window, move || {
            if let Some(inner) = weak.upgrade() {
                inner.close_now(DisconnectReason::HeartbeatLost);
            }
        }));
        let cancel = CancellationToken::new();
        *inner.poller.lock() = Some(Poller {
            cancel: cancel.clone(),
            watchdog: watchdog.clone(),
        });

        let interval = Duration::from_millis(inner.config.heartbeat.interval_ms);
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { return };
                match inner.poll_temperature().await {
                    Ok(status) => {
                        watchdog.feed();
                        inner.lifecycle.emit(ChannelEvent::Status(status));
                    }
                    Err(e) => tracing::debug!("Temperature poll failed: {}", e),
                }
            }
        });
        true
    }

    async fn stop_heartbeat(&self) -> bool {
        match self.inner.poller.lock().take() {
            Some(poller) => {
                poller.cancel.cancel();
                poller.watchdog.stop();
                true
            }
            None => false,
        }
    }

    fn gcode(&self) -> Option<&dyn GcodeChannel> {
        Some(self)
    }

    fn system(&self) -> Option<&dyn SystemChannel> {
        Some(self)
    }

    fn print(&self) -> Option<&dyn PrintChannel> {
        Some(self)
    }
}

#[async_trait]
impl GcodeChannel for TextSerialChannel {
    async fn execute_gcode(&self, gcode: &str) -> ChannelResult<String> {
        self.inner.ready_session()?.execute(gcode).await
    }
}

#[async_trait]
impl PrintChannel for TextSerialChannel {
    async fn start_print(&self, job: &PrintJob) -> ChannelResult<()> {
        let inner = &self.inner;
        inner.ready_session()?;
        if inner.job.lock().is_some() {
            return Err(ChannelError::Rejected {
                reason: "a job is already streaming".to_string(),
            }
            .into());
        }

        let program = tokio::fs::read_to_string(&job.path).await?;
        let lines: Vec<String> = program_lines(&program).map(str::to_string).collect();
        tracing::info!("Streaming {} ({} lines)", job.path.display(), lines.len());

        let (control, receiver) = watch::channel(JobState::Running);
        {
            let mut slot = inner.job.lock();
            if slot.is_some() {
                return Err(ChannelError::Rejected {
                    reason: "a job is already streaming".to_string(),
                }
                .into());
            }
            *slot = Some(control);
        }
        inner.set_print_state(PrintState::Running);
        tokio::spawn(inner.clone().stream_job(lines, receiver));
        Ok(())
    }

    async fn pause_print(&self) -> ChannelResult<()> {
        self.inner.lifecycle.ensure_ready()?;
        self.inner.control_job(JobState::Paused)?;
        self.inner.set_print_state(PrintState::Paused);
        Ok(())
    }

    async fn resume_print(&self) -> ChannelResult<()> {
        self.inner.lifecycle.ensure_ready()?;
        self.inner.control_job(JobState::Running)?;
        self.inner.set_print_state(PrintState::Running);
        Ok(())
    }

    async fn stop_print(&self) -> ChannelResult<()> {
        self.inner.lifecycle.ensure_ready()?;
        self.inner.control_job(JobState::Stopped)
    }
}

#[async_trait]
impl SystemChannel for TextSerialChannel {
    async fn get_firmware_version(&self) -> ChannelResult<String> {
        let reply = self.inner.ready_session()?.execute_line(QUERY_FIRMWARE).await?;
        let version = reply.iter().find_map(|line| parse_firmware_version(line));
        match version {
            Some(version) => {
                *self.inner.firmware_version.lock() = Some(version.clone());
                Ok(version)
            }
            None => Err(fablink_core::ProtocolError::Malformed {
                reason: "no firmware version in reply".to_string(),
            }
            .into()),
        }
    }

    async fn upgrade_firmware_from_file(&self, _path: &Path) -> ChannelResult<()> {
        Err(unsupported("upgrade_firmware_from_file", Protocol::Text))
    }

    async fn export_log_to_external_storage(&self) -> ChannelResult<()> {
        Err(unsupported("export_log_to_external_storage", Protocol::Text))
    }
}
