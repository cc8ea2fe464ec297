//! HTTP channel for network firmware without SACP
//!
//! Talks to the machine's REST API on port 8080. The machine asks the
//! operator to confirm a new client on its touchscreen; until then
//! `connect` answers 204 and the channel stays closed. Status is polled
//! and every successful poll feeds the heartbeat watchdog.

use super::{
    unsupported, Channel, ChannelEvent, ChannelResult, EnclosureChannel, FileChannel,
    GcodeChannel, Lifecycle, OpenOptions, PrintChannel, PrintJob, SystemChannel, UploadOptions,
    Watchdog,
};
use crate::text::response::parse_firmware_version;
use crate::text::gcode::QUERY_FIRMWARE;
use async_trait::async_trait;
use fablink_core::{
    ChannelError, ChannelState, ConnectionError, DisconnectReason, HeadType, MachineModel,
    MachineStatus, Position, PrintState, Protocol, Result,
};
use fablink_settings::Config;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Reply to `POST /api/v1/connect`
#[derive(Debug, Deserialize)]
struct ConnectReply {
    token: String,
    #[serde(rename = "headType", default)]
    head_type: Option<Value>,
    #[serde(default)]
    series: Option<String>,
}

/// Reply to `GET /api/v1/status`; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusReply {
    status: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    b: Option<f64>,
    nozzle_temperature: Option<f64>,
    nozzle_target_temperature: Option<f64>,
    nozzle_temperature1: Option<f64>,
    nozzle_target_temperature1: Option<f64>,
    heated_bed_temperature: Option<f64>,
    heated_bed_target_temperature: Option<f64>,
    laser_focal_length: Option<f64>,
    head_type: Option<Value>,
}

impl StatusReply {
    fn apply(self, status: &mut MachineStatus) {
        if let Some(state) = &self.status {
            status.print_state = PrintState::from_status_str(state);
        }
        if let (Some(x), Some(y), Some(z)) = (self.x, self.y, self.z) {
            status.position = Some(Position { x, y, z, b: self.b });
        }
        let mut nozzles = Vec::new();
        if let Some(current) = self.nozzle_temperature {
            nozzles.push((current, self.nozzle_target_temperature.unwrap_or(0.0)));
        }
        if let Some(current) = self.nozzle_temperature1 {
            nozzles.push((current, self.nozzle_target_temperature1.unwrap_or(0.0)));
        }
        if !nozzles.is_empty() {
            status.nozzle_temperatures = nozzles;
        }
        if let Some(current) = self.heated_bed_temperature {
            status.bed_temperature =
                Some((current, self.heated_bed_target_temperature.unwrap_or(0.0)));
        }
        if self.laser_focal_length.is_some() {
            status.laser_focal_length = self.laser_focal_length;
        }
        if let Some(head) = self.head_type.as_ref().and_then(parse_head_type) {
            status.head_type = Some(head);
        }
    }
}

/// Head type as reported by the HTTP API (`"LASER"`, `"CNC"`, `"3DP"`, or 1/2/3)
fn parse_head_type(value: &Value) -> Option<HeadType> {
    match value {
        Value::String(s) => {
            let s = s.to_ascii_uppercase();
            if s.contains("LASER") {
                Some(HeadType::Laser)
            } else if s.contains("CNC") {
                Some(HeadType::Cnc)
            } else if s.contains("3DP") || s.contains("PRINT") {
                Some(HeadType::Printing)
            } else {
                None
            }
        }
        Value::Number(n) => match n.as_u64() {
            Some(1) => Some(HeadType::Printing),
            Some(2) => Some(HeadType::Cnc),
            Some(3) => Some(HeadType::Laser),
            _ => None,
        },
        _ => None,
    }
}

fn head_name(head: HeadType) -> &'static str {
    match head {
        HeadType::Printing => "3DP",
        HeadType::Laser => "LASER",
        HeadType::Cnc => "CNC",
    }
}

fn http_error(e: reqwest::Error, timeout: Duration) -> fablink_core::Error {
    if e.is_timeout() {
        ChannelError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
        .into()
    } else {
        ConnectionError::HttpError {
            reason: e.to_string(),
        }
        .into()
    }
}

/// Map the API's status codes onto errors
fn check_status(endpoint: &str, status: StatusCode) -> Result<()> {
    match status {
        StatusCode::OK => Ok(()),
        StatusCode::NO_CONTENT => Err(ChannelError::Rejected {
            reason: "waiting for confirmation on the machine".to_string(),
        }
        .into()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ChannelError::Rejected {
            reason: "token refused".to_string(),
        }
        .into()),
        other => Err(ConnectionError::HttpError {
            reason: format!("{} answered {}", endpoint, other),
        }
        .into()),
    }
}

struct Poller {
    cancel: CancellationToken,
    watchdog: Arc<Watchdog>,
}

struct Inner {
    base_url: String,
    http: reqwest::Client,
    config: Config,
    lifecycle: Lifecycle,
    token: Mutex<Option<String>>,
    status: Mutex<MachineStatus>,
    poller: Mutex<Option<Poller>>,
}

impl Inner {
    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, endpoint)
    }

    fn token(&self) -> Result<String> {
        self.token
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::Closed.into())
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connection.request_timeout_ms)
    }

    /// Authenticated form POST; returns the body
    async fn post(&self, endpoint: &str, fields: &[(&str, String)]) -> Result<String> {
        let mut form = vec![("token", self.token()?)];
        form.extend(fields.iter().map(|(k, v)| (*k, v.clone())));
        tracing::debug!("POST {}", endpoint);
        let response = self
            .http
            .post(self.url(endpoint))
            .timeout(self.request_timeout())
            .form(&form)
            .send()
            .await
            .map_err(|e| http_error(e, self.request_timeout()))?;
        check_status(endpoint, response.status())?;
        response.text().await.map_err(|e| http_error(e, self.request_timeout()))
    }

    async fn ready_post(&self, endpoint: &str, fields: &[(&str, String)]) -> Result<String> {
        self.lifecycle.ensure_ready()?;
        self.post(endpoint, fields).await
    }

    async fn connect(&self, token: Option<String>) -> Result<ConnectReply> {
        let response = self
            .http
            .post(self.url("connect"))
            .timeout(self.request_timeout())
            .form(&[("token", token.unwrap_or_default())])
            .send()
            .await
            .map_err(|e| http_error(e, self.request_timeout()))?;
        check_status("connect", response.status())?;
        response.json::<ConnectReply>().await.map_err(|e| http_error(e, self.request_timeout()))
    }

    async fn open(&self, options: &OpenOptions) -> Result<()> {
        let reply = match self.connect(options.token.clone()).await {
            Err(e) if options.token.is_some() && !e.is_connection_error() => {
                tracing::info!("Stored token not accepted ({}), requesting a new one", e);
                self.connect(None).await?
            }
            other => other?,
        };
        *self.token.lock() = Some(reply.token.clone());
        self.lifecycle.connected()?;

        let model = reply
            .series
            .as_deref()
            .map(MachineModel::from_series)
            .unwrap_or(MachineModel::Unknown(0xff));
        let head_type = reply.head_type.as_ref().and_then(parse_head_type);
        {
            let mut status = self.status.lock();
            *status = MachineStatus::default();
            status.head_type = head_type;
        }
        self.lifecycle.transition(ChannelState::Ready)?;
        self.lifecycle.emit(ChannelEvent::Ready {
            machine: model,
            head_type,
        });
        Ok(())
    }

    async fn poll_status(&self) -> Result<MachineStatus> {
        let response = self
            .http
            .get(self.url("status"))
            .timeout(self.request_timeout())
            .query(&[("token", self.token()?)])
            .send()
            .await
            .map_err(|e| http_error(e, self.request_timeout()))?;
        check_status("status", response.status())?;
        let reply: StatusReply = response.json().await.map_err(|e| http_error(e, self.request_timeout()))?;
        let mut status = self.status.lock();
        reply.apply(&mut status);
        Ok(status.clone())
    }

    fn teardown(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel.cancel();
            poller.watchdog.stop();
        }
        self.token.lock().take();
    }

    fn close_now(&self, reason: DisconnectReason) {
        if self.lifecycle.state() == ChannelState::Disconnected {
            return;
        }
        tracing::warn!("{} closing: {}", self.base_url, reason);
        self.teardown();
        self.lifecycle.finish_close(reason);
    }
}

/// Channel over the HTTP API
pub struct SstpChannel {
    inner: Arc<Inner>,
}

impl SstpChannel {
    /// Create a closed channel for `host`
    pub fn new(host: &str, config: Config) -> Self {
        let base_url = format!("http://{}:{}", host, config.connection.http_port);
        Self::with_base_url(base_url, config)
    }

    /// Create a channel against an explicit base URL (`http://host:port`)
    pub fn with_base_url(base_url: impl Into<String>, config: Config) -> Self {
        let base_url = base_url.into();
        Self {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(format!("SSTP {}", base_url)),
                base_url,
                http: reqwest::Client::new(),
                config,
                token: Mutex::new(None),
                status: Mutex::new(MachineStatus::default()),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Session token, for reconnecting without a new confirmation
    pub fn token(&self) -> Option<String> {
        self.inner.token.lock().clone()
    }
}

impl Drop for SstpChannel {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

#[async_trait]
impl Channel for SstpChannel {
    fn protocol(&self) -> Protocol {
        Protocol::Sstp
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

    async fn connection_open(&self, options: &OpenOptions) -> bool {
        if !self.inner.lifecycle.begin_open() {
            return false;
        }
        match self.inner.open(options).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Connecting to {} failed: {}", self.inner.base_url, e);
                self.inner.teardown();
                self.inner.lifecycle.abort_open();
                false
            }
        }
    }

    async fn connection_close(&self, force: bool) -> bool {
        let inner = &self.inner;
        if !inner.lifecycle.begin_close() {
            return false;
        }
        if !force {
            if let Err(e) = inner.post("disconnect", &[]).await {
                tracing::debug!("Disconnect not acknowledged: {}", e);
            }
        }
        inner.teardown();
        inner.lifecycle.finish_close(DisconnectReason::UserRequested)
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
                match inner.poll_status().await {
                    Ok(status) => {
                        watchdog.feed();
                        inner.lifecycle.emit(ChannelEvent::Status(status));
                    }
                    Err(e) => tracing::debug!("Status poll failed: {}", e),
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

    fn file(&self) -> Option<&dyn FileChannel> {
        Some(self)
    }

    fn system(&self) -> Option<&dyn SystemChannel> {
        Some(self)
    }

    fn print(&self) -> Option<&dyn PrintChannel> {
        Some(self)
    }

    fn enclosure(&self) -> Option<&dyn EnclosureChannel> {
        Some(self)
    }
}

#[async_trait]
impl GcodeChannel for SstpChannel {
    async fn execute_gcode(&self, gcode: &str) -> ChannelResult<String> {
        self.inner
            .ready_post("execute_code", &[("code", gcode.to_string())])
            .await
    }
}

#[async_trait]
impl FileChannel for SstpChannel {
    async fn upload_file(&self, options: &UploadOptions) -> ChannelResult<u64> {
        let inner = &self.inner;
        inner.lifecycle.ensure_ready()?;
        let content = tokio::fs::read(&options.path).await?;
        let size = content.len() as u64;
        let target = options.target_name();
        let head = inner.status.lock().head_type.unwrap_or_default();

        inner.lifecycle.emit(ChannelEvent::Transfer(fablink_core::TransferEvent::Started {
            file: target.clone(),
            total_bytes: size,
        }));
        let part = reqwest::multipart::Part::bytes(content).file_name(target.clone());
        let form = reqwest::multipart::Form::new()
            .text("token", inner.token()?)
            .text("type", head_name(head))
            .part("file", part);
        let result = async {
            let response = inner
                .http
                .post(inner.url("prepare_print"))
                .multipart(form)
                .send()
                .await
                .map_err(|e| http_error(e, inner.request_timeout()))?;
            check_status("prepare_print", response.status())
        }
        .await;

        inner.lifecycle.emit(ChannelEvent::Transfer(match &result {
            Ok(()) => fablink_core::TransferEvent::Completed {
                file: target.clone(),
            },
            Err(e) => fablink_core::TransferEvent::Failed {
                file: target.clone(),
                error: e.to_string(),
            },
        }));
        result.map(|()| {
            tracing::info!("Uploaded {} ({} bytes)", target, size);
            size
        })
    }
}

#[async_trait]
impl PrintChannel for SstpChannel {
    async fn start_print(&self, _job: &PrintJob) -> ChannelResult<()> {
        self.inner.ready_post("start_print", &[]).await.map(|_| ())
    }

    async fn pause_print(&self) -> ChannelResult<()> {
        self.inner.ready_post("pause_print", &[]).await.map(|_| ())
    }

    async fn resume_print(&self) -> ChannelResult<()> {
        self.inner.ready_post("resume_print", &[]).await.map(|_| ())
    }

    async fn stop_print(&self) -> ChannelResult<()> {
        self.inner.ready_post("stop_print", &[]).await.map(|_| ())
    }
}

#[async_trait]
impl EnclosureChannel for SstpChannel {
    async fn set_enclosure_light(&self, brightness: u8) -> ChannelResult<()> {
        self.inner
            .ready_post("enclosure", &[("led", brightness.min(100).to_string())])
            .await
            .map(|_| ())
    }

    async fn set_enclosure_fan(&self, speed: u8) -> ChannelResult<()> {
        self.inner
            .ready_post("enclosure", &[("fan", speed.min(100).to_string())])
            .await
            .map(|_| ())
    }

    async fn set_door_detection(&self, enabled: bool) -> ChannelResult<()> {
        self.inner
            .ready_post("enclosure", &[("isDoorEnabled", enabled.to_string())])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl SystemChannel for SstpChannel {
    async fn get_firmware_version(&self) -> ChannelResult<String> {
        let reply = self.execute_gcode(QUERY_FIRMWARE).await?;
        reply
            .lines()
            .find_map(parse_firmware_version)
            .ok_or_else(|| {
                fablink_core::ProtocolError::Malformed {
                    reason: "no firmware version in reply".to_string(),
                }
                .into()
            })
    }

    async fn upgrade_firmware_from_file(&self, _path: &Path) -> ChannelResult<()> {
        Err(unsupported("upgrade_firmware_from_file", Protocol::Sstp))
    }

    async fn export_log_to_external_storage(&self) -> ChannelResult<()> {
        Err(unsupported("export_log_to_external_storage", Protocol::Sstp))
    }
}
