//! SACP channel over TCP, UDP or a serial port
//!
//! Every capability maps onto one typed SACP command sent through the
//! connection's [`Dispatcher`]. The dispatcher is created per connection
//! and disposed on close, which fails whatever is still pending.

use super::{
    file_name, CncChannel, Channel, ChannelEvent, ChannelResult, EnclosureChannel, FileChannel,
    GcodeChannel, LaserChannel, Lifecycle, MotionChannel, NetworkServiceChannel, OpenOptions,
    PrintChannel, PrintJob, PrinterChannel, SystemChannel, UploadOptions, Watchdog,
};
use crate::codec::{ByteReader, ByteWriter};
use crate::sacp::messages::{
    self, axis_mask, move_payload, Axis, CoordinateInfo, CrosshairOffset, MachineInfo,
    NetworkConfiguration, NetworkSettings, StationState, WifiNetwork,
};
use crate::sacp::{
    file_md5, opcodes, upload_file, upload_large_file, CommandId, Dispatcher, PacketLink,
    Packet, PeerId, ProgressCallback, SacpResponse, SubscriptionHandle, UploadSettings,
};
use crate::transport::{self, udp::UdpEndpoint};
use async_trait::async_trait;
use fablink_core::{
    ChannelError, ChannelState, DisconnectReason, HeadType, MachineModel, MachineStatus,
    Protocol, Result,
};
use fablink_settings::Config;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Feed rate used when a move does not name one
const DEFAULT_FEED_RATE: u32 = 3000;
/// Time allowed for the goodbye exchange on a polite close
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Where a SACP channel connects to
#[derive(Clone)]
pub enum SacpTarget {
    /// TCP stream
    Tcp {
        /// Host name or address
        host: String,
        /// Port, 8888 by default
        port: u16,
    },
    /// UDP datagrams through a shared local endpoint
    Udp {
        /// Host name or address
        host: String,
        /// Port, 8889 by default
        port: u16,
        /// Local socket kept for the whole process
        endpoint: Arc<UdpEndpoint>,
    },
    /// Serial port
    Serial {
        /// Port name
        port: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// An already open packet link, usable for one connection
    Link {
        /// Protocol to report
        protocol: Protocol,
        /// The link, taken by the first open
        link: Arc<Mutex<Option<PacketLink>>>,
    },
}

impl SacpTarget {
    /// Wrap an open link (simulators, tests)
    pub fn link(protocol: Protocol, link: PacketLink) -> Self {
        SacpTarget::Link {
            protocol,
            link: Arc::new(Mutex::new(Some(link))),
        }
    }

    /// Protocol this target speaks
    pub fn protocol(&self) -> Protocol {
        match self {
            SacpTarget::Tcp { .. } => Protocol::SacpTcp,
            SacpTarget::Udp { .. } => Protocol::SacpUdp,
            SacpTarget::Serial { .. } => Protocol::SacpSerial,
            SacpTarget::Link { protocol, .. } => *protocol,
        }
    }

    fn describe(&self) -> String {
        match self {
            SacpTarget::Tcp { host, port } | SacpTarget::Udp { host, port, .. } => {
                format!("{}:{}", host, port)
            }
            SacpTarget::Serial { port, .. } => port.clone(),
            SacpTarget::Link { .. } => "link".to_string(),
        }
    }

    async fn open_link(&self, config: &Config) -> Result<PacketLink> {
        match self {
            SacpTarget::Tcp { host, port } => {
                let timeout = Duration::from_millis(config.connection.request_timeout_ms);
                let stream = transport::tcp::connect(host, *port, timeout).await?;
                Ok(transport::sacp_link(stream))
            }
            SacpTarget::Udp {
                host,
                port,
                endpoint,
            } => {
                let remote = transport::udp::resolve(host, *port).await?;
                Ok(endpoint.connect_link(remote))
            }
            SacpTarget::Serial { port, baud_rate } => {
                let stream = transport::serial::open(port, *baud_rate)?;
                Ok(transport::sacp_link(stream))
            }
            SacpTarget::Link { link, .. } => link.lock().take().ok_or_else(|| {
                ChannelError::Rejected {
                    reason: "packet link already used".to_string(),
                }
                .into()
            }),
        }
    }
}

struct Heartbeat {
    handle: Option<SubscriptionHandle>,
    watchdog: Arc<Watchdog>,
}

struct Inner {
    target: SacpTarget,
    config: Config,
    lifecycle: Lifecycle,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    binding: Mutex<Option<CancellationToken>>,
    status: Mutex<MachineStatus>,
    info: Mutex<Option<MachineInfo>>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl Inner {
    fn current_dispatcher(&self) -> Result<Arc<Dispatcher>> {
        self.dispatcher
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::Closed.into())
    }

    fn ready_dispatcher(&self) -> Result<Arc<Dispatcher>> {
        self.lifecycle.ensure_ready()?;
        self.current_dispatcher()
    }

    async fn call(&self, command: CommandId, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.ready_dispatcher()?.call(command, payload).await
    }

    async fn command(&self, command: CommandId, payload: Vec<u8>) -> Result<()> {
        self.call(command, payload).await.map(|_| ())
    }

    fn progress_callback(self: &Arc<Self>) -> ProgressCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.lifecycle.emit(ChannelEvent::Transfer(event));
            }
        })
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        let link = self.target.open_link(&self.config).await?;
        let timeout = Duration::from_millis(self.config.connection.request_timeout_ms);
        let dispatcher = Dispatcher::new(link, timeout);
        *self.dispatcher.lock() = Some(dispatcher.clone());
        self.lifecycle.connected()?;

        let hello = ByteWriter::new()
            .string(&self.config.connection.client_name)?
            .finish();
        dispatcher.call(opcodes::CONNECT, hello).await?;
        let info = MachineInfo::parse(&dispatcher.call(opcodes::MACHINE_INFO, Vec::new()).await?)?;
        tracing::info!(
            "Machine {} (hw {}, fw {}, serial {})",
            info.model,
            info.hardware_version,
            info.firmware_version,
            info.serial_number
        );

        let head_type = head_for_model(info.model);
        {
            let mut status = self.status.lock();
            *status = MachineStatus::default();
            status.head_type = head_type;
        }
        let model = info.model;
        *self.info.lock() = Some(info);

        self.lifecycle.transition(ChannelState::Ready)?;
        self.lifecycle.emit(ChannelEvent::Ready {
            machine: model,
            head_type,
        });
        self.watch_transport(&dispatcher);
        Ok(())
    }

    fn watch_transport(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let binding = CancellationToken::new();
        if let Some(previous) = self.binding.lock().replace(binding.clone()) {
            previous.cancel();
        }
        let closed = dispatcher.transport_closed();
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

    /// Release everything held by the current connection
    fn teardown(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.watchdog.stop();
        }
        if let Some(binding) = self.binding.lock().take() {
            binding.cancel();
        }
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.dispose();
        }
        if let SacpTarget::Udp { endpoint, .. } = &self.target {
            endpoint.release();
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

    fn on_heartbeat(&self, data: &[u8]) {
        let state = match messages::parse_heartbeat(data) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!("Ignoring malformed heartbeat: {}", e);
                return;
            }
        };
        let snapshot = {
            let mut status = self.status.lock();
            status.print_state = state;
            status.clone()
        };
        self.lifecycle.emit(ChannelEvent::Status(snapshot));
    }
}

fn head_for_model(model: MachineModel) -> Option<HeadType> {
    match model {
        MachineModel::Ray => Some(HeadType::Laser),
        MachineModel::Artisan | MachineModel::J1 => Some(HeadType::Printing),
        _ => None,
    }
}

/// Channel speaking SACP
pub struct SacpChannel {
    inner: Arc<Inner>,
}

impl SacpChannel {
    /// Create a closed channel for `target`
    pub fn new(target: SacpTarget, config: Config) -> Self {
        let name = format!("{} {}", target.protocol(), target.describe());
        Self {
            inner: Arc::new(Inner {
                target,
                config,
                lifecycle: Lifecycle::new(name),
                dispatcher: Mutex::new(None),
                binding: Mutex::new(None),
                status: Mutex::new(MachineStatus::default()),
                info: Mutex::new(None),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Identification read during the handshake
    pub fn machine_info(&self) -> Option<MachineInfo> {
        self.inner.info.lock().clone()
    }
}

impl Drop for SacpChannel {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

#[async_trait]
impl Channel for SacpChannel {
    fn protocol(&self) -> Protocol {
        self.inner.target.protocol()
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
                tracing::error!("Handshake with {} failed: {}", self.inner.target.describe(), e);
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
            self.stop_heartbeat().await;
            let remote_goodbye = !matches!(inner.target, SacpTarget::Udp { .. });
            if let (true, Ok(dispatcher)) = (remote_goodbye, inner.current_dispatcher()) {
                let goodbye = dispatcher.send(opcodes::DISCONNECT, PeerId::Controller, Vec::new());
                match tokio::time::timeout(DISCONNECT_TIMEOUT, goodbye).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::debug!("Disconnect refused: {}", e),
                    Err(_) => tracing::debug!("Disconnect not acknowledged in time"),
                }
            }
        }
        inner.teardown();
        inner.lifecycle.finish_close(DisconnectReason::UserRequested)
    }

    async fn start_heartbeat(&self) -> bool {
        let inner = &self.inner;
        let dispatcher = match inner.ready_dispatcher() {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                tracing::warn!("Cannot start heartbeat: {}", e);
                return false;
            }
        };
        if inner.heartbeat.lock().is_some() {
            return true;
        }

        let window = Duration::from_millis(inner.config.heartbeat.watchdog_ms);
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let watchdog = Arc::new(Watchdog::start(window, move || {
            if let Some(inner) = weak.upgrade() {
                inner.close_now(DisconnectReason::HeartbeatLost);
            }
        }));
        *inner.heartbeat.lock() = Some(Heartbeat {
            handle: None,
            watchdog: watchdog.clone(),
        });

        let weak = Arc::downgrade(inner);
        let fed = watchdog.clone();
        let callback = Arc::new(move |packet: &Packet| {
            fed.feed();
            if let (Some(inner), Ok(report)) =
                (weak.upgrade(), SacpResponse::from_payload(&packet.payload))
            {
                inner.on_heartbeat(&report.data);
            }
        });
        let interval = u16::try_from(inner.config.heartbeat.interval_ms).unwrap_or(u16::MAX);
        match dispatcher
            .subscribe(opcodes::HEARTBEAT, interval, callback)
            .await
        {
            Ok(handle) => {
                if let Some(heartbeat) = inner.heartbeat.lock().as_mut() {
                    heartbeat.handle = Some(handle);
                }
                true
            }
            Err(e) => {
                tracing::warn!("Heartbeat subscription refused: {}", e);
                if let Some(heartbeat) = inner.heartbeat.lock().take() {
                    heartbeat.watchdog.stop();
                }
                false
            }
        }
    }

    async fn stop_heartbeat(&self) -> bool {
        let Some(heartbeat) = self.inner.heartbeat.lock().take() else {
            return false;
        };
        heartbeat.watchdog.stop();
        if let (Some(handle), Ok(dispatcher)) = (heartbeat.handle, self.inner.current_dispatcher())
        {
            if let Err(e) = dispatcher.unsubscribe(handle).await {
                tracing::debug!("Heartbeat unsubscribe failed: {}", e);
            }
        }
        true
    }

    fn gcode(&self) -> Option<&dyn GcodeChannel> {
        Some(self)
    }

    fn file(&self) -> Option<&dyn FileChannel> {
        Some(self)
    }

    fn laser(&self) -> Option<&dyn LaserChannel> {
        Some(self)
    }

    fn cnc(&self) -> Option<&dyn CncChannel> {
        Some(self)
    }

    fn network_service(&self) -> Option<&dyn NetworkServiceChannel> {
        Some(self)
    }

    fn system(&self) -> Option<&dyn SystemChannel> {
        Some(self)
    }

    fn motion(&self) -> Option<&dyn MotionChannel> {
        Some(self)
    }

    fn printer(&self) -> Option<&dyn PrinterChannel> {
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
impl GcodeChannel for SacpChannel {
    async fn execute_gcode(&self, gcode: &str) -> ChannelResult<String> {
        let payload = ByteWriter::new().string(gcode)?.finish();
        let data = self.inner.call(opcodes::EXECUTE_GCODE, payload).await?;
        if data.is_empty() {
            return Ok(String::new());
        }
        Ok(ByteReader::new(&data).string()?)
    }
}

#[async_trait]
impl FileChannel for SacpChannel {
    async fn upload_file(&self, options: &UploadOptions) -> ChannelResult<u64> {
        let dispatcher = self.inner.ready_dispatcher()?;
        let size = tokio::fs::metadata(&options.path).await?.len();
        let settings = UploadSettings::for_size(&self.inner.config.transfer, size);
        upload_file(
            &dispatcher,
            &options.path,
            &options.target_name(),
            settings,
            Some(self.inner.progress_callback()),
        )
        .await
    }
}

#[async_trait]
impl LaserChannel for SacpChannel {
    async fn get_crosshair_offset(&self) -> ChannelResult<CrosshairOffset> {
        let data = self.inner.call(opcodes::GET_CROSSHAIR_OFFSET, Vec::new()).await?;
        Ok(CrosshairOffset::parse(&data)?)
    }

    async fn set_crosshair_offset(&self, offset: CrosshairOffset) -> ChannelResult<()> {
        self.inner
            .command(opcodes::SET_CROSSHAIR_OFFSET, offset.encode())
            .await
    }

    async fn get_fire_sensor_sensitivity(&self) -> ChannelResult<u16> {
        let data = self
            .inner
            .call(opcodes::GET_FIRE_SENSOR_SENSITIVITY, Vec::new())
            .await?;
        Ok(ByteReader::new(&data).u16()?)
    }

    async fn set_fire_sensor_sensitivity(&self, sensitivity: u16) -> ChannelResult<()> {
        let payload = ByteWriter::new().u16(sensitivity).finish();
        self.inner
            .command(opcodes::SET_FIRE_SENSOR_SENSITIVITY, payload)
            .await
    }

    async fn set_laser_power(&self, power: f64) -> ChannelResult<()> {
        let payload = ByteWriter::new().f32(power as f32).finish();
        self.inner.command(opcodes::LASER_POWER, payload).await
    }

    async fn set_work_height(&self, height: f64) -> ChannelResult<()> {
        let payload = ByteWriter::new().f32(height as f32).finish();
        self.inner.command(opcodes::WORK_HEIGHT, payload).await
    }

    async fn start_material_thickness_measure(&self) -> ChannelResult<f64> {
        let data = self
            .inner
            .call(opcodes::START_THICKNESS_MEASURE, Vec::new())
            .await?;
        let thickness = ByteReader::new(&data).f32()? as f64;
        tracing::info!("Material thickness {:.2} mm", thickness);
        Ok(thickness)
    }

    async fn abort_material_thickness_measure(&self) -> ChannelResult<()> {
        self.inner
            .command(opcodes::ABORT_THICKNESS_MEASURE, Vec::new())
            .await
    }
}

#[async_trait]
impl CncChannel for SacpChannel {
    async fn set_spindle_speed(&self, rpm: u32) -> ChannelResult<()> {
        let payload = ByteWriter::new().u32(rpm).finish();
        self.inner.command(opcodes::SPINDLE_SPEED, payload).await
    }

    async fn set_spindle_speed_percentage(&self, percent: u8) -> ChannelResult<()> {
        self.inner
            .command(opcodes::SPINDLE_SPEED_PERCENTAGE, vec![percent.min(100)])
            .await
    }

    async fn spindle_on(&self) -> ChannelResult<()> {
        self.inner.command(opcodes::SPINDLE_ON, Vec::new()).await
    }

    async fn spindle_off(&self) -> ChannelResult<()> {
        self.inner.command(opcodes::SPINDLE_OFF, Vec::new()).await
    }
}

#[async_trait]
impl NetworkServiceChannel for SacpChannel {
    async fn get_network_configuration(&self) -> ChannelResult<NetworkConfiguration> {
        let data = self
            .inner
            .call(opcodes::NETWORK_CONFIGURATION, Vec::new())
            .await?;
        Ok(NetworkConfiguration::parse(&data)?)
    }

    async fn get_network_station_state(&self) -> ChannelResult<StationState> {
        let data = self
            .inner
            .call(opcodes::NETWORK_STATION_STATE, Vec::new())
            .await?;
        Ok(StationState::parse(&data)?)
    }

    async fn configure_network(&self, settings: &NetworkSettings) -> ChannelResult<()> {
        self.inner
            .command(opcodes::CONFIGURE_NETWORK, settings.encode()?)
            .await
    }

    async fn list_wifi_networks(&self) -> ChannelResult<Vec<WifiNetwork>> {
        let data = self.inner.call(opcodes::WIFI_LIST, Vec::new()).await?;
        Ok(messages::parse_wifi_list(&data)?)
    }
}

#[async_trait]
impl SystemChannel for SacpChannel {
    async fn get_firmware_version(&self) -> ChannelResult<String> {
        let data = self.inner.call(opcodes::FIRMWARE_VERSION, Vec::new()).await?;
        Ok(ByteReader::new(&data).string()?)
    }

    async fn upgrade_firmware_from_file(&self, path: &Path) -> ChannelResult<()> {
        let dispatcher = self.inner.ready_dispatcher()?;
        upload_large_file(
            &dispatcher,
            path,
            &file_name(path),
            &self.inner.config.transfer,
            Some(self.inner.progress_callback()),
        )
        .await?;
        let md5 = file_md5(path).await?;
        let payload = ByteWriter::new().string(&md5)?.finish();
        self.inner.command(opcodes::UPGRADE_FIRMWARE, payload).await
    }

    async fn export_log_to_external_storage(&self) -> ChannelResult<()> {
        self.inner.command(opcodes::EXPORT_LOG, Vec::new()).await
    }
}

#[async_trait]
impl MotionChannel for SacpChannel {
    async fn home(&self, axes: &[Axis]) -> ChannelResult<()> {
        self.inner
            .command(opcodes::HOME, vec![axis_mask(axes)])
            .await
    }

    async fn move_to(&self, moves: &[(Axis, f64)], feed_rate: Option<u32>) -> ChannelResult<()> {
        let feed = feed_rate.unwrap_or(DEFAULT_FEED_RATE).min(u16::MAX as u32) as u16;
        self.inner
            .command(opcodes::MOVE, move_payload(moves, feed))
            .await
    }

    async fn set_work_origin(&self) -> ChannelResult<()> {
        self.inner.command(opcodes::SET_WORK_ORIGIN, Vec::new()).await
    }

    async fn set_speed_factor(&self, percent: u16) -> ChannelResult<()> {
        let payload = ByteWriter::new().u16(percent).finish();
        self.inner.command(opcodes::SPEED_FACTOR, payload).await
    }

    async fn get_coordinates(&self) -> ChannelResult<CoordinateInfo> {
        let data = self.inner.call(opcodes::COORDINATE_INFO, Vec::new()).await?;
        let info = CoordinateInfo::parse(&data)?;
        self.inner.status.lock().position = Some(info.position);
        Ok(info)
    }
}

fn celsius(value: f64) -> u16 {
    value.round().clamp(0.0, u16::MAX as f64) as u16
}

#[async_trait]
impl PrinterChannel for SacpChannel {
    async fn set_nozzle_temperature(&self, extruder: u8, temperature: f64) -> ChannelResult<()> {
        let payload = ByteWriter::new().u8(extruder).u16(celsius(temperature)).finish();
        self.inner
            .command(opcodes::NOZZLE_TEMPERATURE, payload)
            .await
    }

    async fn set_bed_temperature(&self, temperature: f64) -> ChannelResult<()> {
        let payload = ByteWriter::new().u16(celsius(temperature)).finish();
        self.inner.command(opcodes::BED_TEMPERATURE, payload).await
    }

    async fn switch_extruder(&self, extruder: u8) -> ChannelResult<()> {
        self.inner
            .command(opcodes::SWITCH_EXTRUDER, vec![extruder])
            .await
    }

    async fn load_filament(&self, extruder: u8) -> ChannelResult<()> {
        self.inner
            .command(opcodes::LOAD_FILAMENT, vec![extruder])
            .await
    }

    async fn unload_filament(&self, extruder: u8) -> ChannelResult<()> {
        self.inner
            .command(opcodes::UNLOAD_FILAMENT, vec![extruder])
            .await
    }

    async fn set_z_offset(&self, extruder: u8, offset: f64) -> ChannelResult<()> {
        let payload = ByteWriter::new().u8(extruder).f32(offset as f32).finish();
        self.inner.command(opcodes::Z_OFFSET, payload).await
    }
}

#[async_trait]
impl PrintChannel for SacpChannel {
    async fn start_print(&self, job: &PrintJob) -> ChannelResult<()> {
        let md5 = file_md5(&job.path).await?;
        let payload = ByteWriter::new()
            .string(&md5)?
            .string(&job.target_name)?
            .finish();
        self.inner.command(opcodes::PRINT_START, payload).await
    }

    async fn pause_print(&self) -> ChannelResult<()> {
        self.inner.command(opcodes::PRINT_PAUSE, Vec::new()).await
    }

    async fn resume_print(&self) -> ChannelResult<()> {
        self.inner.command(opcodes::PRINT_RESUME, Vec::new()).await
    }

    async fn stop_print(&self) -> ChannelResult<()> {
        self.inner.command(opcodes::PRINT_STOP, Vec::new()).await
    }
}

#[async_trait]
impl EnclosureChannel for SacpChannel {
    async fn set_enclosure_light(&self, brightness: u8) -> ChannelResult<()> {
        self.inner
            .command(opcodes::ENCLOSURE_LIGHT, vec![brightness.min(100)])
            .await
    }

    async fn set_enclosure_fan(&self, speed: u8) -> ChannelResult<()> {
        self.inner
            .command(opcodes::ENCLOSURE_FAN, vec![speed.min(100)])
            .await
    }

    async fn set_door_detection(&self, enabled: bool) -> ChannelResult<()> {
        self.inner
            .command(opcodes::ENCLOSURE_DOOR_DETECTION, vec![u8::from(enabled)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sacp::Attribute;
    use fablink_core::PrintState;
    use tokio::sync::mpsc;

    /// Answers every request with `[0]`, machine info with `model`
    fn spawn_machine(
        mut link: PacketLink,
        model: u8,
    ) -> (mpsc::UnboundedReceiver<Packet>, mpsc::Sender<Packet>) {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let push = link.outbound.clone();
        tokio::spawn(async move {
            while let Some(packet) = link.inbound.recv().await {
                if packet.attribute != Attribute::Request {
                    continue;
                }
                let reply = if packet.command == opcodes::MACHINE_INFO {
                    ByteWriter::new()
                        .u8(0)
                        .u8(model)
                        .string("hw1")
                        .and_then(|w| w.string("SN42"))
                        .and_then(|w| w.string("2.0.1"))
                        .unwrap()
                        .finish()
                } else {
                    vec![0]
                };
                let _ = seen_tx.send(packet.clone());
                if link.outbound.send(packet.ack(reply)).await.is_err() {
                    break;
                }
            }
        });
        (seen_rx, push)
    }

    fn channel_pair(model: u8) -> (SacpChannel, mpsc::UnboundedReceiver<Packet>, mpsc::Sender<Packet>) {
        let (host, machine) = PacketLink::pair();
        let (seen, push) = spawn_machine(machine, model);
        let channel = SacpChannel::new(SacpTarget::link(Protocol::SacpTcp, host), Config::default());
        (channel, seen, push)
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let (channel, mut seen, _push) = channel_pair(3);
        let mut events = channel.subscribe_events();
        assert!(channel.connection_open(&OpenOptions::default()).await);
        assert_eq!(channel.state(), ChannelState::Ready);

        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Connecting));
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Connected));
        match events.recv().await.unwrap() {
            ChannelEvent::Ready { machine, .. } => assert_eq!(machine, MachineModel::Artisan),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(seen.recv().await.unwrap().command, opcodes::CONNECT);
        assert_eq!(seen.recv().await.unwrap().command, opcodes::MACHINE_INFO);
        assert_eq!(channel.machine_info().unwrap().firmware_version, "2.0.1");
    }

    #[tokio::test]
    async fn test_capability_refused_before_ready() {
        let (channel, _seen, _push) = channel_pair(0);
        let motion = channel.motion().unwrap();
        let err = motion.home(&[]).await.unwrap_err();
        assert!(matches!(
            err,
            fablink_core::Error::Channel(ChannelError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_typed_commands_reach_wire() {
        let (channel, mut seen, _push) = channel_pair(5);
        assert!(channel.connection_open(&OpenOptions::default()).await);
        seen.recv().await.unwrap();
        seen.recv().await.unwrap();

        channel.laser().unwrap().set_laser_power(50.0).await.unwrap();
        let packet = seen.recv().await.unwrap();
        assert_eq!(packet.command, opcodes::LASER_POWER);
        assert_eq!(ByteReader::new(&packet.payload).f32().unwrap(), 50.0);

        channel.motion().unwrap().home(&[Axis::Z]).await.unwrap();
        let packet = seen.recv().await.unwrap();
        assert_eq!(packet.command, opcodes::HOME);
        assert_eq!(packet.payload, vec![0b100]);
        assert_eq!(channel.status().head_type, Some(HeadType::Laser));
    }

    #[tokio::test]
    async fn test_heartbeat_updates_status() {
        let (channel, mut seen, push) = channel_pair(0);
        assert!(channel.connection_open(&OpenOptions::default()).await);
        let mut events = channel.subscribe_events();
        assert!(channel.start_heartbeat().await);
        seen.recv().await.unwrap();
        seen.recv().await.unwrap();
        let subscribe = seen.recv().await.unwrap();
        assert_eq!(subscribe.command, opcodes::SUBSCRIBE);
        assert_eq!(&subscribe.payload[..2], &[0x01, 0xA0]);

        push.send(Packet::request(opcodes::HEARTBEAT, PeerId::Host, 900, vec![0, 2]))
            .await
            .unwrap();
        loop {
            if let ChannelEvent::Status(status) = events.recv().await.unwrap() {
                assert_eq!(status.print_state, PrintState::Running);
                break;
            }
        }
        assert!(channel.stop_heartbeat().await);
        assert_eq!(seen.recv().await.unwrap().command, opcodes::UNSUBSCRIBE);
    }

    #[tokio::test]
    async fn test_transport_loss_closes_channel() {
        let (host, mut machine) = PacketLink::pair();
        // Answers the handshake, then goes away.
        tokio::spawn(async move {
            for _ in 0..2 {
                let request = machine.inbound.recv().await.unwrap();
                let reply = if request.command == opcodes::MACHINE_INFO {
                    ByteWriter::new()
                        .u8(0)
                        .u8(1)
                        .string("hw")
                        .and_then(|w| w.string("sn"))
                        .and_then(|w| w.string("fw"))
                        .unwrap()
                        .finish()
                } else {
                    vec![0]
                };
                machine.outbound.send(request.ack(reply)).await.unwrap();
            }
        });

        let channel = SacpChannel::new(SacpTarget::link(Protocol::SacpSerial, host), Config::default());
        let mut events = channel.subscribe_events();
        assert!(channel.connection_open(&OpenOptions::default()).await);
        loop {
            if let ChannelEvent::Closed { reason } = events.recv().await.unwrap() {
                assert_eq!(reason, DisconnectReason::TransportClosed);
                break;
            }
        }
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.laser().unwrap().get_fire_sensor_sensitivity().await.is_err());
    }

    #[tokio::test]
    async fn test_polite_close_says_goodbye() {
        let (channel, mut seen, _push) = channel_pair(2);
        assert!(channel.connection_open(&OpenOptions::default()).await);
        seen.recv().await.unwrap();
        seen.recv().await.unwrap();
        assert!(channel.connection_close(false).await);
        assert_eq!(seen.recv().await.unwrap().command, opcodes::DISCONNECT);
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(!channel.connection_close(false).await);
    }
}
