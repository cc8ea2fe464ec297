//! Connection manager
//!
//! The single owner of the active connection. It detects the protocol,
//! asks the [`ChannelFactory`] for a channel, binds a machine instance once
//! the channel is ready and routes every command to the channel's
//! capabilities. SACP connections get typed calls; legacy connections get
//! the equivalent G-code from [`crate::text::gcode`].
//!
//! At most one channel is bound at a time. Opening a new connection
//! detaches the previous channel's event forwarding before the new
//! channel is created, so a replaced channel can never reach the bus.

pub mod command;
pub mod factory;

pub use command::{
    AxisMove, BackgroundSnap, Command, MaterialThicknessSource, OpenRequest, Response,
    StartOptions,
};
pub use factory::{ChannelFactory, DefaultChannelFactory};

use crate::channel::{unsupported, Channel, ChannelEvent, OpenOptions, PrintJob, UploadOptions};
use crate::detector::{DefaultDetector, ProtocolDetector};
use crate::machine::{create_machine_instance, MachineInstance};
use crate::sacp::messages::{
    Axis, CoordinateInfo, CrosshairOffset, NetworkConfiguration, NetworkSettings, StationState,
    WifiNetwork,
};
use crate::text::gcode::{self, ToolRestore};
use fablink_core::{
    AppEvent, ChannelError, ChannelState, ConnectionError, ConnectionEvent, ConnectionType,
    DisconnectReason, Error, EventBus, EventBusError, HeadType, MachineEvent, MachineModel,
    Protocol, ProtocolFamily, Result,
};
use fablink_settings::{Config, ConnectionSettings, StorageLocation, StorageSettings};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// Header lines scanned for job metadata such as `;max_z(mm):`
const HEADER_SCAN_LINES: usize = 256;

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionTarget {
    /// Network host (name or address)
    Network {
        /// Host
        host: String,
    },
    /// Serial port
    #[serde(rename_all = "camelCase")]
    Serial {
        /// Port name
        port: String,
        /// Baud rate; the configured default when absent
        #[serde(default)]
        baud_rate: Option<u32>,
    },
}

impl ConnectionTarget {
    /// Host or port name for logs and events
    pub fn describe(&self) -> String {
        match self {
            ConnectionTarget::Network { host } => host.clone(),
            ConnectionTarget::Serial { port, .. } => port.clone(),
        }
    }

    /// Network or serial
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            ConnectionTarget::Network { .. } => ConnectionType::Network,
            ConnectionTarget::Serial { .. } => ConnectionType::Serial,
        }
    }
}

/// Manager state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerState {
    /// No connection
    Idle,
    /// Probing the target
    DetectingProtocol,
    /// Channel opening
    ChannelConnecting,
    /// Channel transport open
    ChannelConnected,
    /// Commands accepted
    ChannelReady,
    /// Closing the channel
    Closing,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Idle => "Idle",
            ManagerState::DetectingProtocol => "DetectingProtocol",
            ManagerState::ChannelConnecting => "ChannelConnecting",
            ManagerState::ChannelConnected => "ChannelConnected",
            ManagerState::ChannelReady => "ChannelReady",
            ManagerState::Closing => "Closing",
        };
        f.write_str(name)
    }
}

/// The connection currently owned by the manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveConnection {
    /// Network or serial
    pub connection_type: ConnectionType,
    /// Protocol the channel speaks
    pub protocol: Protocol,
    /// Host or serial port
    pub target: ConnectionTarget,
    /// Model reported by the handshake
    pub model: MachineModel,
    /// Head reported by the handshake
    pub head_type: Option<HeadType>,
    /// Channel lifecycle state
    pub state: ChannelState,
}

/// State a legacy resume needs from the job start
#[derive(Debug, Default)]
struct JobContext {
    header: Option<String>,
    head_type: Option<HeadType>,
    laser_power: Option<f64>,
    spindle_rpm: Option<u32>,
    tool_on: bool,
}

struct Binding {
    id: u64,
    connection: Mutex<ActiveConnection>,
    channel: Arc<dyn Channel>,
    machine: Mutex<Option<Arc<dyn MachineInstance>>>,
    forward: CancellationToken,
    job: Mutex<JobContext>,
}

impl Binding {
    fn protocol(&self) -> Protocol {
        self.channel.protocol()
    }

    fn is_sacp(&self) -> bool {
        self.protocol().family() == ProtocolFamily::Sacp
    }

    fn target(&self) -> String {
        self.connection.lock().target.describe()
    }

    fn head_type(&self) -> HeadType {
        self.job
            .lock()
            .head_type
            .or(self.channel.status().head_type)
            .or(self.connection.lock().head_type)
            .unwrap_or_default()
    }

    /// The capability, or an unsupported-event error naming `event`
    fn require<'a, T: ?Sized>(&self, capability: Option<&'a T>, event: &str) -> Result<&'a T> {
        capability.ok_or_else(|| unsupported(event, self.protocol()))
    }

    async fn gcode(&self, event: &str, program: &str) -> Result<String> {
        self.require(self.channel.gcode(), event)?
            .execute_gcode(program)
            .await
    }
}

struct Shared {
    detector: Arc<dyn ProtocolDetector>,
    factory: Arc<dyn ChannelFactory>,
    bus: Arc<EventBus>,
    state: Mutex<ManagerState>,
    active: Mutex<Option<Arc<Binding>>>,
    next_id: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
    storage: Mutex<StorageLocation>,
}

impl Shared {
    fn set_state(&self, next: ManagerState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!("Manager: {} -> {}", *state, next);
            *state = next;
        }
    }

    fn publish(&self, event: AppEvent) {
        match self.bus.publish(event) {
            Ok(_) | Err(EventBusError::NoSubscribers) => {}
            Err(e) => tracing::warn!("Event not published: {}", e),
        }
    }

    fn on_channel_closed(&self, id: u64, reason: DisconnectReason) {
        let binding = {
            let mut active = self.active.lock();
            if active.as_ref().map(|binding| binding.id) == Some(id) {
                active.take()
            } else {
                None
            }
        };
        let Some(binding) = binding else { return };
        binding.forward.cancel();
        self.set_state(ManagerState::Idle);
        tracing::warn!("Connection to {} lost: {}", binding.target(), reason);
        self.publish(AppEvent::Connection(ConnectionEvent::Closed {
            target: binding.target(),
            reason,
        }));
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        binding: &Binding,
        mut events: broadcast::Receiver<ChannelEvent>,
    ) {
        let weak = Arc::downgrade(self);
        let id = binding.id;
        let cancel = binding.forward.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                let Some(shared) = weak.upgrade() else { return };
                match event {
                    Ok(ChannelEvent::Status(status)) => {
                        shared.publish(AppEvent::Machine(MachineEvent::StatusUpdated(status)))
                    }
                    Ok(ChannelEvent::Transfer(transfer)) => {
                        shared.publish(AppEvent::Transfer(transfer))
                    }
                    Ok(ChannelEvent::Closed { reason }) => {
                        shared.on_channel_closed(id, reason);
                        return;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} channel events", skipped)
                    }
                    Err(RecvError::Closed) => {
                        shared.on_channel_closed(id, DisconnectReason::TransportClosed);
                        return;
                    }
                }
            }
        });
    }
}

/// Owner of the active connection
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Manager over injected detection and channel construction
    pub fn new(
        detector: Arc<dyn ProtocolDetector>,
        factory: Arc<dyn ChannelFactory>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                detector,
                factory,
                bus,
                state: Mutex::new(ManagerState::Idle),
                active: Mutex::new(None),
                next_id: AtomicU64::new(1),
                lifecycle: tokio::sync::Mutex::new(()),
                storage: Mutex::new(StorageLocation::from_settings(&StorageSettings::default())),
            }),
        }
    }

    /// Manager probing real hosts and ports
    pub fn with_config(config: Config, bus: Arc<EventBus>) -> Self {
        let storage = StorageLocation::from_settings(&config.storage);
        let manager = Self::new(
            Arc::new(DefaultDetector::new(config.connection.clone())),
            Arc::new(DefaultChannelFactory::new(config)),
            bus,
        );
        manager.set_storage(storage);
        manager
    }

    /// Directory relative file names are looked up in
    pub fn set_storage(&self, storage: StorageLocation) {
        *self.shared.storage.lock() = storage;
    }

    /// `path` itself, or its staged copy when `path` is a bare name
    /// found in the storage directory
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            let storage = self.shared.storage.lock();
            let name = path.to_string_lossy();
            if storage.exists(&name) {
                return storage.path(&name);
            }
        }
        path.to_path_buf()
    }

    /// Bus the manager publishes to
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    /// Current state
    pub fn state(&self) -> ManagerState {
        *self.shared.state.lock()
    }

    /// The bound connection, if any
    pub fn active_connection(&self) -> Option<ActiveConnection> {
        let binding = self.shared.active.lock().clone()?;
        let mut connection = binding.connection.lock().clone();
        connection.state = binding.channel.state();
        Some(connection)
    }

    /// The bound channel, if any
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.shared
            .active
            .lock()
            .as_ref()
            .map(|binding| binding.channel.clone())
    }

    fn ready(&self) -> Result<Arc<Binding>> {
        if self.state() != ManagerState::ChannelReady {
            return Err(ChannelError::NotConnected.into());
        }
        self.shared
            .active
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::NotConnected.into())
    }

    /// Detect, open and bind a connection, replacing any current one
    pub async fn open(&self, request: &OpenRequest) -> Result<ActiveConnection> {
        let shared = &self.shared;
        let _turn = shared.lifecycle.lock().await;

        let previous = shared.active.lock().take();
        if let Some(previous) = previous {
            tracing::info!("Replacing connection to {}", previous.target());
            self.release(previous, DisconnectReason::Replaced, false).await;
        }

        let target = request.target.clone();
        let name = target.describe();
        match self.connect(request).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                tracing::error!("Connecting to {} failed: {}", name, e);
                shared.set_state(ManagerState::Idle);
                shared.publish(AppEvent::Connection(ConnectionEvent::ConnectionFailed {
                    target: name,
                    error: e.to_string(),
                }));
                Err(e)
            }
        }
    }

    async fn detect(&self, target: &ConnectionTarget) -> Protocol {
        let detector = &self.shared.detector;
        match target {
            ConnectionTarget::Network { host } => {
                detector.detect_network_protocol(host).await.channel_protocol()
            }
            ConnectionTarget::Serial { port, baud_rate } => {
                let baud_rate =
                    baud_rate.unwrap_or_else(|| ConnectionSettings::default().baud_rate);
                detector
                    .detect_serial_port_protocol(port, baud_rate)
                    .await
                    .channel_protocol()
            }
        }
    }

    async fn connect(&self, request: &OpenRequest) -> Result<ActiveConnection> {
        let shared = &self.shared;
        let target = &request.target;
        let name = target.describe();

        shared.set_state(ManagerState::DetectingProtocol);
        let protocol = match request.protocol {
            Some(protocol) => protocol,
            None => self.detect(target).await,
        };
        tracing::info!("Using {} for {}", protocol, name);
        shared.publish(AppEvent::Connection(ConnectionEvent::ProtocolDetected {
            target: name.clone(),
            protocol,
        }));

        let channel = shared.factory.create(protocol, target).await?;
        let mut events = channel.subscribe_events();
        shared.set_state(ManagerState::ChannelConnecting);

        let options = OpenOptions {
            token: request.token.clone(),
        };
        if !channel.connection_open(&options).await {
            return Err(ConnectionError::FailedToOpen {
                port: name,
                reason: format!("{} handshake failed", protocol),
            }
            .into());
        }

        let mut ready = None;
        while let Ok(event) = events.try_recv() {
            match event {
                ChannelEvent::Connecting => {
                    shared.publish(AppEvent::Connection(ConnectionEvent::Connecting {
                        target: name.clone(),
                        protocol,
                    }))
                }
                ChannelEvent::Connected => {
                    shared.set_state(ManagerState::ChannelConnected);
                    shared.publish(AppEvent::Connection(ConnectionEvent::Connected {
                        target: name.clone(),
                        protocol,
                    }));
                }
                ChannelEvent::Ready { machine, head_type } => ready = Some((machine, head_type)),
                ChannelEvent::Status(status) => {
                    shared.publish(AppEvent::Machine(MachineEvent::StatusUpdated(status)))
                }
                ChannelEvent::Transfer(_) => {}
                ChannelEvent::Closed { reason } => {
                    return Err(ChannelError::Rejected {
                        reason: format!("channel closed during open: {}", reason),
                    }
                    .into())
                }
            }
        }
        let Some((model, head_type)) = ready else {
            channel.connection_close(true).await;
            return Err(ChannelError::Rejected {
                reason: "channel opened without identifying the machine".to_string(),
            }
            .into());
        };

        let binding = Arc::new(Binding {
            id: shared.next_id.fetch_add(1, Ordering::Relaxed),
            connection: Mutex::new(ActiveConnection {
                connection_type: target.connection_type(),
                protocol,
                target: target.clone(),
                model,
                head_type,
                state: channel.state(),
            }),
            channel,
            machine: Mutex::new(None),
            forward: CancellationToken::new(),
            job: Mutex::new(JobContext::default()),
        });

        let machine: Arc<dyn MachineInstance> = Arc::from(create_machine_instance(model));
        if let Err(e) = machine.on_startup(&*binding.channel).await {
            tracing::warn!("{} startup sequence failed: {}", model, e);
        }
        *binding.machine.lock() = Some(machine);

        if !binding.channel.start_heartbeat().await {
            tracing::warn!("Heartbeat not started for {}", name);
        }

        shared.spawn_forwarder(&binding, events);
        *shared.active.lock() = Some(binding.clone());
        shared.set_state(ManagerState::ChannelReady);
        shared.publish(AppEvent::Connection(ConnectionEvent::Ready {
            target: name,
            protocol,
            model,
        }));

        let connection = binding.connection.lock().clone();
        Ok(connection)
    }

    async fn release(&self, binding: Arc<Binding>, reason: DisconnectReason, force: bool) {
        let shared = &self.shared;
        shared.set_state(ManagerState::Closing);
        binding.forward.cancel();

        let machine = binding.machine.lock().take();
        if let Some(machine) = machine {
            if let Err(e) = machine.on_close(&*binding.channel).await {
                tracing::warn!("{} close sequence failed: {}", machine.model(), e);
            }
        }
        binding.channel.stop_heartbeat().await;
        if !binding.channel.connection_close(force).await {
            tracing::debug!("Channel for {} was already closed", binding.target());
        }

        shared.set_state(ManagerState::Idle);
        shared.publish(AppEvent::Connection(ConnectionEvent::Closed {
            target: binding.target(),
            reason,
        }));
    }

    /// Close the current connection
    pub async fn close(&self, force: bool) -> Result<()> {
        let _turn = self.shared.lifecycle.lock().await;
        let binding = self
            .shared
            .active
            .lock()
            .take()
            .ok_or(ChannelError::NotConnected)?;
        self.release(binding, DisconnectReason::UserRequested, force)
            .await;
        Ok(())
    }

    /// Run one command and describe the outcome; never fails
    pub async fn dispatch(&self, command: Command) -> Response {
        let event = command.name();
        let result = self.run(command).await;
        match result {
            Ok(data) => Response::ok(event, data),
            Err(e) => {
                tracing::warn!("{} failed: {}", event, e);
                Response::error(event, &e)
            }
        }
    }

    async fn run(&self, command: Command) -> Result<Option<Value>> {
        match command {
            Command::Open(request) => json(self.open(&request).await?),
            Command::Close { force } => self.close(force).await.map(|_| None),
            Command::GetActiveConnection => match self.active_connection() {
                Some(connection) => json(connection),
                None => Err(ChannelError::NotConnected.into()),
            },
            Command::ListSerialPorts => json(self.shared.detector.list_serial_ports()?),
            Command::ExecuteGcode { gcode } => json(self.execute_gcode(&gcode).await?),
            Command::Home { axes } => self.home(&axes).await.map(|_| None),
            Command::CoordinateMove { moves, feed_rate } => {
                let moves: Vec<(Axis, f64)> =
                    moves.iter().map(|m| (m.axis, m.position)).collect();
                self.coordinate_move(&moves, feed_rate).await.map(|_| None)
            }
            Command::SetWorkOrigin => self.set_work_origin().await.map(|_| None),
            Command::SpeedFactor { percent } => self.set_speed_factor(percent).await.map(|_| None),
            Command::SwitchExtruder { extruder } => {
                self.switch_extruder(extruder).await.map(|_| None)
            }
            Command::NozzleTemperature {
                extruder,
                temperature,
            } => self
                .set_nozzle_temperature(extruder, temperature)
                .await
                .map(|_| None),
            Command::BedTemperature { temperature } => {
                self.set_bed_temperature(temperature).await.map(|_| None)
            }
            Command::LoadFilament { extruder } => self.load_filament(extruder).await.map(|_| None),
            Command::UnloadFilament { extruder } => {
                self.unload_filament(extruder).await.map(|_| None)
            }
            Command::ZOffset { extruder, z_offset } => {
                self.set_z_offset(extruder, z_offset).await.map(|_| None)
            }
            Command::LaserPower {
                laser_power,
                is_printing,
            } => self
                .update_laser_power(laser_power, is_printing)
                .await
                .map(|_| None),
            Command::GetCrosshairOffset => json(self.get_crosshair_offset().await?),
            Command::SetCrosshairOffset(offset) => {
                self.set_crosshair_offset(offset).await.map(|_| None)
            }
            Command::GetFireSensorSensitivity => json(self.get_fire_sensor_sensitivity().await?),
            Command::SetFireSensorSensitivity { sensitivity } => self
                .set_fire_sensor_sensitivity(sensitivity)
                .await
                .map(|_| None),
            Command::MaterialThickness => json(self.measure_material_thickness().await?),
            Command::AbortMaterialThickness => {
                self.abort_material_thickness().await.map(|_| None)
            }
            Command::WorkHeight { height } => self.set_work_height(height).await.map(|_| None),
            Command::Spindle { on, rpm } => self.switch_spindle(on, rpm).await.map(|_| None),
            Command::SpindleSpeed { rpm } => self.set_spindle_speed(rpm).await.map(|_| None),
            Command::SpindleSpeedPercentage { percent } => self
                .set_spindle_speed_percentage(percent)
                .await
                .map(|_| None),
            Command::EnclosureLight { value } => {
                self.set_enclosure_light(value).await.map(|_| None)
            }
            Command::EnclosureFan { value } => self.set_enclosure_fan(value).await.map(|_| None),
            Command::EnclosureDoorDetection { enabled } => {
                self.set_door_detection(enabled).await.map(|_| None)
            }
            Command::UploadFile { path, target_name } => {
                json(self.upload_file(&path, target_name).await?)
            }
            Command::GetNetworkConfiguration => json(self.get_network_configuration().await?),
            Command::GetNetworkStationState => json(self.get_network_station_state().await?),
            Command::ConfigureNetwork(settings) => {
                self.configure_network(&settings).await.map(|_| None)
            }
            Command::ListWifiNetworks => json(self.list_wifi_networks().await?),
            Command::GetFirmwareVersion => json(self.get_firmware_version().await?),
            Command::UpgradeFirmware { path } => self.upgrade_firmware(&path).await.map(|_| None),
            Command::ExportLog => self.export_log().await.map(|_| None),
            Command::StartGcode(options) => self.start_gcode(&options).await.map(|_| None),
            Command::PauseGcode => self.pause_gcode().await.map(|_| None),
            Command::ResumeGcode => self.resume_gcode().await.map(|_| None),
            Command::StopGcode => self.stop_gcode().await.map(|_| None),
        }
    }

    /// Run G-code on any protocol; returns the reply text
    pub async fn execute_gcode(&self, program: &str) -> Result<String> {
        let binding = self.ready()?;
        binding.gcode("connection:executeGcode", program).await
    }

    /// Home `axes` (all when empty)
    pub async fn home(&self, axes: &[Axis]) -> Result<()> {
        const EVENT: &str = "connection:goHome";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding.require(binding.channel.motion(), EVENT)?.home(axes).await
        } else {
            binding.gcode(EVENT, &gcode::home(axes)).await.map(drop)
        }
    }

    /// Absolute move
    pub async fn coordinate_move(&self, moves: &[(Axis, f64)], feed_rate: Option<u32>) -> Result<()> {
        const EVENT: &str = "connection:coordinateMove";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.motion(), EVENT)?
                .move_to(moves, feed_rate)
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::move_to(moves, feed_rate))
                .await
                .map(drop)
        }
    }

    /// Make the current position the work origin
    pub async fn set_work_origin(&self) -> Result<()> {
        const EVENT: &str = "connection:setWorkOrigin";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.motion(), EVENT)?
                .set_work_origin()
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::set_work_origin(&[]))
                .await
                .map(drop)
        }
    }

    /// Feed-rate override in percent
    pub async fn set_speed_factor(&self, percent: u16) -> Result<()> {
        const EVENT: &str = "connection:updateWorkSpeedFactor";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.motion(), EVENT)?
                .set_speed_factor(percent)
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::speed_factor(percent))
                .await
                .map(drop)
        }
    }

    /// Current coordinates (SACP only)
    pub async fn get_coordinates(&self) -> Result<CoordinateInfo> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.motion(), "connection:getCoordinates")?
            .get_coordinates()
            .await
    }

    /// Select the active extruder
    pub async fn switch_extruder(&self, extruder: u8) -> Result<()> {
        const EVENT: &str = "connection:switchExtruder";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.printer(), EVENT)?
                .switch_extruder(extruder)
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::switch_extruder(extruder))
                .await
                .map(drop)
        }
    }

    /// Nozzle target temperature
    pub async fn set_nozzle_temperature(&self, extruder: u8, celsius: f64) -> Result<()> {
        const EVENT: &str = "connection:updateNozzleTemperature";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.printer(), EVENT)?
                .set_nozzle_temperature(extruder, celsius)
                .await
        } else {
            let dual = binding.connection.lock().model.is_dual_extruder();
            let tool = dual.then_some(extruder);
            binding
                .gcode(EVENT, &gcode::nozzle_temperature(tool, celsius))
                .await
                .map(drop)
        }
    }

    /// Bed target temperature
    pub async fn set_bed_temperature(&self, celsius: f64) -> Result<()> {
        const EVENT: &str = "connection:updateBedTemperature";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.printer(), EVENT)?
                .set_bed_temperature(celsius)
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::bed_temperature(celsius))
                .await
                .map(drop)
        }
    }

    /// Load filament into `extruder`
    pub async fn load_filament(&self, extruder: u8) -> Result<()> {
        const EVENT: &str = "connection:loadFilament";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.printer(), EVENT)?
                .load_filament(extruder)
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::load_filament(extruder))
                .await
                .map(drop)
        }
    }

    /// Unload filament from `extruder`
    pub async fn unload_filament(&self, extruder: u8) -> Result<()> {
        const EVENT: &str = "connection:unloadFilament";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.printer(), EVENT)?
                .unload_filament(extruder)
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::unload_filament(extruder))
                .await
                .map(drop)
        }
    }

    /// Z offset of `extruder`
    pub async fn set_z_offset(&self, extruder: u8, offset: f64) -> Result<()> {
        const EVENT: &str = "connection:updateZOffset";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.printer(), EVENT)?
                .set_z_offset(extruder, offset)
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::z_offset(offset))
                .await
                .map(drop)
        }
    }

    /// Laser power in percent
    ///
    /// Legacy machines get `M3 P<p> S<p*2.55>` while printing or with the
    /// beam on, `M5` otherwise.
    pub async fn update_laser_power(&self, power: f64, is_printing: bool) -> Result<()> {
        const EVENT: &str = "connection:updateLaserPower";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.laser(), EVENT)?
                .set_laser_power(power)
                .await?;
        } else {
            let tool_on = binding.job.lock().tool_on;
            binding
                .gcode(EVENT, &gcode::laser_power(power, is_printing, tool_on))
                .await?;
        }
        binding.job.lock().laser_power = Some(power);
        Ok(())
    }

    /// Laser crosshair offset
    pub async fn get_crosshair_offset(&self) -> Result<CrosshairOffset> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.laser(), "connection:getCrosshairOffset")?
            .get_crosshair_offset()
            .await
    }

    /// Store the laser crosshair offset
    pub async fn set_crosshair_offset(&self, offset: CrosshairOffset) -> Result<()> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.laser(), "connection:setCrosshairOffset")?
            .set_crosshair_offset(offset)
            .await
    }

    /// Fire sensor sensitivity
    pub async fn get_fire_sensor_sensitivity(&self) -> Result<u16> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.laser(), "connection:getFireSensorSensitivity")?
            .get_fire_sensor_sensitivity()
            .await
    }

    /// Store the fire sensor sensitivity
    pub async fn set_fire_sensor_sensitivity(&self, sensitivity: u16) -> Result<()> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.laser(), "connection:setFireSensorSensitivity")?
            .set_fire_sensor_sensitivity(sensitivity)
            .await
    }

    /// Measure the material under the laser head
    pub async fn measure_material_thickness(&self) -> Result<f64> {
        let binding = self.ready()?;
        self.measure(&binding, "connection:materialThickness").await
    }

    async fn measure(&self, binding: &Binding, event: &str) -> Result<f64> {
        let thickness = binding
            .require(binding.channel.laser(), event)?
            .start_material_thickness_measure()
            .await?;
        self.shared
            .publish(AppEvent::Machine(MachineEvent::MaterialThicknessMeasured { thickness }));
        Ok(thickness)
    }

    /// Abort a running thickness measurement
    pub async fn abort_material_thickness(&self) -> Result<()> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.laser(), "connection:materialThickness_abort")?
            .abort_material_thickness_measure()
            .await
    }

    /// Move to the laser work height and zero Z there
    pub async fn set_work_height(&self, height: f64) -> Result<()> {
        let binding = self.ready()?;
        self.work_height(&binding, "connection:updateWorkHeight", height)
            .await
    }

    async fn work_height(&self, binding: &Binding, event: &str, height: f64) -> Result<()> {
        if binding.is_sacp() {
            binding
                .require(binding.channel.laser(), event)?
                .set_work_height(height)
                .await
        } else {
            binding
                .gcode(event, &gcode::work_height(height))
                .await
                .map(drop)
        }
    }

    /// Spindle on (optionally at `rpm`) or off
    pub async fn switch_spindle(&self, on: bool, rpm: Option<u32>) -> Result<()> {
        const EVENT: &str = "connection:switchCNC";
        let binding = self.ready()?;
        if binding.is_sacp() {
            let cnc = binding.require(binding.channel.cnc(), EVENT)?;
            match (on, rpm) {
                (true, Some(rpm)) => {
                    cnc.set_spindle_speed(rpm).await?;
                    cnc.spindle_on().await?;
                }
                (true, None) => cnc.spindle_on().await?,
                (false, _) => cnc.spindle_off().await?,
            }
        } else {
            let program = if on {
                gcode::spindle_on(rpm)
            } else {
                gcode::TOOL_OFF.to_string()
            };
            binding.gcode(EVENT, &program).await?;
        }
        let mut job = binding.job.lock();
        job.tool_on = on;
        if on && rpm.is_some() {
            job.spindle_rpm = rpm;
        }
        Ok(())
    }

    /// Spindle speed in rpm
    pub async fn set_spindle_speed(&self, rpm: u32) -> Result<()> {
        const EVENT: &str = "connection:updateToolHeadSpeed";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.cnc(), EVENT)?
                .set_spindle_speed(rpm)
                .await?;
        } else {
            binding.gcode(EVENT, &gcode::spindle_speed(rpm)).await?;
        }
        binding.job.lock().spindle_rpm = Some(rpm);
        Ok(())
    }

    /// Spindle speed in percent of maximum
    pub async fn set_spindle_speed_percentage(&self, percent: u8) -> Result<()> {
        const EVENT: &str = "connection:updateToolHeadSpeedPercentage";
        let binding = self.ready()?;
        if binding.is_sacp() {
            binding
                .require(binding.channel.cnc(), EVENT)?
                .set_spindle_speed_percentage(percent)
                .await
        } else {
            binding
                .gcode(EVENT, &gcode::spindle_speed_percentage(percent))
                .await
                .map(drop)
        }
    }

    /// Enclosure light brightness
    pub async fn set_enclosure_light(&self, brightness: u8) -> Result<()> {
        const EVENT: &str = "connection:updateEnclosureLight";
        let binding = self.ready()?;
        match binding.channel.enclosure() {
            Some(enclosure) => enclosure.set_enclosure_light(brightness).await,
            None if !binding.is_sacp() => binding
                .gcode(EVENT, &gcode::enclosure_light(brightness))
                .await
                .map(drop),
            None => Err(unsupported(EVENT, binding.protocol())),
        }
    }

    /// Enclosure fan speed
    pub async fn set_enclosure_fan(&self, speed: u8) -> Result<()> {
        const EVENT: &str = "connection:updateEnclosureFan";
        let binding = self.ready()?;
        match binding.channel.enclosure() {
            Some(enclosure) => enclosure.set_enclosure_fan(speed).await,
            None if !binding.is_sacp() => binding
                .gcode(EVENT, &gcode::enclosure_fan(speed))
                .await
                .map(drop),
            None => Err(unsupported(EVENT, binding.protocol())),
        }
    }

    /// Enclosure door detection
    pub async fn set_door_detection(&self, enabled: bool) -> Result<()> {
        const EVENT: &str = "connection:updateEnclosureDoorDetection";
        let binding = self.ready()?;
        match binding.channel.enclosure() {
            Some(enclosure) => enclosure.set_door_detection(enabled).await,
            None if !binding.is_sacp() => binding
                .gcode(EVENT, &gcode::enclosure_door_detection(enabled))
                .await
                .map(drop),
            None => Err(unsupported(EVENT, binding.protocol())),
        }
    }

    /// Upload a file; returns its size
    pub async fn upload_file(&self, path: &Path, target_name: Option<String>) -> Result<u64> {
        let binding = self.ready()?;
        let options = UploadOptions {
            path: self.resolve_path(path),
            target_name,
        };
        binding
            .require(binding.channel.file(), "connection:uploadFile")?
            .upload_file(&options)
            .await
    }

    /// Network configuration of the machine
    pub async fn get_network_configuration(&self) -> Result<NetworkConfiguration> {
        let binding = self.ready()?;
        binding
            .require(
                binding.channel.network_service(),
                "connection:getNetworkConfiguration",
            )?
            .get_network_configuration()
            .await
    }

    /// Wi-Fi station state of the machine
    pub async fn get_network_station_state(&self) -> Result<StationState> {
        let binding = self.ready()?;
        binding
            .require(
                binding.channel.network_service(),
                "connection:getNetworkStationState",
            )?
            .get_network_station_state()
            .await
    }

    /// Reconfigure the machine's network
    pub async fn configure_network(&self, settings: &NetworkSettings) -> Result<()> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.network_service(), "connection:configureNetwork")?
            .configure_network(settings)
            .await
    }

    /// Wi-Fi networks visible to the machine
    pub async fn list_wifi_networks(&self) -> Result<Vec<WifiNetwork>> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.network_service(), "connection:getWifiNetworks")?
            .list_wifi_networks()
            .await
    }

    /// Firmware version string
    pub async fn get_firmware_version(&self) -> Result<String> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.system(), "connection:getFirmwareVersion")?
            .get_firmware_version()
            .await
    }

    /// Flash a firmware image
    pub async fn upgrade_firmware(&self, path: &Path) -> Result<()> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.system(), "connection:upgradeFirmware")?
            .upgrade_firmware_from_file(&self.resolve_path(path))
            .await
    }

    /// Export the machine log to its external storage
    pub async fn export_log(&self) -> Result<()> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.system(), "connection:exportLog")?
            .export_log_to_external_storage()
            .await
    }

    /// Prepare and start a job
    ///
    /// Laser jobs on network connections first measure the material when
    /// asked to, then compensate the work height, then snap the background
    /// origin. Each step completes before the next starts and the upload
    /// only begins after all of them. Serial legacy connections stream the
    /// file instead of uploading it.
    pub async fn start_gcode(&self, options: &StartOptions) -> Result<()> {
        const EVENT: &str = "connection:startGcode";
        let binding = self.ready()?;
        let path = self.resolve_path(&options.path);
        let header = read_header(&path).await?;
        let head = options.head_type.unwrap_or_else(|| binding.head_type());
        {
            let mut job = binding.job.lock();
            job.header = Some(header);
            job.head_type = Some(head);
            job.laser_power = options.laser_power.or(job.laser_power);
            job.spindle_rpm = options.spindle_rpm.or(job.spindle_rpm);
        }

        let connection_type = binding.connection.lock().connection_type;
        if head == HeadType::Laser && connection_type == ConnectionType::Network {
            self.prepare_laser_job(&binding, options).await?;
        }

        let print = binding.require(binding.channel.print(), EVENT)?;
        let job = PrintJob {
            path: path.clone(),
            target_name: options
                .target_name
                .clone()
                .unwrap_or_else(|| crate::channel::file_name(&path)),
        };
        if connection_type == ConnectionType::Serial && !binding.is_sacp() {
            tracing::info!("Streaming {} to {}", job.target_name, binding.target());
        } else {
            let upload = UploadOptions {
                path: job.path.clone(),
                target_name: Some(job.target_name.clone()),
            };
            binding
                .require(binding.channel.file(), EVENT)?
                .upload_file(&upload)
                .await?;
        }
        print.start_print(&job).await
    }

    async fn prepare_laser_job(&self, binding: &Binding, options: &StartOptions) -> Result<()> {
        const EVENT: &str = "connection:startGcode";

        let mut thickness = options.material_thickness;
        if options.material_thickness_source == MaterialThicknessSource::Auto {
            thickness = self.measure(binding, EVENT).await?;
            tracing::info!("Measured material thickness {:.2} mm", thickness);
        }

        let focal_length = options
            .focal_length
            .or(binding.channel.status().laser_focal_length);
        match focal_length {
            Some(focal_length) => {
                let offset = if options.is_rotate {
                    options.cylinder_radius.unwrap_or_default()
                } else {
                    thickness
                };
                self.work_height(binding, EVENT, focal_length + offset)
                    .await?;
            }
            None => tracing::warn!("Focal length unknown, skipping work-height compensation"),
        }

        if let Some(snap) = options.background {
            let moves = [(Axis::X, snap.x), (Axis::Y, snap.y)];
            if binding.is_sacp() {
                let motion = binding.require(binding.channel.motion(), EVENT)?;
                motion.move_to(&moves, None).await?;
                motion.set_work_origin().await?;
            } else {
                let program = format!(
                    "{}\n{}",
                    gcode::move_to(&moves, None),
                    gcode::set_work_origin(&[Axis::X, Axis::Y])
                );
                binding.gcode(EVENT, &program).await?;
            }
        }
        Ok(())
    }

    /// Pause the running job
    pub async fn pause_gcode(&self) -> Result<()> {
        let binding = self.ready()?;
        binding
            .require(binding.channel.print(), "connection:pauseGcode")?
            .pause_print()
            .await
    }

    /// Resume a paused job
    ///
    /// Legacy firmware does not restore its position after a pause, so the
    /// recovery program runs first. SACP firmware recovers by itself.
    pub async fn resume_gcode(&self) -> Result<()> {
        const EVENT: &str = "connection:resumeGcode";
        let binding = self.ready()?;
        let print = binding.require(binding.channel.print(), EVENT)?;
        if !binding.is_sacp() {
            match binding.channel.status().position {
                Some(position) => {
                    let head = binding.head_type();
                    let (header, tool) = {
                        let job = binding.job.lock();
                        (
                            job.header.clone(),
                            ToolRestore::for_head(head, job.laser_power, job.spindle_rpm),
                        )
                    };
                    let snippet = gcode::resume_snippet(&position, header.as_deref(), tool);
                    binding.gcode(EVENT, &snippet).await?;
                }
                None => tracing::warn!("Pause position unknown, resuming without recovery moves"),
            }
        }
        print.resume_print().await
    }

    /// Stop the running job; legacy machines also switch the tool off
    pub async fn stop_gcode(&self) -> Result<()> {
        const EVENT: &str = "connection:stopGcode";
        let binding = self.ready()?;
        binding
            .require(binding.channel.print(), EVENT)?
            .stop_print()
            .await?;
        if !binding.is_sacp() {
            let head = binding.head_type();
            binding.gcode(EVENT, &gcode::tool_off(head)).await?;
            binding.job.lock().tool_on = false;
        }
        Ok(())
    }
}

fn json<T: Serialize>(value: T) -> Result<Option<Value>> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| Error::other(format!("unserialisable result: {}", e)))
}

/// Leading comment lines of a G-code file
async fn read_header(path: &Path) -> Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut header = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with(';') {
            break;
        }
        header.push(line);
        if header.len() >= HEADER_SCAN_LINES {
            break;
        }
    }
    Ok(header.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::text_serial::{TextSerialChannel, TextTarget};
    use crate::detector::{NetworkProtocol, SerialPortProtocol};
    use crate::transport::{line_link, ByteStream};
    use async_trait::async_trait;
    use fablink_core::PrintState;
    use std::io::Write;
    use tokio::sync::mpsc;

    struct FixedDetector(SerialPortProtocol);

    #[async_trait]
    impl ProtocolDetector for FixedDetector {
        async fn detect_network_protocol(&self, _host: &str) -> NetworkProtocol {
            NetworkProtocol::Unknown
        }

        async fn detect_serial_port_protocol(&self, _port: &str, _baud: u32) -> SerialPortProtocol {
            self.0
        }
    }

    /// Hands out text channels wired to a fake firmware recording every line
    struct TextFactory {
        lines: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl ChannelFactory for TextFactory {
        async fn create(
            &self,
            protocol: Protocol,
            _target: &ConnectionTarget,
        ) -> Result<Arc<dyn Channel>> {
            assert_eq!(protocol, Protocol::Text);
            let (host, machine) = ByteStream::pair();
            let mut link = line_link(machine);
            let lines = self.lines.clone();
            tokio::spawn(async move {
                while let Some(line) = link.inbound.recv().await {
                    let replies: &[&str] = match line.as_str() {
                        "M1005" => &["Firmware Version: 1.0", "Machine Size: M", "ok"],
                        "M105" => &["T:20.0 /0.0 B:20.0 /0.0", "ok"],
                        _ => {
                            let _ = lines.send(line.clone());
                            &["ok"]
                        }
                    };
                    for reply in replies {
                        if link.outbound.send(reply.to_string()).await.is_err() {
                            return;
                        }
                    }
                }
            });
            Ok(Arc::new(TextSerialChannel::new(
                TextTarget::stream(host),
                Config::default(),
            )))
        }
    }

    fn manager() -> (ConnectionManager, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            Arc::new(FixedDetector(SerialPortProtocol::Unknown)),
            Arc::new(TextFactory { lines: tx }),
            Arc::new(EventBus::new()),
        );
        (manager, rx)
    }

    fn serial_request() -> OpenRequest {
        OpenRequest {
            target: ConnectionTarget::Serial {
                port: "/dev/ttyACM0".to_string(),
                baud_rate: None,
            },
            protocol: None,
            token: None,
        }
    }

    #[tokio::test]
    async fn test_commands_refused_when_idle() {
        let (manager, _lines) = manager();
        let response = manager.dispatch(Command::Home { axes: vec![] }).await;
        assert_eq!(response.err, 1);
        assert_eq!(response.msg.as_deref(), Some("Machine is not connected"));
        assert_eq!(response.event, "connection:goHome");
    }

    #[tokio::test]
    async fn test_unknown_serial_falls_back_to_text() {
        let (manager, mut lines) = manager();
        let connection = manager.open(&serial_request()).await.unwrap();
        assert_eq!(connection.protocol, Protocol::Text);
        assert_eq!(connection.model, MachineModel::A250);
        assert_eq!(manager.state(), ManagerState::ChannelReady);

        manager.home(&[Axis::X, Axis::Y]).await.unwrap();
        assert_eq!(lines.recv().await.unwrap(), "G28 X Y");
    }

    #[tokio::test]
    async fn test_legacy_laser_power_gcode() {
        let (manager, mut lines) = manager();
        manager.open(&serial_request()).await.unwrap();
        let response = manager
            .dispatch(Command::LaserPower {
                laser_power: 50.0,
                is_printing: true,
            })
            .await;
        assert!(response.is_ok());
        assert_eq!(lines.recv().await.unwrap(), "M3 P50 S127.5");

        manager.update_laser_power(30.0, false).await.unwrap();
        assert_eq!(lines.recv().await.unwrap(), "M5");
    }

    #[tokio::test]
    async fn test_unsupported_capability_answered() {
        let (manager, _lines) = manager();
        manager.open(&serial_request()).await.unwrap();
        let response = manager.dispatch(Command::GetCrosshairOffset).await;
        assert_eq!(response.err, 1);
        assert!(response
            .msg
            .unwrap()
            .starts_with("Unsupported event: connection:getCrosshairOffset"));
    }

    #[tokio::test]
    async fn test_legacy_resume_replays_recovery() {
        let (manager, mut lines) = manager();
        manager.open(&serial_request()).await.unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, ";max_z(mm): 12.5\nG90\nG0 X10 Y20 Z3").unwrap();
        let mut options = StartOptions::new(file.path());
        options.head_type = Some(HeadType::Printing);
        manager.start_gcode(&options).await.unwrap();
        assert_eq!(lines.recv().await.unwrap(), "G90");
        assert_eq!(lines.recv().await.unwrap(), "G0 X10 Y20 Z3");
        let channel = manager.channel().unwrap();
        while channel.status().print_state != PrintState::Completed {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // With the job finished the firmware refuses the resume, but the
        // recovery program from the last sent position goes out first.
        let err = manager.resume_gcode().await;
        let recovery: Vec<String> = vec![
            "G90",
            "G28 Z",
            "G0 X10 Y20 F3000",
            "G0 Z12.5 F1000",
            "G0 Z3 F1000",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        for expected in recovery {
            assert_eq!(lines.recv().await.unwrap(), expected);
        }
        assert!(err.is_err(), "no job is left to resume");
    }

    #[test]
    fn test_bare_names_resolve_to_staged_files() {
        let (manager, _lines) = manager();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("staged.gcode"), "G28\n").unwrap();
        manager.set_storage(StorageLocation::new(dir.path()));

        assert_eq!(
            manager.resolve_path(Path::new("staged.gcode")),
            dir.path().join("staged.gcode")
        );
        assert_eq!(
            manager.resolve_path(Path::new("other.gcode")),
            PathBuf::from("other.gcode")
        );
        let absolute = dir.path().join("staged.gcode");
        assert_eq!(manager.resolve_path(&absolute), absolute);
    }

    #[tokio::test]
    async fn test_close_publishes_closed() {
        let (manager, _lines) = manager();
        let mut bus = manager.bus().receiver();
        manager.open(&serial_request()).await.unwrap();
        manager.close(false).await.unwrap();
        assert_eq!(manager.state(), ManagerState::Idle);
        assert!(manager.active_connection().is_none());

        let mut closed = 0;
        while let Ok(event) = bus.try_recv() {
            if let AppEvent::Connection(ConnectionEvent::Closed { reason, .. }) = event {
                assert_eq!(reason, DisconnectReason::UserRequested);
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert!(manager.close(false).await.is_err());
    }
}
