use async_trait::async_trait;
use fablink_communication::channel::{
    ChannelResult, FileChannel, GcodeChannel, LaserChannel, MotionChannel, PrintChannel, PrintJob,
    UploadOptions,
};
use fablink_communication::manager::command::{BackgroundSnap, MaterialThicknessSource};
use fablink_communication::sacp::messages::{Axis, CoordinateInfo, CrosshairOffset};
use fablink_communication::{
    Channel, ChannelEvent, ChannelFactory, Command, ConnectionManager, ConnectionTarget,
    ManagerState, NetworkProtocol, OpenOptions, OpenRequest, ProtocolDetector, SerialPortInfo,
    SerialPortProtocol, StartOptions,
};
use fablink_core::{
    AppEvent, ChannelState, ConnectionEvent, DisconnectReason, EventBus, HeadType, MachineEvent,
    MachineModel, MachineStatus, PrintState, Protocol, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type Log = Arc<Mutex<Vec<String>>>;

/// Channel that records every capability call
struct Recorder {
    protocol: Protocol,
    log: Log,
    events: broadcast::Sender<ChannelEvent>,
    state: Mutex<ChannelState>,
}

impl Recorder {
    fn new(protocol: Protocol, log: Log) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            protocol,
            log,
            events,
            state: Mutex::new(ChannelState::Disconnected),
        }
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }

    fn typed(&self) -> bool {
        self.protocol != Protocol::Sstp && self.protocol != Protocol::Text
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Channel for Recorder {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn status(&self) -> MachineStatus {
        MachineStatus::default()
    }

    async fn connection_open(&self, _options: &OpenOptions) -> bool {
        self.emit(ChannelEvent::Connecting);
        self.emit(ChannelEvent::Connected);
        *self.state.lock() = ChannelState::Ready;
        self.emit(ChannelEvent::Ready {
            machine: MachineModel::A350,
            head_type: Some(HeadType::Laser),
        });
        true
    }

    async fn connection_close(&self, _force: bool) -> bool {
        let mut state = self.state.lock();
        if *state == ChannelState::Disconnected {
            return false;
        }
        *state = ChannelState::Disconnected;
        drop(state);
        self.emit(ChannelEvent::Closed {
            reason: DisconnectReason::UserRequested,
        });
        true
    }

    async fn start_heartbeat(&self) -> bool {
        true
    }

    async fn stop_heartbeat(&self) -> bool {
        true
    }

    fn gcode(&self) -> Option<&dyn GcodeChannel> {
        Some(self)
    }

    fn file(&self) -> Option<&dyn FileChannel> {
        Some(self)
    }

    fn print(&self) -> Option<&dyn PrintChannel> {
        Some(self)
    }

    fn laser(&self) -> Option<&dyn LaserChannel> {
        self.typed().then_some(self as &dyn LaserChannel)
    }

    fn motion(&self) -> Option<&dyn MotionChannel> {
        self.typed().then_some(self as &dyn MotionChannel)
    }
}

#[async_trait]
impl GcodeChannel for Recorder {
    async fn execute_gcode(&self, gcode: &str) -> ChannelResult<String> {
        self.record(format!("gcode:{}", gcode));
        Ok("ok".to_string())
    }
}

#[async_trait]
impl FileChannel for Recorder {
    async fn upload_file(&self, options: &UploadOptions) -> ChannelResult<u64> {
        self.record(format!("upload:{}", options.target_name()));
        Ok(0)
    }
}

#[async_trait]
impl PrintChannel for Recorder {
    async fn start_print(&self, job: &PrintJob) -> ChannelResult<()> {
        self.record(format!("start:{}", job.target_name));
        Ok(())
    }

    async fn pause_print(&self) -> ChannelResult<()> {
        self.record("pause");
        Ok(())
    }

    async fn resume_print(&self) -> ChannelResult<()> {
        self.record("resume");
        Ok(())
    }

    async fn stop_print(&self) -> ChannelResult<()> {
        self.record("stop");
        Ok(())
    }
}

#[async_trait]
impl LaserChannel for Recorder {
    async fn get_crosshair_offset(&self) -> ChannelResult<CrosshairOffset> {
        Ok(CrosshairOffset::default())
    }

    async fn set_crosshair_offset(&self, _offset: CrosshairOffset) -> ChannelResult<()> {
        Ok(())
    }

    async fn get_fire_sensor_sensitivity(&self) -> ChannelResult<u16> {
        Ok(0)
    }

    async fn set_fire_sensor_sensitivity(&self, _sensitivity: u16) -> ChannelResult<()> {
        Ok(())
    }

    async fn set_laser_power(&self, power: f64) -> ChannelResult<()> {
        self.record(format!("laser_power:{}", power));
        Ok(())
    }

    async fn set_work_height(&self, height: f64) -> ChannelResult<()> {
        // Slow on purpose: the upload must still wait for it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.record(format!("work_height:{}", height));
        Ok(())
    }

    async fn start_material_thickness_measure(&self) -> ChannelResult<f64> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.record("measure");
        Ok(2.5)
    }

    async fn abort_material_thickness_measure(&self) -> ChannelResult<()> {
        Ok(())
    }
}

#[async_trait]
impl MotionChannel for Recorder {
    async fn home(&self, _axes: &[Axis]) -> ChannelResult<()> {
        self.record("home");
        Ok(())
    }

    async fn move_to(&self, moves: &[(Axis, f64)], _feed_rate: Option<u32>) -> ChannelResult<()> {
        let targets: Vec<String> = moves.iter().map(|(axis, v)| format!("{:?}{}", axis, v)).collect();
        self.record(format!("move:{}", targets.join(" ")));
        Ok(())
    }

    async fn set_work_origin(&self) -> ChannelResult<()> {
        self.record("origin");
        Ok(())
    }

    async fn set_speed_factor(&self, _percent: u16) -> ChannelResult<()> {
        Ok(())
    }

    async fn get_coordinates(&self) -> ChannelResult<CoordinateInfo> {
        Err(fablink_core::Error::other("not tracked"))
    }
}

/// Answers by address: `sacp-tcp`, `sacp-udp`, anything else silent
struct ByName;

#[async_trait]
impl ProtocolDetector for ByName {
    async fn detect_network_protocol(&self, host: &str) -> NetworkProtocol {
        match host {
            "sacp-tcp" => NetworkProtocol::SacpTcp,
            "sacp-udp" => NetworkProtocol::SacpUdp,
            "http" => NetworkProtocol::Sstp,
            _ => NetworkProtocol::Unknown,
        }
    }

    async fn detect_serial_port_protocol(&self, port: &str, _baud_rate: u32) -> SerialPortProtocol {
        match port {
            "/dev/sacp" => SerialPortProtocol::Sacp,
            "/dev/text" => SerialPortProtocol::Text,
            _ => SerialPortProtocol::Unknown,
        }
    }

    fn list_serial_ports(&self) -> Result<Vec<SerialPortInfo>> {
        Ok(vec![
            SerialPortInfo::new("/dev/ttyACM0", "USB Snapmaker").with_usb_ids(0x0483, 0x5740)
        ])
    }
}

#[derive(Default)]
struct RecordingFactory {
    log: Log,
    created: Mutex<Vec<Arc<Recorder>>>,
}

#[async_trait]
impl ChannelFactory for RecordingFactory {
    async fn create(
        &self,
        protocol: Protocol,
        _target: &ConnectionTarget,
    ) -> Result<Arc<dyn Channel>> {
        let channel = Arc::new(Recorder::new(protocol, self.log.clone()));
        self.created.lock().push(channel.clone());
        Ok(channel)
    }
}

fn manager() -> (ConnectionManager, Arc<RecordingFactory>) {
    let factory = Arc::new(RecordingFactory::default());
    let manager = ConnectionManager::new(Arc::new(ByName), factory.clone(), Arc::new(EventBus::new()));
    (manager, factory)
}

fn network(host: &str) -> OpenRequest {
    OpenRequest {
        target: ConnectionTarget::Network {
            host: host.to_string(),
        },
        protocol: None,
        token: None,
    }
}

fn serial(port: &str) -> OpenRequest {
    OpenRequest {
        target: ConnectionTarget::Serial {
            port: port.to_string(),
            baud_rate: None,
        },
        protocol: None,
        token: None,
    }
}

#[tokio::test]
async fn test_protocol_follows_detection() {
    let (manager, _factory) = manager();
    let cases = [
        (network("sacp-tcp"), Protocol::SacpTcp),
        (network("sacp-udp"), Protocol::SacpUdp),
        (network("http"), Protocol::Sstp),
        (network("silent"), Protocol::Sstp),
        (serial("/dev/sacp"), Protocol::SacpSerial),
        (serial("/dev/text"), Protocol::Text),
        (serial("/dev/noise"), Protocol::Text),
    ];
    for (request, expected) in cases {
        let connection = manager.open(&request).await.unwrap();
        assert_eq!(connection.protocol, expected, "{}", request.target.describe());
    }

    let mut forced = network("sacp-tcp");
    forced.protocol = Some(Protocol::Sstp);
    assert_eq!(manager.open(&forced).await.unwrap().protocol, Protocol::Sstp);
}

#[tokio::test]
async fn test_reopen_keeps_one_channel_and_silences_the_old() {
    let (manager, factory) = manager();
    let mut bus = manager.bus().receiver();
    for _ in 0..3 {
        manager.open(&network("sacp-tcp")).await.unwrap();
    }
    let created = factory.created.lock().clone();
    assert_eq!(created.len(), 3);
    let open: Vec<_> = created
        .iter()
        .filter(|c| c.state() != ChannelState::Disconnected)
        .collect();
    assert_eq!(open.len(), 1);
    assert!(Arc::ptr_eq(open[0], &created[2]));

    // Stale events from a replaced channel go nowhere.
    let stale = MachineStatus {
        print_state: PrintState::Paused,
        ..Default::default()
    };
    created[0].emit(ChannelEvent::Status(stale));
    created[1].emit(ChannelEvent::Closed {
        reason: DisconnectReason::HeartbeatLost,
    });
    let fresh = MachineStatus {
        print_state: PrintState::Running,
        ..Default::default()
    };
    created[2].emit(ChannelEvent::Status(fresh));

    let mut replaced = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), bus.recv())
            .await
            .expect("fresh status forwarded")
            .unwrap();
        match event {
            AppEvent::Machine(MachineEvent::StatusUpdated(status)) => {
                assert_eq!(status.print_state, PrintState::Running);
                break;
            }
            AppEvent::Connection(ConnectionEvent::Closed { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::Replaced);
                replaced += 1;
            }
            _ => {}
        }
    }
    assert_eq!(replaced, 2);
    assert_eq!(manager.state(), ManagerState::ChannelReady);
}

#[tokio::test]
async fn test_lost_channel_returns_manager_to_idle() {
    let (manager, factory) = manager();
    let mut bus = manager.bus().receiver();
    manager.open(&serial("/dev/sacp")).await.unwrap();
    let channel = factory.created.lock()[0].clone();
    channel.emit(ChannelEvent::Closed {
        reason: DisconnectReason::HeartbeatLost,
    });

    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), bus.recv())
            .await
            .expect("closed event")
            .unwrap();
        if let AppEvent::Connection(ConnectionEvent::Closed { reason, .. }) = event {
            assert_eq!(reason, DisconnectReason::HeartbeatLost);
            break;
        }
    }
    assert_eq!(manager.state(), ManagerState::Idle);
    assert!(manager.active_connection().is_none());
}

#[tokio::test]
async fn test_laser_power_typed_on_sacp_gcode_on_legacy() {
    let (manager, factory) = manager();
    manager.open(&network("sacp-tcp")).await.unwrap();
    manager.update_laser_power(50.0, true).await.unwrap();
    assert_eq!(*factory.log.lock(), vec!["laser_power:50".to_string()]);

    factory.log.lock().clear();
    manager.open(&network("http")).await.unwrap();
    manager.update_laser_power(50.0, true).await.unwrap();
    assert_eq!(*factory.log.lock(), vec!["gcode:M3 P50 S127.5".to_string()]);
}

#[tokio::test]
async fn test_laser_job_steps_run_in_order() {
    let (manager, factory) = manager();
    manager.open(&network("sacp-tcp")).await.unwrap();
    let mut bus = manager.bus().receiver();

    let file = tempfile::Builder::new().suffix(".nc").tempfile().unwrap();
    std::fs::write(file.path(), ";header\nG0 X1\n").unwrap();
    let mut options = StartOptions::new(file.path());
    options.head_type = Some(HeadType::Laser);
    options.material_thickness_source = MaterialThicknessSource::Auto;
    options.focal_length = Some(10.0);
    options.background = Some(BackgroundSnap { x: 5.0, y: 7.0 });
    let name = file.path().file_name().unwrap().to_string_lossy().into_owned();

    manager.start_gcode(&options).await.unwrap();
    assert_eq!(
        *factory.log.lock(),
        vec![
            "measure".to_string(),
            "work_height:12.5".to_string(),
            "move:X5 Y7".to_string(),
            "origin".to_string(),
            format!("upload:{}", name),
            format!("start:{}", name),
        ]
    );

    let mut measured = None;
    while let Ok(event) = bus.try_recv() {
        if let AppEvent::Machine(MachineEvent::MaterialThicknessMeasured { thickness }) = event {
            measured = Some(thickness);
        }
    }
    assert_eq!(measured, Some(2.5));
}

#[tokio::test]
async fn test_rotary_job_compensates_by_radius() {
    let (manager, factory) = manager();
    manager.open(&network("sacp-udp")).await.unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "G0 X1\n").unwrap();
    let mut options = StartOptions::new(file.path());
    options.head_type = Some(HeadType::Laser);
    options.material_thickness = 3.0;
    options.focal_length = Some(10.0);
    options.is_rotate = true;
    options.cylinder_radius = Some(20.0);

    manager.start_gcode(&options).await.unwrap();
    let log = factory.log.lock().clone();
    assert_eq!(log[0], "work_height:30");
    assert!(log[1].starts_with("upload:"));
    assert!(log[2].starts_with("start:"));
}

#[tokio::test]
async fn test_serial_ports_are_listed_without_a_connection() {
    let (manager, _factory) = manager();
    let response = manager.dispatch(Command::ListSerialPorts).await;
    assert_eq!(response.event, "connection:listSerialPorts");
    assert!(response.is_ok());
    let ports = response.data.unwrap();
    assert_eq!(ports[0]["port_name"], "/dev/ttyACM0");
    assert_eq!(ports[0]["vid"], 0x0483);
}
