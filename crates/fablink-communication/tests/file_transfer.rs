use fablink_communication::codec::{ByteReader, ByteWriter};
use fablink_communication::sacp::{
    file_md5, opcodes, upload_file, Attribute, CommandId, Dispatcher, Packet, PacketLink, PeerId,
    UploadSettings,
};
use fablink_core::{ChannelError, Error};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::time::Duration;

/// Deterministic xorshift so failures reproduce
struct Lossy(u64);

impl Lossy {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn chance(&mut self, percent: u64) -> bool {
        self.next() % 100 < percent
    }
}

struct Announced {
    length: u32,
    chunks: u16,
    md5: String,
}

fn parse_start(payload: &[u8]) -> Announced {
    let mut reader = ByteReader::new(payload);
    let _name = reader.string().unwrap();
    let length = reader.u32().unwrap();
    let chunks = reader.u16().unwrap();
    let md5 = reader.string().unwrap();
    Announced { length, chunks, md5 }
}

fn machine_request(command: CommandId, sequence: u16, payload: Vec<u8>) -> Packet {
    let mut packet = Packet::request(command, PeerId::Host, sequence, payload);
    packet.sender = PeerId::Controller;
    packet
}

/// Machine side pulling chunks; drops and reorders requests, may stop early
async fn lossy_machine(mut link: PacketLink, seed: u64, give_up_after: Option<usize>) -> Vec<u8> {
    let start = link.inbound.recv().await.unwrap();
    assert_eq!(start.command, opcodes::FILE_UPLOAD_START);
    let announced = parse_start(&start.payload);
    link.outbound.send(start.ack(vec![0])).await.unwrap();

    let mut rng = Lossy(seed);
    // A truncating machine must not lose answers, or the host would have
    // served every chunk anyway.
    let drop_percent = if give_up_after.is_some() { 0 } else { 20 };
    let mut wanted: VecDeque<u16> = (0..announced.chunks).collect();
    let mut received: BTreeMap<u16, Vec<u8>> = BTreeMap::new();
    let mut sequence = 1000u16;

    while let Some(index) = wanted.pop_front() {
        if give_up_after.is_some_and(|limit| received.len() >= limit) {
            break;
        }
        // Reorder: occasionally ask for a later chunk first.
        if rng.chance(30) && !wanted.is_empty() {
            let other = (rng.next() as usize) % wanted.len();
            wanted.push_back(index);
            let index = wanted.remove(other).unwrap();
            wanted.push_front(index);
            continue;
        }
        sequence = sequence.wrapping_add(1);
        let request = ByteWriter::new()
            .string(&announced.md5)
            .unwrap()
            .u16(index)
            .finish();
        link.outbound
            .send(machine_request(opcodes::FILE_CHUNK_REQUEST, sequence, request))
            .await
            .unwrap();
        let ack = link.inbound.recv().await.unwrap();
        assert_eq!(ack.attribute, Attribute::Ack);

        // Drop: pretend the answer was lost and ask again later.
        if rng.chance(drop_percent) {
            wanted.push_back(index);
            continue;
        }
        let mut reader = ByteReader::new(&ack.payload);
        assert_eq!(reader.u8().unwrap(), 0);
        assert_eq!(reader.string().unwrap(), announced.md5);
        assert_eq!(reader.u16().unwrap(), index);
        received.insert(index, reader.blob().unwrap().to_vec());
        // Duplicate request of a chunk already held.
        if rng.chance(10) {
            wanted.push_back(index);
        }
    }

    let content: Vec<u8> = received.values().flatten().copied().collect();
    let complete = content.len() == announced.length as usize
        && hex::encode(Md5::digest(&content)) == announced.md5;
    let result = if complete || give_up_after.is_some() { 0 } else { 1 };

    let finished = ByteWriter::new()
        .string(&announced.md5)
        .unwrap()
        .u8(result)
        .finish();
    link.outbound
        .send(machine_request(opcodes::FILE_UPLOAD_FINISHED, 9999, finished))
        .await
        .unwrap();
    let ack = link.inbound.recv().await.unwrap();
    assert_eq!(ack.payload, vec![0]);
    content
}

fn fixture(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let content: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
    file.write_all(&content).unwrap();
    file
}

fn settings() -> UploadSettings {
    UploadSettings {
        chunk_size: 1024,
        idle_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_lossy_pull_still_transfers_every_byte() {
    let file = fixture(10 * 1024 + 77);
    let expected_md5 = file_md5(file.path()).await.unwrap();

    for seed in [1u64, 7, 42, 1234] {
        let (host, machine) = PacketLink::pair();
        let dispatcher = Dispatcher::new(host, Duration::from_secs(5));
        let remote = tokio::spawn(lossy_machine(machine, seed, None));

        let bytes = upload_file(&dispatcher, file.path(), "part.gcode", settings(), None)
            .await
            .unwrap();
        let received = remote.await.unwrap();
        assert_eq!(bytes, 10 * 1024 + 77);
        assert_eq!(received.len() as u64, bytes);
        assert_eq!(hex::encode(Md5::digest(&received)), expected_md5);
    }
}

#[tokio::test]
async fn test_truncated_transfer_never_reports_success() {
    let file = fixture(8 * 1024);
    let (host, machine) = PacketLink::pair();
    let dispatcher = Dispatcher::new(host, Duration::from_secs(5));
    // Claims success after four of eight chunks.
    let remote = tokio::spawn(lossy_machine(machine, 3, Some(4)));

    let err = upload_file(&dispatcher, file.path(), "part.gcode", settings(), None)
        .await
        .unwrap_err();
    remote.await.unwrap();
    match err {
        Error::Channel(ChannelError::Integrity {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 8 * 1024);
            assert!(actual < expected);
        }
        other => panic!("expected an integrity failure, got {:?}", other),
    }
    assert!(!dispatcher.has_handler(opcodes::FILE_CHUNK_REQUEST));
}

#[tokio::test(start_paused = true)]
async fn test_silent_machine_times_out() {
    let file = fixture(2048);
    let (host, mut machine) = PacketLink::pair();
    let dispatcher = Dispatcher::new(host, Duration::from_secs(5));
    tokio::spawn(async move {
        let start = machine.inbound.recv().await.unwrap();
        machine.outbound.send(start.ack(vec![0])).await.unwrap();
        // Never pulls a chunk.
        let _keep_open = machine;
        std::future::pending::<()>().await;
    });

    let err = upload_file(&dispatcher, file.path(), "idle.gcode", settings(), None)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_disposing_the_dispatcher_ends_a_running_upload() {
    let file = fixture(4096);
    let (host, mut machine) = PacketLink::pair();
    let dispatcher = Dispatcher::new(host, Duration::from_secs(5));
    tokio::spawn(async move {
        let start = machine.inbound.recv().await.unwrap();
        machine.outbound.send(start.ack(vec![0])).await.unwrap();
        let _keep_open = machine;
        std::future::pending::<()>().await;
    });
    let teardown = dispatcher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        teardown.dispose();
    });

    let long_idle = UploadSettings {
        chunk_size: 1024,
        idle_timeout: Duration::from_secs(30),
    };
    let started = tokio::time::Instant::now();
    let err = upload_file(&dispatcher, file.path(), "part.gcode", long_idle, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Channel(ChannelError::Closed)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!dispatcher.has_handler(opcodes::FILE_CHUNK_REQUEST));
}

#[tokio::test(start_paused = true)]
async fn test_lost_transport_ends_a_running_upload() {
    let file = fixture(4096);
    let (host, mut machine) = PacketLink::pair();
    let dispatcher = Dispatcher::new(host, Duration::from_secs(5));
    tokio::spawn(async move {
        let start = machine.inbound.recv().await.unwrap();
        machine.outbound.send(start.ack(vec![0])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(machine);
    });

    let err = upload_file(&dispatcher, file.path(), "part.gcode", settings(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Channel(ChannelError::Closed)), "{:?}", err);
}
