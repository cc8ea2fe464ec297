//! SACP frame encoding and decoding
//!
//! ```text
//! offset size field
//! 0      2    magic AA 55
//! 2      2    length (u16 LE) = total - 7
//! 4      1    version (0x01)
//! 5      1    receiver id
//! 6      1    CRC-8 over bytes 0..6
//! 7      1    sender id
//! 8      1    attribute (0 request, 1 ack)
//! 9      2    sequence (u16 LE)
//! 11     1    command set
//! 12     1    command id
//! 13     n    payload
//! 13+n   2    checksum (u16 LE) over bytes 7..13+n
//! ```

use fablink_core::ProtocolError;
use std::fmt;

const MAGIC: [u8; 2] = [0xAA, 0x55];
const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 13;
const MIN_FRAME_LEN: usize = HEADER_LEN + 2;
/// Largest payload whose frame length still fits the u16 length field
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize + 7 - MIN_FRAME_LEN;

/// Logical SACP endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerId {
    /// This application
    Host,
    /// Main motion controller
    Controller,
    /// Touch screen module
    Screen,
    /// Unrecognised endpoint id
    Other(u8),
}

impl PeerId {
    /// Wire value
    pub fn as_u8(self) -> u8 {
        match self {
            PeerId::Host => 0,
            PeerId::Controller => 1,
            PeerId::Screen => 2,
            PeerId::Other(id) => id,
        }
    }
}

impl From<u8> for PeerId {
    fn from(value: u8) -> Self {
        match value {
            0 => PeerId::Host,
            1 => PeerId::Controller,
            2 => PeerId::Screen,
            other => PeerId::Other(other),
        }
    }
}

/// Request or acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Originating frame
    Request,
    /// Reply carrying the request's sequence number
    Ack,
}

/// Two-byte opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId {
    /// Command set
    pub set: u8,
    /// Command within the set
    pub id: u8,
}

impl CommandId {
    /// Build an opcode
    pub const fn new(set: u8, id: u8) -> Self {
        Self { set, id }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}/{:02X}", self.set, self.id)
    }
}

/// One decoded SACP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Request or ack
    pub attribute: Attribute,
    /// Destination
    pub receiver: PeerId,
    /// Origin
    pub sender: PeerId,
    /// Correlation number
    pub sequence: u16,
    /// Opcode
    pub command: CommandId,
    /// Opcode-specific body
    pub payload: Vec<u8>,
}

impl Packet {
    /// Host-originated request
    pub fn request(command: CommandId, receiver: PeerId, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            attribute: Attribute::Request,
            receiver,
            sender: PeerId::Host,
            sequence,
            command,
            payload,
        }
    }

    /// Ack answering `self`, addressed back to its sender
    pub fn ack(&self, payload: Vec<u8>) -> Self {
        Self {
            attribute: Attribute::Ack,
            receiver: self.sender,
            sender: self.receiver,
            sequence: self.sequence,
            command: self.command,
            payload,
        }
    }

    /// Serialize to a complete frame
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::FieldOverflow {
                field: "payload",
                len: self.payload.len(),
            });
        }
        let total = MIN_FRAME_LEN + self.payload.len();
        let length = (total - 7) as u16;

        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&length.to_le_bytes());
        frame.push(VERSION);
        frame.push(self.receiver.as_u8());
        frame.push(crc8(&frame[..6]));
        frame.push(self.sender.as_u8());
        frame.push(match self.attribute {
            Attribute::Request => 0,
            Attribute::Ack => 1,
        });
        frame.extend_from_slice(&self.sequence.to_le_bytes());
        frame.push(self.command.set);
        frame.push(self.command.id);
        frame.extend_from_slice(&self.payload);
        let sum = checksum(&frame[7..]);
        frame.extend_from_slice(&sum.to_le_bytes());
        Ok(frame)
    }

    /// Parse exactly one complete frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(ProtocolError::Truncated {
                offset: 0,
                needed: MIN_FRAME_LEN,
                available: frame.len(),
            });
        }
        if frame[..2] != MAGIC || frame[4] != VERSION {
            return Err(ProtocolError::InvalidHeader);
        }
        let expected_crc = crc8(&frame[..6]);
        if expected_crc != frame[6] {
            return Err(ProtocolError::HeaderCrcMismatch {
                expected: expected_crc,
                actual: frame[6],
            });
        }
        let total = u16::from_le_bytes([frame[2], frame[3]]) as usize + 7;
        if total < MIN_FRAME_LEN || frame.len() < total {
            return Err(ProtocolError::Truncated {
                offset: 0,
                needed: total.max(MIN_FRAME_LEN),
                available: frame.len(),
            });
        }

        let body_end = total - 2;
        let expected_sum = checksum(&frame[7..body_end]);
        let actual_sum = u16::from_le_bytes([frame[body_end], frame[body_end + 1]]);
        if expected_sum != actual_sum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: expected_sum,
                actual: actual_sum,
            });
        }

        let attribute = match frame[8] {
            0 => Attribute::Request,
            1 => Attribute::Ack,
            other => {
                return Err(ProtocolError::Malformed {
                    reason: format!("unknown attribute {:#04x}", other),
                })
            }
        };

        Ok(Self {
            attribute,
            receiver: PeerId::from(frame[5]),
            sender: PeerId::from(frame[7]),
            sequence: u16::from_le_bytes([frame[9], frame[10]]),
            command: CommandId::new(frame[11], frame[12]),
            payload: frame[HEADER_LEN..body_end].to_vec(),
        })
    }
}

/// CRC-8, polynomial 0x07, initial value 0
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// One's-complement sum of big-endian 16-bit words
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last);
    }
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    !(sum as u16)
}

/// Ack payload split into result code and data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SacpResponse {
    /// 0 on success
    pub result: u8,
    /// Opcode-specific data after the result byte
    pub data: Vec<u8>,
}

impl SacpResponse {
    /// Split an ack payload
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.split_first() {
            Some((&result, data)) => Ok(Self {
                result,
                data: data.to_vec(),
            }),
            None => Err(ProtocolError::Malformed {
                reason: "empty ack payload".to_string(),
            }),
        }
    }

    /// Whether the remote reported success
    pub fn is_ok(&self) -> bool {
        self.result == 0
    }

    /// Data on success, `ResultCode` otherwise
    pub fn into_data(self, command: CommandId) -> Result<Vec<u8>, ProtocolError> {
        if self.is_ok() {
            Ok(self.data)
        } else {
            Err(ProtocolError::ResultCode {
                command: command.to_string(),
                code: self.result,
            })
        }
    }
}

/// Incremental frame extractor for byte-stream transports
///
/// Garbage before a magic marker, frames with a bad header CRC and frames
/// with a bad checksum are skipped one byte at a time so the decoder
/// resynchronises on the next valid frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed bytes, returning every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.buffer.extend_from_slice(bytes);
        let mut packets = Vec::new();

        loop {
            match self.buffer.windows(2).position(|w| w == MAGIC) {
                Some(0) => {}
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => {
                    // Keep a trailing 0xAA, it may be the first magic byte.
                    let keep = usize::from(self.buffer.last() == Some(&MAGIC[0]));
                    let drop = self.buffer.len() - keep;
                    self.buffer.drain(..drop);
                    break;
                }
            }

            if self.buffer.len() < 7 {
                break;
            }
            let header_ok = self.buffer[4] == VERSION && crc8(&self.buffer[..6]) == self.buffer[6];
            let total = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize + 7;
            if !header_ok || total < MIN_FRAME_LEN {
                tracing::debug!("Discarding byte with invalid SACP header");
                self.buffer.drain(..1);
                continue;
            }
            if self.buffer.len() < total {
                break;
            }

            match Packet::decode(&self.buffer[..total]) {
                Ok(packet) => {
                    packets.push(packet);
                    self.buffer.drain(..total);
                }
                Err(e) => {
                    tracing::debug!("Discarding SACP frame: {}", e);
                    self.buffer.drain(..1);
                }
            }
        }

        packets
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet::request(CommandId::new(0x01, 0x02), PeerId::Controller, 0x0102, b"G28".to_vec())
    }

    #[test]
    fn test_encode_layout() {
        let frame = sample().encode().unwrap();
        assert_eq!(frame.len(), 15 + 3);
        assert_eq!(&frame[..2], &[0xAA, 0x55]);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]) as usize, frame.len() - 7);
        assert_eq!(frame[4], 0x01);
        assert_eq!(frame[5], 1);
        assert_eq!(frame[6], crc8(&frame[..6]));
        assert_eq!(frame[7], 0);
        assert_eq!(frame[8], 0);
        assert_eq!(&frame[9..11], &[0x02, 0x01]);
        assert_eq!(&frame[11..13], &[0x01, 0x02]);
        assert_eq!(&frame[13..16], b"G28");
    }

    #[test]
    fn test_decode_encoded() {
        let packet = sample();
        assert_eq!(Packet::decode(&packet.encode().unwrap()).unwrap(), packet);
    }

    #[test]
    fn test_crc8_known_value() {
        // CRC-8/SMBUS check value
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0x00, 0x01, 0x02]), !0x0003);
        assert_eq!(checksum(&[0xff, 0xff, 0xff, 0xff]), !0xffff);
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut frame = sample().encode().unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(
            Packet::decode(&frame),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_header_crc_rejected() {
        let mut frame = sample().encode().unwrap();
        frame[6] ^= 0x01;
        assert!(matches!(
            Packet::decode(&frame),
            Err(ProtocolError::HeaderCrcMismatch { .. })
        ));
    }

    #[test]
    fn test_ack_swaps_peers() {
        let request = sample();
        let mut inbound = request.clone();
        inbound.sender = PeerId::Controller;
        inbound.receiver = PeerId::Host;
        let ack = inbound.ack(vec![0]);
        assert_eq!(ack.attribute, Attribute::Ack);
        assert_eq!(ack.receiver, PeerId::Controller);
        assert_eq!(ack.sender, PeerId::Host);
        assert_eq!(ack.sequence, request.sequence);
    }

    #[test]
    fn test_decoder_split_and_garbage() {
        let a = sample().encode().unwrap();
        let b = Packet::request(CommandId::new(0x01, 0xA0), PeerId::Screen, 7, vec![])
            .encode()
            .unwrap();

        let mut stream = vec![0x00, 0xAA, 0x13];
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&[0xAA, 0x55, 0x99]);
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for piece in stream.chunks(5) {
            out.extend(decoder.push(piece));
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload, b"G28");
        assert_eq!(out[1].sequence, 7);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_response_result_code() {
        let response = SacpResponse::from_payload(&[3, 1, 2]).unwrap();
        assert!(!response.is_ok());
        let err = response.into_data(CommandId::new(0xAC, 0x03)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ResultCode {
                command: "AC/03".to_string(),
                code: 3
            }
        );
        assert!(SacpResponse::from_payload(&[]).is_err());
    }
}
