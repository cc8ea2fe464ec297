//! SACP: binary, opcode-addressed control protocol
//!
//! - [`packet`]: frame layout, CRC-8 and checksum, incremental decoder
//! - [`opcodes`]: command table
//! - [`messages`]: typed payloads
//! - [`dispatcher`]: request/response correlation, subscriptions, handlers
//! - [`file_transfer`]: pull-based chunked upload

pub mod dispatcher;
pub mod file_transfer;
pub mod messages;
pub mod opcodes;
pub mod packet;

pub use dispatcher::{
    Dispatcher, PacketLink, RequestHandler, SubscriptionCallback, SubscriptionHandle,
};
pub use file_transfer::{
    file_md5, upload_file, upload_large_file, ProgressCallback, TransferSession, UploadSettings,
};
pub use packet::{Attribute, CommandId, FrameDecoder, Packet, PeerId, SacpResponse};
