//! Pull-based SACP file upload
//!
//! The host announces the file (`B0/00`), then serves whatever chunk index
//! the machine asks for (`B0/01`) until the machine reports the outcome
//! (`B0/02`). Success requires a zero result from the machine and that the
//! distinct bytes served add up to the file size.

use super::dispatcher::Dispatcher;
use super::opcodes;
use super::packet::Packet;
use crate::codec::{ByteReader, ByteWriter};
use fablink_core::{ChannelError, ProtocolError, Result, TransferEvent};
use fablink_settings::TransferSettings;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// Receives transfer progress
pub type ProgressCallback = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// Chunking parameters of one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Silence after which the upload fails
    pub idle_timeout: Duration,
}

impl UploadSettings {
    /// Regular uploads (1 KiB chunks by default)
    pub fn regular(settings: &TransferSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
        }
    }

    /// Firmware images and big files (60 KiB chunks by default)
    pub fn large(settings: &TransferSettings) -> Self {
        Self {
            chunk_size: settings.large_chunk_size,
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
        }
    }

    /// Pick by file size
    pub fn for_size(settings: &TransferSettings, file_size: u64) -> Self {
        if file_size > settings.large_file_threshold {
            Self::large(settings)
        } else {
            Self::regular(settings)
        }
    }
}

/// State of one upload
#[derive(Debug)]
pub struct TransferSession {
    /// Source file on disk
    pub file_path: PathBuf,
    /// Name the machine stores the file under
    pub target_filename: String,
    /// Number of chunks announced
    pub total_chunks: u16,
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Distinct bytes served so far
    pub bytes_transferred: u64,
    /// Hex MD5 of the whole file
    pub md5: String,
    content: Vec<u8>,
    served: HashSet<u16>,
}

impl TransferSession {
    /// Read and hash the file
    pub async fn open(path: &Path, target_filename: &str, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ProtocolError::Malformed {
                reason: "chunk size must be positive".to_string(),
            }
            .into());
        }
        let content = tokio::fs::read(path).await?;
        Self::from_bytes(path, target_filename, chunk_size, content)
    }

    fn from_bytes(
        path: &Path,
        target_filename: &str,
        chunk_size: usize,
        content: Vec<u8>,
    ) -> Result<Self> {
        let chunks = content.len().div_ceil(chunk_size);
        let total_chunks = u16::try_from(chunks).map_err(|_| ProtocolError::FieldOverflow {
            field: "chunk_count",
            len: chunks,
        })?;
        if u32::try_from(content.len()).is_err() {
            return Err(ProtocolError::FieldOverflow {
                field: "file_length",
                len: content.len(),
            }
            .into());
        }

        Ok(Self {
            file_path: path.to_path_buf(),
            target_filename: target_filename.to_string(),
            total_chunks,
            chunk_size,
            bytes_transferred: 0,
            md5: hex::encode(Md5::digest(&content)),
            content,
            served: HashSet::new(),
        })
    }

    /// File size in bytes
    pub fn file_size(&self) -> u64 {
        self.content.len() as u64
    }

    /// Bytes of chunk `index`, if it exists
    pub fn chunk(&self, index: u16) -> Option<&[u8]> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.content.len());
        Some(&self.content[start..end])
    }

    /// Whether every byte of the file was served at least once
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.file_size()
    }

    /// `B0/00` body `[filename, length u32, chunk_count u16, md5]`
    pub fn start_payload(&self) -> Result<Vec<u8>> {
        Ok(ByteWriter::new()
            .string(&self.target_filename)?
            .u32(self.content.len() as u32)
            .u16(self.total_chunks)
            .string(&self.md5)?
            .finish())
    }

    /// Answer a `B0/01` chunk request
    fn serve_chunk(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut reader = ByteReader::new(payload);
        let (md5, index) = match (reader.string(), reader.u16()) {
            (Ok(md5), Ok(index)) => (md5, index),
            _ => {
                tracing::warn!("Malformed chunk request");
                return vec![opcodes::RESULT_BAD_CHUNK];
            }
        };

        let chunk = if md5 == self.md5 {
            self.chunk(index).map(<[u8]>::to_vec)
        } else {
            None
        };
        let (result, bytes) = match chunk {
            Some(bytes) => {
                if self.served.insert(index) {
                    self.bytes_transferred += bytes.len() as u64;
                }
                (0, bytes)
            }
            None => {
                tracing::warn!("Machine requested unknown chunk {} of {}", index, md5);
                (opcodes::RESULT_BAD_CHUNK, Vec::new())
            }
        };

        let reply = ByteWriter::new()
            .u8(result)
            .string(&md5)
            .map(|w| w.u16(index))
            .and_then(|w| w.blob(&bytes));
        match reply {
            Ok(writer) => writer.finish(),
            Err(e) => {
                tracing::warn!("Could not encode chunk {}: {}", index, e);
                vec![opcodes::RESULT_BAD_CHUNK]
            }
        }
    }
}

/// Hex MD5 of a file, as announced in the upload start request
pub async fn file_md5(path: &Path) -> Result<String> {
    let content = tokio::fs::read(path).await?;
    Ok(hex::encode(Md5::digest(&content)))
}

/// Unregisters the upload handlers however the upload ends
struct HandlerGuard<'a>(&'a Dispatcher);

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.0.remove_handler(opcodes::FILE_CHUNK_REQUEST);
        self.0.remove_handler(opcodes::FILE_UPLOAD_FINISHED);
    }
}

enum Outcome {
    Finished(u8),
    IdleTimeout,
    Closed,
}

/// Upload `path` as `target_filename` and wait for the machine's verdict
///
/// Returns the number of bytes transferred. Exactly one of
/// `TransferEvent::Completed` / `TransferEvent::Failed` is reported after
/// `Started`, unless the start request itself is refused.
pub async fn upload_file(
    dispatcher: &Dispatcher,
    path: &Path,
    target_filename: &str,
    settings: UploadSettings,
    progress: Option<ProgressCallback>,
) -> Result<u64> {
    if dispatcher.has_handler(opcodes::FILE_CHUNK_REQUEST) {
        return Err(ChannelError::Rejected {
            reason: "another upload is in progress".to_string(),
        }
        .into());
    }

    let session = TransferSession::open(path, target_filename, settings.chunk_size).await?;
    let total = session.file_size();
    let start_payload = session.start_payload()?;
    tracing::info!(
        "Uploading {} as {} ({} bytes, {} chunks of {}, md5 {})",
        path.display(),
        target_filename,
        total,
        session.total_chunks,
        session.chunk_size,
        session.md5
    );

    let session = Arc::new(Mutex::new(session));
    let activity = Arc::new(Notify::new());
    let (outcome_tx, outcome_rx) = oneshot::channel::<u8>();

    {
        let session = session.clone();
        let activity = activity.clone();
        let progress = progress.clone();
        let file = target_filename.to_string();
        dispatcher.set_handler(
            opcodes::FILE_CHUNK_REQUEST,
            Arc::new(move |packet: &Packet| {
                let (reply, done) = {
                    let mut session = session.lock();
                    let reply = session.serve_chunk(&packet.payload);
                    (reply, session.bytes_transferred)
                };
                activity.notify_one();
                if let Some(progress) = &progress {
                    progress(TransferEvent::Progress {
                        file: file.clone(),
                        bytes_transferred: done,
                        total_bytes: total,
                    });
                }
                reply
            }),
        );
    }
    {
        let md5 = session.lock().md5.clone();
        // Owned by the handler only, so clearing the handlers closes the receiver.
        let outcome_tx = Mutex::new(Some(outcome_tx));
        dispatcher.set_handler(
            opcodes::FILE_UPLOAD_FINISHED,
            Arc::new(move |packet: &Packet| {
                let mut reader = ByteReader::new(&packet.payload);
                match (reader.string(), reader.u8()) {
                    (Ok(reported), Ok(result)) if reported == md5 => {
                        if let Some(tx) = outcome_tx.lock().take() {
                            let _ = tx.send(result);
                        }
                        vec![0]
                    }
                    _ => vec![opcodes::RESULT_BAD_CHUNK],
                }
            }),
        );
    }

    let handlers = HandlerGuard(dispatcher);

    if let Err(e) = dispatcher.call(opcodes::FILE_UPLOAD_START, start_payload).await {
        drop(handlers);
        tracing::warn!("Upload of {} refused: {}", target_filename, e);
        return Err(e);
    }
    if let Some(progress) = &progress {
        progress(TransferEvent::Started {
            file: target_filename.to_string(),
            total_bytes: total,
        });
    }

    let disposed = dispatcher.disposed();
    let transport_closed = dispatcher.transport_closed();
    let mut outcome_rx = outcome_rx;
    let outcome = loop {
        tokio::select! {
            biased;
            // A verdict delivered just before the link dropped still counts.
            result = &mut outcome_rx => {
                break match result {
                    Ok(code) => Outcome::Finished(code),
                    Err(_) => Outcome::Closed,
                };
            }
            _ = disposed.cancelled() => break Outcome::Closed,
            _ = transport_closed.cancelled() => break Outcome::Closed,
            _ = activity.notified() => continue,
            _ = tokio::time::sleep(settings.idle_timeout) => break Outcome::IdleTimeout,
        }
    };
    drop(handlers);

    let transferred = session.lock().bytes_transferred;
    let result: Result<u64> = match outcome {
        Outcome::Finished(0) if transferred == total => Ok(transferred),
        Outcome::Finished(0) => Err(ChannelError::Integrity {
            file: target_filename.to_string(),
            expected: total,
            actual: transferred,
        }
        .into()),
        Outcome::Finished(code) => Err(ChannelError::Rejected {
            reason: format!("machine reported upload result {}", code),
        }
        .into()),
        Outcome::IdleTimeout => Err(ChannelError::Timeout {
            timeout_ms: settings.idle_timeout.as_millis() as u64,
        }
        .into()),
        Outcome::Closed => Err(ChannelError::Closed.into()),
    };

    match &result {
        Ok(bytes) => tracing::info!("Uploaded {} ({} bytes)", target_filename, bytes),
        Err(e) => tracing::error!("Upload of {} failed: {}", target_filename, e),
    }
    if let Some(progress) = &progress {
        progress(match &result {
            Ok(_) => TransferEvent::Completed {
                file: target_filename.to_string(),
            },
            Err(e) => TransferEvent::Failed {
                file: target_filename.to_string(),
                error: e.to_string(),
            },
        });
    }
    result
}

/// [`upload_file`] with the large chunk size
pub async fn upload_large_file(
    dispatcher: &Dispatcher,
    path: &Path,
    target_filename: &str,
    settings: &TransferSettings,
    progress: Option<ProgressCallback>,
) -> Result<u64> {
    upload_file(
        dispatcher,
        path,
        target_filename,
        UploadSettings::large(settings),
        progress,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(content: &[u8], chunk_size: usize) -> TransferSession {
        TransferSession::from_bytes(Path::new("job.gcode"), "job.gcode", chunk_size, content.to_vec())
            .unwrap()
    }

    fn chunk_request(md5: &str, index: u16) -> Vec<u8> {
        ByteWriter::new().string(md5).unwrap().u16(index).finish()
    }

    #[test]
    fn test_chunking() {
        let s = session(&[1u8; 2500], 1024);
        assert_eq!(s.total_chunks, 3);
        assert_eq!(s.chunk(2).unwrap().len(), 452);
        assert!(s.chunk(3).is_none());
        assert_eq!(s.md5.len(), 32);
    }

    #[test]
    fn test_repeat_requests_count_once() {
        let mut s = session(&[7u8; 2048], 1024);
        let md5 = s.md5.clone();
        s.serve_chunk(&chunk_request(&md5, 0));
        s.serve_chunk(&chunk_request(&md5, 0));
        assert_eq!(s.bytes_transferred, 1024);
        assert!(!s.is_complete());
        s.serve_chunk(&chunk_request(&md5, 1));
        assert!(s.is_complete());
    }

    #[test]
    fn test_bad_index_and_md5() {
        let mut s = session(b"G28\n", 1024);
        let md5 = s.md5.clone();

        let reply = s.serve_chunk(&chunk_request(&md5, 5));
        assert_eq!(reply[0], opcodes::RESULT_BAD_CHUNK);

        let reply = s.serve_chunk(&chunk_request("deadbeef", 0));
        assert_eq!(reply[0], opcodes::RESULT_BAD_CHUNK);
        assert_eq!(s.bytes_transferred, 0);

        let reply = s.serve_chunk(&chunk_request(&md5, 0));
        let mut reader = ByteReader::new(&reply);
        assert_eq!(reader.u8().unwrap(), 0);
        assert_eq!(reader.string().unwrap(), md5);
        assert_eq!(reader.u16().unwrap(), 0);
        assert_eq!(reader.blob().unwrap(), b"G28\n");
    }

    #[test]
    fn test_size_selection() {
        let settings = TransferSettings::default();
        assert_eq!(UploadSettings::for_size(&settings, 5_000).chunk_size, 1024);
        assert_eq!(
            UploadSettings::for_size(&settings, 11 * 1024 * 1024).chunk_size,
            60 * 1024
        );
    }
}
