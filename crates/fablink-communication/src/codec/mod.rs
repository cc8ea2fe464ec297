//! Binary codec primitives
//!
//! Little-endian fixed-width integers and floats, `u16`-length-prefixed
//! UTF-8 strings and byte blobs. Every SACP payload is built with
//! [`ByteWriter`] and parsed with [`ByteReader`].

use fablink_core::ProtocolError;

/// Append-only payload builder
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a single byte
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    /// Write a little-endian u16
    pub fn u16(mut self, value: u16) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a little-endian u32
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a little-endian i32
    pub fn i32(mut self, value: i32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a little-endian IEEE-754 f32
    pub fn f32(mut self, value: f32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a `u16` length followed by the UTF-8 bytes
    pub fn string(self, value: &str) -> Result<Self, ProtocolError> {
        self.blob(value.as_bytes()).map_err(|_| ProtocolError::FieldOverflow {
            field: "string",
            len: value.len(),
        })
    }

    /// Write a `u16` length followed by the raw bytes
    pub fn blob(mut self, value: &[u8]) -> Result<Self, ProtocolError> {
        let len = u16::try_from(value.len()).map_err(|_| ProtocolError::FieldOverflow {
            field: "blob",
            len: value.len(),
        })?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(value);
        Ok(self)
    }

    /// Append bytes without a length prefix
    pub fn raw(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Finish and take the bytes
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received payload
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Start reading at offset 0
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < needed {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a single byte
    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian u16
    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.array().map(u16::from_le_bytes)
    }

    /// Read a little-endian u32
    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.array().map(u32::from_le_bytes)
    }

    /// Read a little-endian i32
    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.array().map(i32::from_le_bytes)
    }

    /// Read a little-endian f32
    pub fn f32(&mut self) -> Result<f32, ProtocolError> {
        self.array().map(f32::from_le_bytes)
    }

    /// Read a `u16`-length-prefixed UTF-8 string
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let offset = self.pos;
        let bytes = self.blob()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidString { offset })
    }

    /// Read a `u16`-length-prefixed byte blob
    pub fn blob(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    /// Everything left in the buffer
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}
