//! Enhanced frame with request id and CRC32C checksum.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! ┌───────┬────────┬────────────┬────────┬─────────┐
//! │ Magic │ Length │ Request ID │ CRC32C │ Payload │
//! │ 2 B   │ 4 B    │ 8 B        │ 4 B    │ N B     │
//! └───────┴────────┴────────────┴────────┴─────────┘
//! ```
//!
//! `Length` is the **total** frame length including the 18-byte header.
//! The checksum uses the Castagnoli polynomial and covers the payload
//! only. Magic is `0x50 0x59` ("PY").

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Enhanced frame header size: 2 (magic) + 4 (length) + 8 (request id) +
/// 4 (crc32c).
pub const FRAME_HEADER_SIZE: usize = 18;

/// Magic bytes identifying an enhanced frame.
pub const MAGIC: [u8; 2] = [0x50, 0x59];

/// Decoded enhanced frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length including the header.
    pub length: u32,
    /// Request id for multiplexing.
    pub request_id: u64,
    /// CRC32C (Castagnoli) of the payload.
    pub crc32c: u32,
}

impl FrameHeader {
    /// Decode the 16 bytes that follow the magic.
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode_after_magic(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE - 2 {
            return None;
        }
        Some(Self {
            length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            request_id: u64::from_be_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            crc32c: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// A complete enhanced frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame for `payload`, computing length and checksum.
    pub fn new(request_id: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader {
                length: (FRAME_HEADER_SIZE + payload.len()) as u32,
                request_id,
                crc32c: crc32c::crc32c(&payload),
            },
            payload,
        }
    }

    /// The request id carried in the header.
    #[inline]
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Serialize the frame to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.length as usize);
        buf.put_slice(&MAGIC);
        buf.put_u32(self.header.length);
        buf.put_u64(self.header.request_id);
        buf.put_u32(self.header.crc32c);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize a frame from a complete buffer, validating magic,
    /// length, and checksum.
    pub fn decode(data: &[u8]) -> Result<Frame> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::BadLength {
                declared: data.len() as u32,
            });
        }
        if data[0..2] != MAGIC {
            return Err(Error::BadMagic(data[0], data[1]));
        }

        let header = FrameHeader::decode_after_magic(&data[2..])
            .expect("length checked above");

        if header.length as usize != data.len() {
            return Err(Error::BadLength {
                declared: header.length,
            });
        }

        let payload = Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..]);
        let computed = crc32c::crc32c(&payload);
        if computed != header.crc32c {
            return Err(Error::ChecksumMismatch {
                expected: header.crc32c,
                computed,
            });
        }

        Ok(Frame { header, payload })
    }

    /// Recompute the checksum against the payload.
    pub fn verify_checksum(&self) -> bool {
        crc32c::crc32c(&self.payload) == self.header.crc32c
    }
}
