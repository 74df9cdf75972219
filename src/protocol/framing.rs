//! Length-prefixed framing over an async byte stream.
//!
//! Two modes share one [`Framer`]:
//!
//! - *Classic*: `[length:4 BE][payload]` where `length` counts payload
//!   bytes only. Used by the serial call path.
//! - *Enhanced*: the 18-byte header of [`Frame`](super::Frame) with
//!   request id and CRC32C. Used by the multiplexed transport.
//!
//! The configured maximum frame size is enforced on both read and write;
//! exceeding it fails before touching the stream on the write side. A
//! reader that hits a framing error must treat the connection as
//! poisoned: the stream position is undefined afterwards.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::{Frame, FrameHeader, FRAME_HEADER_SIZE, MAGIC};
use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{Error, Result};

/// A frame read by [`Framer::read_any`], which accepts both modes on one
/// connection by sniffing the magic bytes.
#[derive(Debug)]
pub enum InboundFrame {
    /// Classic length-prefixed payload.
    Classic(Bytes),
    /// Enhanced frame with request id and verified checksum.
    Enhanced(Frame),
}

/// Reads and writes frames over a stream.
#[derive(Debug)]
pub struct Framer<S> {
    stream: S,
    max_frame_size: usize,
}

impl<S> Framer<S> {
    /// Wrap a stream with the default 10 MiB frame limit.
    pub fn new(stream: S) -> Self {
        Self::with_max_size(stream, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Wrap a stream with a specific frame limit.
    pub fn with_max_size(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            max_frame_size,
        }
    }

    /// The configured maximum payload size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Consume the framer, returning the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: AsyncWrite + Unpin> Framer<S> {
    /// Write a classic frame: 4-byte big-endian length then payload.
    pub async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }

        self.stream.write_u32(data.len() as u32).await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write an enhanced frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.payload.len() > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: frame.payload.len(),
                max: self.max_frame_size,
            });
        }

        self.stream.write_all(&frame.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> Framer<S> {
    /// Read a classic frame. `Ok(None)` means the peer closed the
    /// connection cleanly before the next frame.
    pub async fn read_message(&mut self) -> Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];
        if !self.read_or_eof(&mut len_buf).await? {
            return Ok(None);
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        self.read_classic_payload(len).await.map(Some)
    }

    /// Read an enhanced frame. `Ok(None)` means clean connection close.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut magic = [0u8; 2];
        if !self.read_or_eof(&mut magic).await? {
            return Ok(None);
        }
        if magic != MAGIC {
            return Err(Error::BadMagic(magic[0], magic[1]));
        }

        self.read_enhanced_after_magic().await.map(Some)
    }

    /// Read the next frame in whichever mode the peer speaks, deciding by
    /// the first two bytes. Classic lengths below the frame limit can
    /// never start with `0x50 0x59`, so the sniff is unambiguous.
    pub async fn read_any(&mut self) -> Result<Option<InboundFrame>> {
        let mut head = [0u8; 2];
        if !self.read_or_eof(&mut head).await? {
            return Ok(None);
        }

        if head == MAGIC {
            return self
                .read_enhanced_after_magic()
                .await
                .map(|f| Some(InboundFrame::Enhanced(f)));
        }

        let mut rest = [0u8; 2];
        self.stream.read_exact(&mut rest).await?;
        let len = u32::from_be_bytes([head[0], head[1], rest[0], rest[1]]) as usize;
        self.read_classic_payload(len)
            .await
            .map(|b| Some(InboundFrame::Classic(b)))
    }

    async fn read_classic_payload(&mut self, len: usize) -> Result<Bytes> {
        if len > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }

    async fn read_enhanced_after_magic(&mut self) -> Result<Frame> {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE - 2];
        self.stream.read_exact(&mut header_buf).await?;
        let header = FrameHeader::decode_after_magic(&header_buf)
            .expect("buffer is exactly header-sized");

        let total = header.length as usize;
        if total < FRAME_HEADER_SIZE {
            return Err(Error::BadLength {
                declared: header.length,
            });
        }
        if total > self.max_frame_size + FRAME_HEADER_SIZE {
            return Err(Error::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }

        let mut payload = vec![0u8; total - FRAME_HEADER_SIZE];
        if !payload.is_empty() {
            self.stream.read_exact(&mut payload).await?;
        }

        let payload = Bytes::from(payload);
        let computed = crc32c::crc32c(&payload);
        if computed != header.crc32c {
            return Err(Error::ChecksumMismatch {
                expected: header.crc32c,
                computed,
            });
        }

        Ok(Frame { header, payload })
    }

    /// Fill `buf`, distinguishing clean EOF before the first byte
    /// (`Ok(false)`) from EOF mid-buffer (an error).
    async fn read_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )));
            }
            filled += n;
        }
        Ok(true)
    }
}
