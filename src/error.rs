//! Error types for procpool.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all procpool operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame exceeded the configured maximum size (read or write side).
    #[error("frame size {size} exceeds max frame size {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// An enhanced frame did not start with the `0x50 0x59` magic bytes.
    #[error("invalid magic bytes: {0:02x}{1:02x}")]
    BadMagic(u8, u8),

    /// An enhanced frame header declared an impossible length.
    #[error("invalid frame length: {declared}")]
    BadLength { declared: u32 },

    /// CRC32C verification of an enhanced frame payload failed.
    #[error("crc32c mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// I/O error during socket operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack serialization error.
    #[error("msgpack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error.
    #[error("msgpack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// A call exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the call.
    #[error("call cancelled: {0}")]
    Cancelled(String),

    /// The worker answered with `ok = false`; carries the worker's message.
    #[error("worker error: {0}")]
    Remote(String),

    /// Spawning a worker or waiting for its socket failed.
    #[error("worker start failed: {0}")]
    WorkerStart(String),

    /// Stopping one or more workers failed.
    #[error("worker stop failed: {0}")]
    WorkerStop(String),

    /// Every worker was unhealthy at dispatch time.
    #[error("no healthy workers available")]
    NoHealthyWorker,

    /// The pool is shutting down and rejects new calls.
    #[error("pool is shut down")]
    Shutdown,

    /// The underlying connection failed or was closed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for framing-level errors that poison the connection they
    /// occurred on.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Error::FrameTooLarge { .. }
                | Error::BadMagic(_, _)
                | Error::BadLength { .. }
                | Error::ChecksumMismatch { .. }
        )
    }

    /// True when the error came from the remote worker rather than the
    /// transport or the pool.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_))
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
