//! Protocol module - framing and wire messages.
//!
//! Layers, bottom up:
//!
//! - [`Frame`] / [`FrameHeader`] - the enhanced on-wire unit with request
//!   id and CRC32C checksum
//! - [`Framer`] - reads/writes classic and enhanced frames over an async
//!   stream with a size limit
//! - [`Request`], [`Response`], [`Cancellation`], [`Message`] - the
//!   payload layer parsed by the codec, never by the framer

mod frame;
mod framing;
mod message;

pub use frame::{Frame, FrameHeader, FRAME_HEADER_SIZE, MAGIC};
pub use framing::{Framer, InboundFrame};
pub use message::{Cancellation, Message, Request, Response};
