//! Codec module - payload serialization.
//!
//! Two codecs carry the same logical fields over the wire:
//!
//! - [`JsonCodec`] - textual JSON via `serde_json` (default)
//! - [`MsgPackCodec`] - binary MessagePack via `rmp-serde`
//!
//! The driver and the worker must agree on the codec by configuration;
//! there is no in-band negotiation. [`CodecKind`] is the single source of
//! truth for the choice and is carried in
//! [`PoolConfig`](crate::config::PoolConfig).
//!
//! # Example
//!
//! ```
//! use procpool::codec::CodecKind;
//!
//! let codec = CodecKind::Json;
//! let bytes = codec.marshal(&("hello", 42)).unwrap();
//! let decoded: (String, i32) = codec.unmarshal(&bytes).unwrap();
//! assert_eq!(decoded, ("hello".to_string(), 42));
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The configured payload codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Textual JSON (default).
    #[default]
    Json,
    /// Binary MessagePack.
    MsgPack,
}

impl CodecKind {
    /// Stable name used in logs and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            CodecKind::MsgPack => "msgpack",
        }
    }

    /// Serialize a value to bytes.
    pub fn marshal<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Json => JsonCodec::encode(value),
            CodecKind::MsgPack => MsgPackCodec::encode(value),
        }
    }

    /// Deserialize bytes to a value.
    pub fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            CodecKind::Json => JsonCodec::decode(data),
            CodecKind::MsgPack => MsgPackCodec::decode(data),
        }
    }
}
