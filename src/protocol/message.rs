//! Wire message types: request, response, cancellation, and the outer
//! envelope.
//!
//! Bodies are carried as [`serde_json::Value`] so both codecs transport
//! the same logical fields; for the JSON codec the wire bytes are exactly
//! the documented shapes:
//!
//! ```text
//! request:      {"id": 1, "method": "echo", "body": {...}}
//! response ok:  {"id": 1, "ok": true, "body": {...}}
//! response err: {"id": 1, "ok": false, "error": "..."}
//! cancellation: {"id": 1, "reason": "context cancelled"}
//! envelope:     {"type": "request", "payload": {...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A request from the driver to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Unique per connection (serial) or per multiplexed session.
    pub id: u64,
    /// Name of the user-registered function.
    pub method: String,
    /// Opaque body; producing and consuming it is the codec's business.
    #[serde(default)]
    pub body: Value,
}

impl Request {
    /// Create a request with an already-encoded body value.
    pub fn new(id: u64, method: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            method: method.into(),
            body,
        }
    }

    /// Create a request by serializing `input` into the body.
    pub fn from_input<T: Serialize>(id: u64, method: impl Into<String>, input: &T) -> Result<Self> {
        Ok(Self::new(id, method, serde_json::to_value(input)?))
    }

    /// Deserialize the body into a concrete type.
    pub fn parse_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// A response from a worker, mirroring the request id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: u64,
    /// True for success; false routes `error` to the caller.
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    #[serde(default, rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl Response {
    /// A successful response carrying `body`.
    pub fn success(id: u64, body: Value) -> Self {
        Self {
            id,
            ok: true,
            body,
            error_msg: None,
        }
    }

    /// An error response carrying the worker's message.
    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            body: Value::Null,
            error_msg: Some(message.into()),
        }
    }

    /// Convert into the body value, surfacing `ok = false` as
    /// [`Error::Remote`].
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.body)
        } else {
            Err(Error::Remote(
                self.error_msg.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    /// Deserialize the body into a concrete type.
    pub fn parse_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// A cancellation signal for an in-flight request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cancellation {
    /// Request id to cancel.
    pub id: u64,
    /// Why the caller gave up ("context cancelled", "timeout", ...).
    pub reason: String,
}

impl Cancellation {
    pub fn new(id: u64, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

/// Outer envelope distinguishing request traffic from control traffic on
/// one stream. Required on the multiplexed transport; optional on the
/// serial transport, whose requests may travel bare.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Cancellation(Cancellation),
}
