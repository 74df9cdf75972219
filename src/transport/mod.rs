//! Transport module - the request/response connection abstraction.
//!
//! A transport owns one connection to one worker and turns
//! [`Request`]s into [`Response`]s:
//!
//! - [`SerialTransport`] - one call at a time under a mutex, classic
//!   framing. The common path when a per-worker connection pool provides
//!   concurrency.
//! - [`MultiplexedTransport`] - one connection shared by arbitrarily many
//!   concurrent calls, enhanced framing with request-id matching.
//!
//! Both implement the [`Transport`] capability so callers and future
//! adapters stay representation-agnostic.

mod multiplexed;
mod serial;

pub use multiplexed::MultiplexedTransport;
pub use serial::SerialTransport;

use std::time::Duration;

use async_trait::async_trait;

use crate::codec::CodecKind;
use crate::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_SIZE};
use crate::context::CallContext;
use crate::error::Result;
use crate::protocol::{Request, Response};

/// Default per-call deadline when the caller's context has none.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Options shared by both transport variants.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Timeout for the initial dial.
    pub connect_timeout: Duration,
    /// Per-call deadline applied when the context carries none
    /// (multiplexed transport only).
    pub call_timeout: Duration,
    /// Maximum frame size, enforced both directions.
    pub max_frame_size: usize,
    /// Payload codec; must match the worker's configuration.
    pub codec: CodecKind,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            codec: CodecKind::Json,
        }
    }
}

/// Capability set of a connection to a worker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response. The request id may be
    /// reassigned by the transport.
    async fn call(&self, ctx: &CallContext, req: Request) -> Result<Response>;

    /// Close the connection. In-flight calls fail with a connection
    /// error; later calls are rejected.
    async fn close(&self) -> Result<()>;

    /// Whether the transport can currently carry calls.
    fn is_healthy(&self) -> bool;
}
