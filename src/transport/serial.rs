//! Serial transport: one connection, one call at a time.
//!
//! `call` writes one classic frame and reads the next one under a single
//! mutex, so request/response pairs are FIFO on the connection. Request
//! ids are still assigned but are not needed for matching. Concurrency
//! comes from pooling several serial connections per worker, not from
//! sharing one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use super::{Transport, TransportOptions};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::protocol::{Framer, Request, Response};
use crate::worker::connect;

/// Transport over a single Unix socket connection, serialized by a mutex.
pub struct SerialTransport {
    path: PathBuf,
    options: TransportOptions,
    inner: Mutex<Option<Framer<UnixStream>>>,
    next_id: AtomicU64,
    healthy: AtomicBool,
    closed: AtomicBool,
}

impl SerialTransport {
    /// Dial `path` and wrap the connection.
    pub async fn connect(path: impl AsRef<Path>, options: TransportOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = connect::dial(&path, options.connect_timeout).await?;
        tracing::debug!(socket = %path.display(), "serial transport connected");

        Ok(Self {
            inner: Mutex::new(Some(Framer::with_max_size(stream, options.max_frame_size))),
            path,
            options,
            next_id: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    /// Send a zero-argument `health` request and discard the response.
    /// Useful for probing an idle connection.
    pub async fn probe(&self) -> Result<()> {
        let req = Request::new(0, "health", serde_json::Value::Null);
        let ctx = CallContext::with_timeout(std::time::Duration::from_secs(1));
        self.call(&ctx, req).await.map(|_| ())
    }

    fn poison(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn call(&self, ctx: &CallContext, mut req: Request) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("transport is closed".to_string()));
        }
        if ctx.is_done() {
            return Err(ctx.error());
        }

        req.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let data = self.options.codec.marshal(&req)?;

        let mut guard = self.inner.lock().await;
        let framer = guard
            .as_mut()
            .ok_or_else(|| Error::Connection("transport is closed".to_string()))?;

        if let Err(e) = framer.write_message(&data).await {
            self.poison();
            return Err(e);
        }

        let read = tokio::select! {
            res = framer.read_message() => res,
            err = ctx.done() => {
                // The response may still arrive later; the stream position
                // is now unknown, so the connection cannot be reused.
                self.poison();
                return Err(err);
            }
        };

        let payload = match read {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.poison();
                return Err(Error::Connection(
                    "connection closed by worker".to_string(),
                ));
            }
            Err(e) => {
                self.poison();
                return Err(e);
            }
        };

        let resp: Response = self.options.codec.unmarshal(&payload)?;
        Ok(resp)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.healthy.store(false, Ordering::Release);

        if let Some(framer) = self.inner.lock().await.take() {
            let mut stream = framer.into_inner();
            let _ = stream.shutdown().await;
            tracing::debug!(socket = %self.path.display(), "serial transport closed");
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.healthy.load(Ordering::Acquire)
    }
}
