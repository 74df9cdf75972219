//! Dialing worker sockets.
//!
//! Two entry points: [`dial`] for a single bounded connection attempt
//! (transports, connection pool) and [`dial_with_retry`] for the
//! supervisor's socket-readiness polling after spawn.

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;

use crate::context::CallContext;
use crate::error::{Error, Result};

/// Cadence of readiness polling while waiting for a worker to bind.
pub(crate) const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Dial a worker socket once, bounded by `timeout`.
pub async fn dial(path: &Path, timeout: Duration) -> Result<UnixStream> {
    match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Connection(format!(
            "failed to connect to {}: {e}",
            path.display()
        ))),
        Err(_) => Err(Error::Connection(format!(
            "failed to connect to {} after {timeout:?}",
            path.display()
        ))),
    }
}

/// Dial a worker socket, retrying every 100 ms until it accepts, the
/// timeout elapses, or the caller's context is done.
pub async fn dial_with_retry(
    path: &Path,
    timeout: Duration,
    ctx: &CallContext,
) -> Result<UnixStream> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(stream) = UnixStream::connect(path).await {
            return Ok(stream);
        }

        if tokio::time::Instant::now() + READY_POLL_INTERVAL >= deadline {
            return Err(Error::Connection(format!(
                "failed to connect to {} after {timeout:?}",
                path.display()
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            err = ctx.done() => return Err(err),
        }
    }
}
