//! Multiplexed transport: one connection, many concurrent calls.
//!
//! A background reader loop reads enhanced frames and delivers each
//! response to the pending call registered under its request id. The
//! writer assigns monotonically increasing ids. Every pending call is
//! resolved by exactly one of: response delivery, per-call timeout,
//! caller cancellation, or connection loss.
//!
//! Any I/O error in the reader loop is terminal: every outstanding call
//! fails with a connection error and the transport transitions to
//! closed. All traffic travels inside the [`Message`] envelope so
//! responses and control messages share the stream.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportOptions};
use crate::codec::CodecKind;
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::protocol::{Cancellation, Frame, Framer, Message, Request, Response};
use crate::worker::connect;

type PendingMap = StdMutex<HashMap<u64, oneshot::Sender<Result<Response>>>>;

/// Transport multiplexing concurrent calls over one connection.
pub struct MultiplexedTransport {
    path: PathBuf,
    options: TransportOptions,
    writer: Mutex<Framer<OwnedWriteHalf>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MultiplexedTransport {
    /// Dial `path` and start the background reader loop.
    pub async fn connect(path: impl AsRef<Path>, options: TransportOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = connect::dial(&path, options.connect_timeout).await?;
        let (read_half, write_half) = stream.into_split();

        let pending: Arc<PendingMap> = Arc::new(StdMutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            Framer::with_max_size(read_half, options.max_frame_size),
            pending.clone(),
            closed.clone(),
            options.codec,
        ));

        tracing::debug!(socket = %path.display(), "multiplexed transport connected");

        Ok(Self {
            writer: Mutex::new(Framer::with_max_size(write_half, options.max_frame_size)),
            path,
            options,
            pending,
            next_id: AtomicU64::new(0),
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    /// Best-effort cancellation notice for an in-flight id.
    async fn send_cancellation(&self, id: u64, reason: &str) {
        let msg = Message::Cancellation(Cancellation::new(id, reason));
        let Ok(payload) = self.options.codec.marshal(&msg) else {
            return;
        };
        let frame = Frame::new(id, payload);

        let write = async {
            let mut writer = self.writer.lock().await;
            let _ = writer.write_frame(&frame).await;
        };
        // Do not let a blocked writer delay the caller's cancellation.
        let _ = tokio::time::timeout(std::time::Duration::from_millis(100), write).await;
    }
}

#[async_trait]
impl Transport for MultiplexedTransport {
    async fn call(&self, ctx: &CallContext, mut req: Request) -> Result<Response> {
        if self.closed.is_cancelled() {
            return Err(Error::Connection("transport is closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        req.id = id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);
        let _guard = PendingGuard {
            pending: self.pending.as_ref(),
            id,
        };

        let payload = self.options.codec.marshal(&Message::Request(req))?;
        let frame = Frame::new(id, payload);
        {
            let mut writer = self.writer.lock().await;
            writer.write_frame(&frame).await?;
        }

        let timeout = ctx.remaining().unwrap_or(self.options.call_timeout);
        tokio::select! {
            res = rx => match res {
                Ok(resolution) => resolution,
                Err(_) => Err(Error::Connection("transport closed".to_string())),
            },
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
            _ = ctx.token().cancelled() => {
                self.send_cancellation(id, "context cancelled").await;
                Err(Error::Cancelled("context cancelled".to_string()))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.get_mut().shutdown().await;
        }

        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }

        fail_all(&self.pending, "transport closed");
        tracing::debug!(socket = %self.path.display(), "multiplexed transport closed");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

/// Removes the pending entry on every call exit path; delivery by the
/// reader has already removed it, in which case this is a no-op.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().expect("pending lock").remove(&self.id);
    }
}

async fn read_loop(
    mut framer: Framer<OwnedReadHalf>,
    pending: Arc<PendingMap>,
    closed: CancellationToken,
    codec: CodecKind,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => return,
            res = framer.read_frame() => res,
        };

        match frame {
            Ok(Some(frame)) => deliver(&pending, codec, frame),
            Ok(None) => {
                fail_all(&pending, "connection closed by worker");
                closed.cancel();
                return;
            }
            Err(e) => {
                if !closed.is_cancelled() {
                    tracing::error!(error = %e, "failed to read frame");
                    fail_all(&pending, &format!("connection error: {e}"));
                    closed.cancel();
                }
                return;
            }
        }
    }
}

fn deliver(pending: &PendingMap, codec: CodecKind, frame: Frame) {
    let message: Message = match codec.unmarshal(&frame.payload) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::error!(error = %e, request_id = frame.request_id(), "failed to unmarshal response");
            return;
        }
    };

    let mut resp = match message {
        Message::Response(resp) => resp,
        other => {
            tracing::warn!(request_id = frame.request_id(), "unexpected message type: {other:?}");
            return;
        }
    };

    // The frame header is authoritative for matching.
    resp.id = frame.request_id();

    let sender = pending.lock().expect("pending lock").remove(&resp.id);
    match sender {
        Some(tx) => {
            // The call may have timed out concurrently; nothing to do then.
            let _ = tx.send(Ok(resp));
        }
        None => tracing::warn!(request_id = resp.id, "received response for unknown request"),
    }
}

fn fail_all(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = {
        let mut map = pending.lock().expect("pending lock");
        map.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(Error::Connection(reason.to_string())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::{UnixListener, UnixStream};

    /// Enhanced-frame echo server: answers each request after the delay
    /// named in its body, out of order when delays differ.
    fn spawn_mux_server(path: PathBuf, cancel_log: Option<tokio::sync::mpsc::UnboundedSender<u64>>) {
        tokio::spawn(async move {
            let listener = UnixListener::bind(&path).unwrap();
            while let Ok((stream, _)) = listener.accept().await {
                let cancel_log = cancel_log.clone();
                tokio::spawn(serve_mux_conn(stream, cancel_log));
            }
        });
    }

    async fn serve_mux_conn(
        stream: UnixStream,
        cancel_log: Option<tokio::sync::mpsc::UnboundedSender<u64>>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = Framer::new(read_half);
        let writer = Arc::new(Mutex::new(Framer::new(write_half)));

        while let Ok(Some(frame)) = reader.read_frame().await {
            let msg: Message = serde_json::from_slice(&frame.payload).unwrap();
            match msg {
                Message::Request(req) => {
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        let delay = req.body.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(delay)).await;

                        let resp = Response::success(req.id, json!({"echo": req.body}));
                        let payload = serde_json::to_vec(&Message::Response(resp)).unwrap();
                        let out = Frame::new(req.id, payload);
                        let _ = writer.lock().await.write_frame(&out).await;
                    });
                }
                Message::Cancellation(c) => {
                    if let Some(log) = &cancel_log {
                        let _ = log.send(c.id);
                    }
                }
                Message::Response(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_match_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux.sock");
        spawn_mux_server(path.clone(), None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let transport = Arc::new(
            MultiplexedTransport::connect(&path, TransportOptions::default())
                .await
                .unwrap(),
        );

        // Later calls answer sooner: responses arrive out of order.
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                let ctx = CallContext::new();
                let delay = 160 - i * 10;
                let req = Request::new(0, "echo", json!({"marker": i, "delay_ms": delay}));
                let resp = transport.call(&ctx, req).await.unwrap();
                (i, resp)
            }));
        }

        for handle in handles {
            let (i, resp) = handle.await.unwrap();
            assert!(resp.ok);
            assert_eq!(resp.body["echo"]["marker"], json!(i), "mismatched response");
        }
        assert_eq!(transport.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_per_call_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux-timeout.sock");
        spawn_mux_server(path.clone(), None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let options = TransportOptions {
            call_timeout: Duration::from_millis(80),
            ..TransportOptions::default()
        };
        let transport = MultiplexedTransport::connect(&path, options).await.unwrap();

        let ctx = CallContext::new();
        let req = Request::new(0, "echo", json!({"delay_ms": 5_000}));
        let err = transport.call(&ctx, req).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // The pending entry was removed on the timeout path.
        assert_eq!(transport.pending_calls(), 0);
        // The connection itself is still alive.
        assert!(transport.is_healthy());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_outstanding_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux-loss.sock");

        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection briefly, then drop it.
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(stream);
        });

        let transport = Arc::new(
            MultiplexedTransport::connect(&path, TransportOptions::default())
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..4 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                let ctx = CallContext::new();
                transport
                    .call(&ctx, Request::new(0, "echo", json!({"delay_ms": 60_000})))
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Connection(_)));
        }
        assert!(!transport.is_healthy());

        // New calls are rejected once the transport is closed.
        let ctx = CallContext::new();
        let err = transport
            .call(&ctx, Request::new(0, "echo", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_cancellation_sends_control_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux-cancel.sock");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        spawn_mux_server(path.clone(), Some(tx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let transport = MultiplexedTransport::connect(&path, TransportOptions::default())
            .await
            .unwrap();

        let ctx = CallContext::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let start = std::time::Instant::now();
        let err = transport
            .call(&ctx, Request::new(0, "echo", json!({"delay_ms": 60_000})))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
        assert!(start.elapsed() < Duration::from_millis(200));

        // The worker saw a cancellation envelope carrying the call's id.
        let cancelled_id = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled_id, 1);
        assert_eq!(transport.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux-close.sock");
        spawn_mux_server(path.clone(), None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let transport = MultiplexedTransport::connect(&path, TransportOptions::default())
            .await
            .unwrap();
        assert!(transport.is_healthy());

        transport.close().await.unwrap();
        assert!(!transport.is_healthy());

        let ctx = CallContext::new();
        let err = transport
            .call(&ctx, Request::new(0, "echo", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
