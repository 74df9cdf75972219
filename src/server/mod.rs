//! Worker-side socket server.
//!
//! Implements the worker contract: bind a stream socket at the path from
//! the `PROCPOOL_SOCKET_PATH` environment variable (owner-only
//! permissions), answer framed requests, expose the built-in `health`
//! method, honor cancellation envelopes, and exit cleanly on interrupt.
//!
//! # Example
//!
//! ```ignore
//! use procpool::server::WorkerServer;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> procpool::Result<()> {
//!     WorkerServer::builder()
//!         .handle("echo", |body, _ctx| async move { Ok(body) })
//!         .serve()
//!         .await
//! }
//! ```

mod cancel;
mod connection;
mod router;

pub use cancel::CancelRegistry;
pub use router::{RequestContext, Router};

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::codec::CodecKind;
use crate::config::{DEFAULT_MAX_FRAME_SIZE, SOCKET_PATH_ENV};
use crate::error::{Error, Result};

/// Entry point for worker processes.
pub struct WorkerServer;

impl WorkerServer {
    /// Start building a worker server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Fluent builder registering handlers and options, then serving.
pub struct ServerBuilder {
    router: Router,
    codec: CodecKind,
    max_frame_size: usize,
    socket_path: Option<PathBuf>,
    shutdown: Option<CancellationToken>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            codec: CodecKind::Json,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            socket_path: None,
            shutdown: None,
        }
    }

    /// Register a method handler.
    pub fn handle<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.router.register(method, handler);
        self
    }

    /// Select the payload codec (must match the driver's configuration).
    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    /// Override the maximum frame size.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Bind at an explicit path instead of reading
    /// `PROCPOOL_SOCKET_PATH`.
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// Stop serving when this token fires, in addition to SIGINT.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Bind the socket and serve until interrupted.
    pub async fn serve(self) -> Result<()> {
        let path = match self.socket_path {
            Some(path) => path,
            None => std::env::var_os(SOCKET_PATH_ENV)
                .map(PathBuf::from)
                .ok_or_else(|| {
                    Error::Config(format!("{SOCKET_PATH_ENV} is not set"))
                })?,
        };

        // A stale file from a previous incarnation would make bind fail.
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        let listener = UnixListener::bind(&path)?;
        // Owner-only: other local users cannot talk to this worker.
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;

        tracing::info!(socket = %path.display(), codec = self.codec.name(), "worker listening");

        let router = Arc::new(self.router);
        let cancels = Arc::new(CancelRegistry::new());
        let shutdown = self.shutdown.unwrap_or_default();
        let mut interrupt = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    tracing::info!("interrupt received, shutting down");
                    break;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(connection::serve_connection(
                            stream,
                            router.clone(),
                            cancels.clone(),
                            self.codec,
                            self.max_frame_size,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        let _ = tokio::fs::remove_file(&path).await;
        tracing::info!("worker shut down");
        Ok(())
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    use crate::context::CallContext;
    use crate::protocol::{Framer, Request, Response};
    use crate::transport::{MultiplexedTransport, SerialTransport, Transport, TransportOptions};
    use crate::worker::connect;

    fn spawn_test_server(path: PathBuf) -> CancellationToken {
        let token = CancellationToken::new();
        let server_token = token.clone();
        tokio::spawn(async move {
            let result = WorkerServer::builder()
                .handle("echo", |body, _ctx| async move { Ok(body) })
                .handle("add", |body, _ctx| async move {
                    let a = body["a"].as_i64().unwrap_or(0);
                    let b = body["b"].as_i64().unwrap_or(0);
                    Ok(json!({"result": a + b}))
                })
                .handle("slow", |body, ctx: RequestContext| async move {
                    let ms = body["ms"].as_u64().unwrap_or(1_000);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                            Ok(json!({"completed": true}))
                        }
                        _ = ctx.cancelled() => Err(ctx.cancellation_error()),
                    }
                })
                .socket_path(path)
                .shutdown_token(server_token)
                .serve()
                .await;
            assert!(result.is_ok(), "server failed: {result:?}");
        });
        token
    }

    async fn wait_for_socket(path: &std::path::Path) {
        let ctx = CallContext::new();
        connect::dial_with_retry(path, Duration::from_secs(5), &ctx)
            .await
            .expect("server did not come up");
    }

    #[tokio::test]
    async fn test_serves_serial_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let token = spawn_test_server(path.clone());
        wait_for_socket(&path).await;

        let transport = SerialTransport::connect(&path, TransportOptions::default())
            .await
            .unwrap();
        let ctx = CallContext::new();

        let resp = transport
            .call(&ctx, Request::new(0, "add", json!({"a": 10, "b": 32})))
            .await
            .unwrap();
        assert!(resp.ok);
        assert_eq!(resp.body, json!({"result": 42}));

        // Built-in health without user registration.
        let resp = transport
            .call(&ctx, Request::new(0, "health", json!(null)))
            .await
            .unwrap();
        assert_eq!(resp.body["status"], json!("ok"));

        // Unknown method surfaces as an error naming the method.
        let resp = transport
            .call(&ctx, Request::new(0, "nonexistent", json!(null)))
            .await
            .unwrap();
        assert!(!resp.ok);
        assert!(resp.error_msg.unwrap().contains("nonexistent"));

        token.cancel();
    }

    #[tokio::test]
    async fn test_serves_multiplexed_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv-mux.sock");
        let token = spawn_test_server(path.clone());
        wait_for_socket(&path).await;

        let transport = Arc::new(
            MultiplexedTransport::connect(&path, TransportOptions::default())
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..8i64 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                let ctx = CallContext::new();
                let resp = transport
                    .call(&ctx, Request::new(0, "add", json!({"a": i, "b": 1})))
                    .await
                    .unwrap();
                assert_eq!(resp.body["result"], json!(i + 1));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        token.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_envelope_aborts_handler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv-cancel.sock");
        let token = spawn_test_server(path.clone());
        wait_for_socket(&path).await;

        // Drive the wire by hand: send a slow request, then a
        // cancellation envelope for it on a second connection.
        let conn = connect::dial(&path, Duration::from_secs(1)).await.unwrap();
        let mut framer = Framer::new(conn);
        let req = Request::new(41, "slow", json!({"ms": 60_000}));
        framer
            .write_message(&serde_json::to_vec(&req).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let control = connect::dial(&path, Duration::from_secs(1)).await.unwrap();
        let mut control_framer = Framer::new(control);
        let cancel = crate::protocol::Message::Cancellation(
            crate::protocol::Cancellation::new(41, "context cancelled"),
        );
        control_framer
            .write_message(&serde_json::to_vec(&cancel).unwrap())
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), framer.read_message())
            .await
            .expect("no response within deadline")
            .unwrap()
            .unwrap();
        let resp: Response = serde_json::from_slice(&payload).unwrap();
        assert!(!resp.ok);
        assert!(resp.error_msg.unwrap().contains("Cancelled"));

        token.cancel();
    }

    #[tokio::test]
    async fn test_socket_permissions_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv-perm.sock");
        let token = spawn_test_server(path.clone());
        wait_for_socket(&path).await;

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        token.cancel();
        // The socket file is removed on shutdown.
        for _ in 0..50 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_socket_path_is_config_error() {
        // Neither builder path nor environment variable: refuse to serve.
        std::env::remove_var(SOCKET_PATH_ENV);
        let err = WorkerServer::builder().serve().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
