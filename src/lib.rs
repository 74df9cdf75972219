//! # procpool
//!
//! In-host IPC library: call user-registered functions hosted in a fleet
//! of sibling worker processes over Unix domain sockets, with the
//! ergonomics of a local function call and multi-core scaling across
//! workers whose runtime cannot parallelize in one process.
//!
//! ## Architecture
//!
//! - **Supervisor** ([`worker::Worker`]): spawns, monitors, restarts,
//!   and tears down worker subprocesses
//! - **Framing** ([`protocol`]): length-prefixed frames, plus an
//!   enhanced variant with request ids and CRC32C checksums
//! - **Transports** ([`transport`]): serial (one call per connection at
//!   a time) and multiplexed (many concurrent calls on one connection)
//! - **Pool** ([`Pool`]): round-robin dispatch with backpressure,
//!   health monitoring, and cancellation propagation
//! - **Server** ([`server::WorkerServer`]): the worker side of the wire
//!   contract, for workers written in Rust
//!
//! The pool's primary call path is serial framing over a per-worker
//! connection pool; [`transport::MultiplexedTransport`] is the opt-in
//! alternative for deployments that want many calls on one connection.
//!
//! ## Example
//!
//! ```ignore
//! use procpool::{CallContext, Pool, PoolConfig, WorkerSpec};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> procpool::Result<()> {
//!     let spec = WorkerSpec::new("app", "python3", "/tmp/app.sock")
//!         .with_script("worker.py");
//!     let pool = Pool::new(PoolConfig::default(), spec)?;
//!
//!     let ctx = CallContext::new();
//!     pool.start(&ctx).await?;
//!
//!     let out: serde_json::Value = pool
//!         .call(&ctx, "echo", &json!({"message": "Hello"}))
//!         .await?;
//!     assert_eq!(out["message"], "Hello");
//!
//!     pool.shutdown().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod worker;

pub use codec::CodecKind;
pub use config::{PoolConfig, RestartConfig, WorkerSpec, SOCKET_PATH_ENV};
pub use context::CallContext;
pub use error::{Error, Result};
pub use pool::{HealthSnapshot, Pool, TypedClient};
pub use worker::{Worker, WorkerState};
