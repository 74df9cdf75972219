//! Worker pool: round-robin dispatch with backpressure, health
//! monitoring, and cancellation propagation.
//!
//! A [`Pool`] owns a fixed set of supervised workers, a per-worker pool
//! of serial connections, and one counted semaphore whose capacity is
//! `workers * max_in_flight`. A call is admitted by the semaphore,
//! routed round-robin (skipping unhealthy workers), executed over a
//! pooled connection with classic framing, and its connection returned
//! on success or discarded on I/O failure.
//!
//! Cancellation after the request is on the wire sends a best-effort
//! [`Cancellation`](crate::protocol::Cancellation) envelope over a
//! separate control connection; the call returns immediately with the
//! caller's error.
//!
//! # Example
//!
//! ```ignore
//! use procpool::{CallContext, Pool, PoolConfig, WorkerSpec};
//!
//! let spec = WorkerSpec::new("worker", "python3", "/tmp/app.sock")
//!     .with_script("worker.py");
//! let pool = Pool::new(PoolConfig::default(), spec)?;
//!
//! let ctx = CallContext::new();
//! pool.start(&ctx).await?;
//!
//! let out: Echo = pool.call(&ctx, "echo", &EchoIn { message: "hi".into() }).await?;
//!
//! pool.shutdown().await?;
//! ```

mod conn_pool;
mod health;

pub use conn_pool::ConnectionPool;
pub use health::HealthSnapshot;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, WorkerSpec};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::protocol::{Cancellation, Framer, Message, Request, Response};
use crate::worker::{connect, Worker};

/// Cap on the time spent delivering a best-effort cancellation notice.
const CANCEL_SEND_BUDGET: Duration = Duration::from_millis(100);

/// One worker slot: the supervised process, its idle connections, its
/// request-id counter, and the healthy flag maintained by the sweep.
pub(crate) struct PoolWorker {
    pub(crate) worker: Worker,
    pub(crate) conns: ConnectionPool,
    pub(crate) request_id: AtomicU64,
    pub(crate) healthy: AtomicBool,
}

/// A pool of worker processes answering calls round-robin.
pub struct Pool {
    config: PoolConfig,
    workers: Vec<Arc<PoolWorker>>,
    next_idx: AtomicU64,
    shutting_down: AtomicBool,
    semaphore: Arc<Semaphore>,
    status: Arc<RwLock<HealthSnapshot>>,
    health_cancel: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl Pool {
    /// Create a pool of `config.workers` workers derived from
    /// `base_spec`: slot `i` gets id `worker-i` and the socket path
    /// suffixed with `-i`.
    pub fn new(config: PoolConfig, base_spec: WorkerSpec) -> Result<Pool> {
        if config.workers == 0 {
            return Err(Error::Config("workers must be > 0".to_string()));
        }
        if config.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be > 0".to_string()));
        }

        let workers = (0..config.workers)
            .map(|i| {
                let spec = base_spec.for_slot(i);
                let conns = ConnectionPool::new(
                    spec.socket_path.clone(),
                    config.max_in_flight,
                    config.connect_timeout,
                );
                Arc::new(PoolWorker {
                    worker: Worker::new(spec),
                    conns,
                    request_id: AtomicU64::new(0),
                    healthy: AtomicBool::new(false),
                })
            })
            .collect::<Vec<_>>();

        let capacity = config.workers * config.max_in_flight;
        let status = HealthSnapshot {
            total: config.workers,
            healthy: 0,
            last_check: Instant::now(),
        };

        Ok(Pool {
            workers,
            next_idx: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            semaphore: Arc::new(Semaphore::new(capacity)),
            status: Arc::new(RwLock::new(status)),
            health_cancel: CancellationToken::new(),
            health_task: Mutex::new(None),
            config,
        })
    }

    /// Start every worker in sequence. If worker `i` fails, workers
    /// `0..i` are stopped again and the failure is returned. On success
    /// the health monitor is running and an initial snapshot captured.
    pub async fn start(&self, ctx: &CallContext) -> Result<()> {
        tracing::info!(workers = self.workers.len(), "starting worker pool");

        for (i, pw) in self.workers.iter().enumerate() {
            if let Err(e) = pw.worker.start(ctx).await {
                for started in &self.workers[..i] {
                    let _ = started.worker.stop().await;
                }
                return Err(e);
            }
            pw.healthy.store(true, Ordering::Release);

            let filled = pw.conns.prefill().await;
            tracing::debug!(worker_id = %pw.worker.id(), connections = filled, "pre-populated connection pool");
        }

        health::sweep(&self.workers, &self.status).await;

        let handle = tokio::spawn(health::run(
            self.workers.clone(),
            self.config.health_interval,
            self.status.clone(),
            self.health_cancel.clone(),
        ));
        *self.health_task.lock().expect("health task lock") = Some(handle);

        tracing::info!("worker pool started");
        Ok(())
    }

    /// Invoke `method` on the next worker, serializing `input` and
    /// deserializing the response body.
    pub async fn call<I, O>(&self, ctx: &CallContext, method: &str, input: &I) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let body = serde_json::to_value(input)?;
        let out = self.call_value(ctx, method, body).await?;
        Ok(serde_json::from_value(out)?)
    }

    /// Untyped call: raw body value in, raw body value out.
    ///
    /// As a narrow debug affordance, responses to the `echo_worker_id`
    /// method are decorated with the index of the worker that served the
    /// call under the `worker_id` key.
    pub async fn call_value(&self, ctx: &CallContext, method: &str, input: Value) -> Result<Value> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        // Backpressure admission.
        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| Error::Shutdown)?
            }
            err = ctx.done() => return Err(err),
        };

        // Round-robin selection with a single healthy-worker scan.
        let slot = (self.next_idx.fetch_add(1, Ordering::Relaxed)
            % self.workers.len() as u64) as usize;
        let chosen = if self.workers[slot].healthy.load(Ordering::Acquire) {
            slot
        } else {
            self.workers
                .iter()
                .position(|w| w.healthy.load(Ordering::Acquire))
                .ok_or(Error::NoHealthyWorker)?
        };
        let pw = &self.workers[chosen];

        let conn = pw.conns.acquire().await?;
        let mut framer = Framer::with_max_size(conn, self.config.max_frame_size);

        let id = pw.request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let req = Request::new(id, method, input);
        let data = self.config.codec.marshal(&req)?;

        // Cancelled before the request is written: no remote effect.
        if ctx.is_done() {
            pw.conns.release(framer.into_inner());
            return Err(ctx.error());
        }

        if let Err(e) = framer.write_message(&data).await {
            // Connection is bad; drop it instead of releasing.
            tracing::debug!(worker_id = %pw.worker.id(), error = %e, "request write failed");
            return Err(e);
        }

        let read = tokio::select! {
            res = framer.read_message() => res,
            err = ctx.done() => {
                // The request is on the wire: tell the worker to stop,
                // then return without waiting for its reply. The
                // abandoned connection cannot be reused.
                self.send_cancellation(pw, id, &err).await;
                return Err(err);
            }
        };

        let payload = match read {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                return Err(Error::Connection("connection closed by worker".to_string()))
            }
            Err(e) => return Err(e),
        };

        // The response arrived intact; the connection is reusable even
        // if what it carried was a remote error.
        let decoded: Result<Response> = self.config.codec.unmarshal(&payload);
        pw.conns.release(framer.into_inner());

        let mut value = decoded?.into_result()?;
        if method == "echo_worker_id" {
            if let Value::Object(map) = &mut value {
                map.insert("worker_id".to_string(), Value::from(chosen as u64));
            }
        }
        Ok(value)
    }

    /// Idempotent shutdown: reject new calls, stop the health monitor,
    /// close every connection pool, stop every worker. Stop errors are
    /// aggregated.
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        tracing::info!("shutting down worker pool");

        self.health_cancel.cancel();
        let handle = self.health_task.lock().expect("health task lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Wake callers blocked on admission.
        self.semaphore.close();

        for pw in &self.workers {
            pw.conns.close();
        }

        let mut failures = Vec::new();
        for (i, pw) in self.workers.iter().enumerate() {
            if let Err(e) = pw.worker.stop().await {
                failures.push(format!("worker {i}: {e}"));
            }
        }

        if failures.is_empty() {
            tracing::info!("worker pool shut down");
            Ok(())
        } else {
            Err(Error::WorkerStop(failures.join("; ")))
        }
    }

    /// The latest health snapshot, without probing.
    pub fn health(&self) -> HealthSnapshot {
        *self.status.read().expect("health lock")
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Access a worker slot, e.g. to restart it or read its pid.
    pub fn worker(&self, index: usize) -> Option<&Worker> {
        self.workers.get(index).map(|pw| &pw.worker)
    }

    /// Backpressure permits currently available.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn send_cancellation(&self, pw: &PoolWorker, id: u64, cause: &Error) {
        let reason = match cause {
            Error::Timeout(_) => "timeout",
            _ => "context cancelled",
        };
        let msg = Message::Cancellation(Cancellation::new(id, reason));

        let attempt = async {
            let conn = connect::dial(pw.conns.socket_path(), CANCEL_SEND_BUDGET).await?;
            let mut framer = Framer::with_max_size(conn, self.config.max_frame_size);
            let data = self.config.codec.marshal(&msg)?;
            framer.write_message(&data).await
        };

        match tokio::time::timeout(CANCEL_SEND_BUDGET, attempt).await {
            Ok(Ok(())) => {
                tracing::debug!(worker_id = %pw.worker.id(), request_id = id, reason, "sent cancellation");
            }
            Ok(Err(e)) => {
                tracing::debug!(worker_id = %pw.worker.id(), request_id = id, error = %e, "cancellation send failed");
            }
            Err(_) => {
                tracing::debug!(worker_id = %pw.worker.id(), request_id = id, "cancellation send timed out");
            }
        }
    }
}

/// Type-safe client bound to one method.
///
/// ```ignore
/// let add: TypedClient<AddIn, AddOut> = TypedClient::new(pool.clone(), "add");
/// let sum = add.call(&ctx, &AddIn { a: 10, b: 32 }).await?;
/// ```
pub struct TypedClient<I, O> {
    pool: Arc<Pool>,
    method: String,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> TypedClient<I, O>
where
    I: Serialize,
    O: DeserializeOwned,
{
    /// Bind `method` on `pool`.
    pub fn new(pool: Arc<Pool>, method: impl Into<String>) -> Self {
        Self {
            pool,
            method: method.into(),
            _marker: PhantomData,
        }
    }

    /// Invoke the bound method.
    pub async fn call(&self, ctx: &CallContext, input: &I) -> Result<O> {
        self.pool.call(ctx, &self.method, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec(dir: &tempfile::TempDir) -> WorkerSpec {
        WorkerSpec::new("w", "/bin/true", dir.path().join("pool.sock"))
    }

    #[test]
    fn test_zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            workers: 0,
            ..PoolConfig::default()
        };
        let err = Pool::new(config, base_spec(&dir)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_max_in_flight_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            max_in_flight: 0,
            ..PoolConfig::default()
        };
        let err = Pool::new(config, base_spec(&dir)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_backpressure_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            workers: 3,
            max_in_flight: 2,
            ..PoolConfig::default()
        };
        let pool = Pool::new(config, base_spec(&dir)).unwrap();
        assert_eq!(pool.available_permits(), 6);
        assert_eq!(pool.worker_count(), 3);
    }

    #[test]
    fn test_worker_slots_get_distinct_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            workers: 2,
            ..PoolConfig::default()
        };
        let pool = Pool::new(config, base_spec(&dir)).unwrap();

        let w0 = pool.worker(0).unwrap();
        let w1 = pool.worker(1).unwrap();
        assert_eq!(w0.id(), "worker-0");
        assert_eq!(w1.id(), "worker-1");
        assert_ne!(w0.socket_path(), w1.socket_path());
        assert!(pool.worker(2).is_none());
    }

    #[tokio::test]
    async fn test_call_after_shutdown_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(PoolConfig::default(), base_spec(&dir)).unwrap();

        pool.shutdown().await.unwrap();
        // Second shutdown is a no-op returning success.
        pool.shutdown().await.unwrap();

        let ctx = CallContext::new();
        let err = pool
            .call_value(&ctx, "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[test]
    fn test_initial_health_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(PoolConfig::default(), base_spec(&dir)).unwrap();

        let snapshot = pool.health();
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.healthy, 0);
    }
}
