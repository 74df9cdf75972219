//! Per-worker pool of idle connections.
//!
//! A bounded buffer of connections to one worker's socket. Callers
//! borrow a connection for the duration of one request: `acquire` takes
//! an idle one without blocking or dials a new one, `release` puts it
//! back or closes it when the buffer is full. A connection that saw an
//! I/O error must be dropped, never released.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::worker::connect;

/// Bounded buffer of idle connections to one worker.
pub struct ConnectionPool {
    socket_path: PathBuf,
    capacity: usize,
    connect_timeout: Duration,
    idle: Mutex<VecDeque<UnixStream>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create an empty pool for `socket_path` holding at most `capacity`
    /// idle connections.
    pub fn new(socket_path: impl Into<PathBuf>, capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            capacity,
            connect_timeout,
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            closed: AtomicBool::new(false),
        }
    }

    /// Dial until the buffer is full. Dial failures end the pre-fill but
    /// are not fatal; the pool dials lazily on demand afterwards.
    pub async fn prefill(&self) -> usize {
        let mut filled = 0;
        for _ in 0..self.capacity {
            match connect::dial(&self.socket_path, self.connect_timeout).await {
                Ok(conn) => {
                    if !self.put(conn) {
                        break;
                    }
                    filled += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        socket = %self.socket_path.display(),
                        error = %e,
                        "failed to pre-populate connection"
                    );
                    break;
                }
            }
        }
        filled
    }

    /// Take an idle connection, dialing a fresh one if the buffer is
    /// empty.
    pub async fn acquire(&self) -> Result<UnixStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        if let Some(conn) = self.idle.lock().expect("idle lock").pop_front() {
            return Ok(conn);
        }
        connect::dial(&self.socket_path, self.connect_timeout).await
    }

    /// Return a borrowed connection. Dropped instead when the buffer is
    /// full or the pool is closed.
    pub fn release(&self, conn: UnixStream) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.put(conn) {
            tracing::trace!(
                socket = %self.socket_path.display(),
                "idle buffer full, closing connection"
            );
        }
    }

    /// Close the pool and every queued idle connection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.idle.lock().expect("idle lock").clear();
    }

    /// Number of idle connections currently buffered.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("idle lock").len()
    }

    /// The socket this pool dials.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn put(&self, conn: UnixStream) -> bool {
        let mut idle = self.idle.lock().expect("idle lock");
        if idle.len() < self.capacity {
            idle.push_back(conn);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    fn listener_at(dir: &tempfile::TempDir, name: &str) -> (PathBuf, UnixListener) {
        let path = dir.path().join(name);
        let listener = UnixListener::bind(&path).unwrap();
        (path, listener)
    }

    #[tokio::test]
    async fn test_prefill_fills_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (path, listener) = listener_at(&dir, "pool.sock");
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(&path, 3, Duration::from_secs(1));
        assert_eq!(pool.prefill().await, 3);
        assert_eq!(pool.idle_count(), 3);
    }

    #[tokio::test]
    async fn test_prefill_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");

        let pool = ConnectionPool::new(&path, 3, Duration::from_millis(100));
        assert_eq!(pool.prefill().await, 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_reuses_then_dials() {
        let dir = tempfile::tempdir().unwrap();
        let (path, listener) = listener_at(&dir, "pool.sock");
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(&path, 2, Duration::from_secs(1));
        pool.prefill().await;
        assert_eq!(pool.idle_count(), 2);

        // Takes come from the buffer first.
        let a = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 1);
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);

        // Empty buffer: a fresh dial.
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);

        // Releases refill up to capacity; the overflow one is dropped.
        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let (path, listener) = listener_at(&dir, "pool.sock");
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(&path, 2, Duration::from_secs(1));
        pool.prefill().await;
        assert_eq!(pool.idle_count(), 2);

        pool.close();
        assert_eq!(pool.idle_count(), 0);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
