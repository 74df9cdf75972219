//! Worker supervision: spawn, readiness, monitoring, shutdown.
//!
//! A [`Worker`] drives one subprocess through the lifecycle
//! `Stopped → Starting → Running → Stopping → Stopped`. Transitions go
//! through compare-and-set on a single atomic cell, so exactly one actor
//! wins any transition and every observed edge is legal.
//!
//! The monitor task is the only owner of the child handle and therefore
//! the only task that ever waits on it; the exit status is published
//! through a one-shot cell that readers can block on. An exit observed
//! while the worker is `Running` is the "died unexpectedly" signal:
//! the monitor moves the state to `Stopped`, clears the pid, and removes
//! the socket file. Higher layers pick this up through health checks;
//! restarting is their policy, not the monitor's.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connect;
use crate::config::{RestartConfig, WorkerSpec, SOCKET_PATH_ENV};
use crate::context::CallContext;
use crate::error::{Error, Result};

/// Grace window between interrupt and forced kill on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Dial timeout used by health checks.
const HEALTH_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> WorkerState {
        match v {
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// State shared between the worker handle and its monitor task. The
/// monitor gets only this slim handle, never the `Worker` itself, so
/// there is no reference cycle through the task.
struct Shared {
    id: String,
    socket_path: std::path::PathBuf,
    state: AtomicU8,
    pid: AtomicU32,
}

impl Shared {
    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Channels belonging to one subprocess incarnation; replaced wholesale
/// on every start so a restart never observes stale signals.
struct Run {
    exited_rx: watch::Receiver<bool>,
    exit_status: Arc<OnceLock<ExitStatus>>,
    monitor: Option<JoinHandle<()>>,
}

/// Handle over one supervised worker subprocess and its control socket.
pub struct Worker {
    spec: WorkerSpec,
    shared: Arc<Shared>,
    run: Mutex<Option<Run>>,
}

impl Worker {
    /// Create a worker in the `Stopped` state. Nothing is spawned yet.
    pub fn new(spec: WorkerSpec) -> Self {
        let shared = Arc::new(Shared {
            id: spec.id.clone(),
            socket_path: spec.socket_path.clone(),
            state: AtomicU8::new(WorkerState::Stopped as u8),
            pid: AtomicU32::new(0),
        });
        Self {
            spec,
            shared,
            run: Mutex::new(None),
        }
    }

    /// Spawn the subprocess and wait for its socket to accept
    /// connections.
    ///
    /// Valid only from `Stopped`. On failure the subprocess is stopped
    /// and the state returns to `Stopped`.
    pub async fn start(&self, ctx: &CallContext) -> Result<()> {
        if !self
            .shared
            .transition(WorkerState::Stopped, WorkerState::Starting)
        {
            return Err(Error::WorkerStart(format!(
                "worker {} already started or starting",
                self.spec.id
            )));
        }

        tracing::info!(
            worker_id = %self.spec.id,
            socket = %self.spec.socket_path.display(),
            script = ?self.spec.script,
            "starting worker"
        );

        // A previous incarnation may have left its socket file behind.
        remove_socket_file(&self.spec.socket_path).await;

        let mut child = match self.spawn_command() {
            Ok(child) => child,
            Err(e) => {
                self.shared
                    .state
                    .store(WorkerState::Stopped as u8, Ordering::Release);
                return Err(Error::WorkerStart(format!(
                    "failed to spawn worker {}: {e}",
                    self.spec.id
                )));
            }
        };

        let pid = child.id().unwrap_or(0);
        self.shared.pid.store(pid, Ordering::Release);
        tracing::info!(worker_id = %self.spec.id, pid, "worker process started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.spec.id.clone(), stderr));
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let exit_status = Arc::new(OnceLock::new());
        let monitor = tokio::spawn(monitor(
            child,
            self.shared.clone(),
            exited_tx,
            exit_status.clone(),
        ));
        *self.run.lock().expect("run lock") = Some(Run {
            exited_rx,
            exit_status,
            monitor: Some(monitor),
        });

        // Poll until the worker binds its socket.
        if let Err(e) =
            connect::dial_with_retry(&self.spec.socket_path, self.spec.start_timeout, ctx).await
        {
            if let Err(stop_err) = self.stop().await {
                tracing::error!(
                    worker_id = %self.spec.id,
                    error = %stop_err,
                    "failed to stop worker after socket error"
                );
            }
            return Err(Error::WorkerStart(format!(
                "worker {} socket not ready: {e}",
                self.spec.id
            )));
        }

        if !self
            .shared
            .transition(WorkerState::Starting, WorkerState::Running)
        {
            return Err(Error::WorkerStart(format!(
                "worker {} was stopped while starting",
                self.spec.id
            )));
        }

        tracing::info!(worker_id = %self.spec.id, "worker ready");
        Ok(())
    }

    /// Stop the subprocess: interrupt, wait up to the grace window, then
    /// kill. Idempotent; later calls return success without acting.
    pub async fn stop(&self) -> Result<()> {
        let stopping = self
            .shared
            .transition(WorkerState::Running, WorkerState::Stopping)
            || self
                .shared
                .transition(WorkerState::Starting, WorkerState::Stopping);
        if !stopping {
            return Ok(());
        }

        tracing::info!(worker_id = %self.spec.id, "stopping worker");

        let pid = self.shared.pid.load(Ordering::Acquire);
        if pid != 0 {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                tracing::warn!(worker_id = %self.spec.id, error = %e, "failed to send interrupt");
            }
        }

        let (exited_rx, monitor) = {
            let mut run = self.run.lock().expect("run lock");
            match run.as_mut() {
                Some(run) => (Some(run.exited_rx.clone()), run.monitor.take()),
                None => (None, None),
            }
        };

        if let Some(rx) = exited_rx {
            let mut grace_rx = rx.clone();
            let graceful = tokio::time::timeout(STOP_GRACE, async {
                let _ = grace_rx.wait_for(|exited| *exited).await;
            })
            .await;

            if graceful.is_err() {
                tracing::warn!(worker_id = %self.spec.id, "worker did not exit gracefully, forcing kill");
                if pid != 0 {
                    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        tracing::error!(worker_id = %self.spec.id, error = %e, "failed to kill worker process");
                    }
                }
                let mut kill_rx = rx.clone();
                let _ = kill_rx.wait_for(|exited| *exited).await;
            }
        }

        remove_socket_file(&self.spec.socket_path).await;

        if let Some(handle) = monitor {
            let _ = handle.await;
        }

        self.shared
            .state
            .store(WorkerState::Stopped as u8, Ordering::Release);
        self.shared.pid.store(0, Ordering::Release);
        tracing::info!(worker_id = %self.spec.id, "worker stopped");

        Ok(())
    }

    /// Stop then start with freshly initialized channels. Must not be
    /// interleaved with a concurrent `start` or `stop`.
    pub async fn restart(&self, ctx: &CallContext) -> Result<()> {
        tracing::info!(worker_id = %self.spec.id, "restarting worker");
        self.stop().await?;
        self.start(ctx).await
    }

    /// Restart with capped exponential back-off between failed attempts.
    ///
    /// This is the optional restart policy layered above the core: the
    /// monitor and the health sweep never call it.
    pub async fn restart_with_backoff(&self, ctx: &CallContext, cfg: &RestartConfig) -> Result<()> {
        let mut attempt = 1u32;
        loop {
            match self.restart(ctx).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= cfg.max_attempts => {
                    tracing::error!(
                        worker_id = %self.spec.id,
                        attempts = attempt,
                        error = %e,
                        "giving up on restart"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = cfg.backoff_for(attempt);
                    tracing::warn!(
                        worker_id = %self.spec.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "restart failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        err = ctx.done() => return Err(err),
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// True iff the worker is `Running` and a short dial to its socket
    /// succeeds.
    pub async fn is_healthy(&self) -> bool {
        if self.state() != WorkerState::Running {
            return false;
        }
        match tokio::time::timeout(
            HEALTH_DIAL_TIMEOUT,
            UnixStream::connect(&self.spec.socket_path),
        )
        .await
        {
            Ok(Ok(_stream)) => true,
            _ => false,
        }
    }

    /// True iff the state is `Running`.
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Pid of the subprocess, or 0 outside `Starting`/`Running`/
    /// `Stopping`.
    pub fn pid(&self) -> u32 {
        self.shared.pid.load(Ordering::Acquire)
    }

    /// Logical worker id.
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Socket path the worker binds.
    pub fn socket_path(&self) -> &Path {
        &self.spec.socket_path
    }

    /// The immutable spec this worker was built from.
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Exit status of the current incarnation, if it has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let run = self.run.lock().expect("run lock");
        run.as_ref().and_then(|r| r.exit_status.get().copied())
    }

    /// Wait until the current incarnation exits and return its status.
    /// Returns `None` if the worker was never started.
    pub async fn wait_exit(&self) -> Option<ExitStatus> {
        let (rx, cell) = {
            let run = self.run.lock().expect("run lock");
            match run.as_ref() {
                Some(r) => (r.exited_rx.clone(), r.exit_status.clone()),
                None => return None,
            }
        };
        let mut rx = rx;
        let _ = rx.wait_for(|exited| *exited).await;
        cell.get().copied()
    }

    fn spawn_command(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.spec.executable);
        if let Some(script) = &self.spec.script {
            cmd.arg(script);
        }
        cmd.args(&self.spec.args);
        for (k, v) in &self.spec.env {
            cmd.env(k, v);
        }
        cmd.env(SOCKET_PATH_ENV, &self.spec.socket_path);
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.spawn()
    }
}

/// Waits on the subprocess (sole reaper), publishes the exit status, and
/// flags an unexpected death.
async fn monitor(
    mut child: Child,
    shared: Arc<Shared>,
    exited_tx: watch::Sender<bool>,
    exit_status: Arc<OnceLock<ExitStatus>>,
) {
    match child.wait().await {
        Ok(status) => {
            let _ = exit_status.set(status);
        }
        Err(e) => {
            tracing::error!(worker_id = %shared.id, error = %e, "failed to wait on worker process");
        }
    }
    let _ = exited_tx.send(true);

    if shared.transition(WorkerState::Running, WorkerState::Stopped) {
        let status = exit_status.get();
        tracing::error!(
            worker_id = %shared.id,
            status = ?status,
            "worker process exited unexpectedly"
        );
        shared.pid.store(0, Ordering::Release);
        let _ = std::fs::remove_file(&shared.socket_path);
    }
}

/// Forward worker stderr lines into tracing.
async fn forward_stderr(worker_id: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!(worker_id = %worker_id, "{line}");
    }
}

async fn remove_socket_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(socket = %path.display(), error = %e, "failed to remove socket file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(path: &Path, exe: &str) -> WorkerSpec {
        WorkerSpec::new("test-worker", exe, path)
            .with_start_timeout(Duration::from_millis(300))
    }

    #[test]
    fn test_new_worker_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Worker::new(spec_for(&dir.path().join("w.sock"), "/bin/true"));

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.pid(), 0);
        assert!(!worker.is_running());
        assert!(worker.exit_status().is_none());
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            WorkerState::Stopped,
            WorkerState::Starting,
            WorkerState::Running,
            WorkerState::Stopping,
        ] {
            assert_eq!(WorkerState::from_u8(state as u8), state);
        }
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Worker::new(spec_for(&dir.path().join("w.sock"), "/bin/true"));

        worker.stop().await.unwrap();
        worker.stop().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_with_missing_executable_fails() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Worker::new(spec_for(
            &dir.path().join("w.sock"),
            "/nonexistent/no-such-binary",
        ));

        let ctx = CallContext::new();
        let err = worker.start(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::WorkerStart(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.pid(), 0);
    }

    #[tokio::test]
    async fn test_start_timeout_when_socket_never_binds() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("w.sock");
        // `sleep` never binds a socket; SIGINT terminates it promptly.
        let spec = WorkerSpec::new("sleeper", "/bin/sleep", &socket)
            .with_arg("30")
            .with_start_timeout(Duration::from_millis(300));
        let worker = Worker::new(spec);

        let ctx = CallContext::new();
        let err = worker.start(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::WorkerStart(_)));

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.pid(), 0);
        assert!(!socket.exists());
        // The subprocess was reaped.
        assert!(worker.exit_status().is_some());
    }

    #[tokio::test]
    async fn test_start_cancelled_by_caller() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("w.sock");
        let spec = WorkerSpec::new("sleeper", "/bin/sleep", &socket)
            .with_arg("30")
            .with_start_timeout(Duration::from_secs(30));
        let worker = Worker::new(spec);

        let ctx = CallContext::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let err = worker.start(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::WorkerStart(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("w.sock");
        let spec = WorkerSpec::new("sleeper", "/bin/sleep", &socket)
            .with_arg("30")
            .with_start_timeout(Duration::from_secs(2));
        let worker = Arc::new(Worker::new(spec));

        // First start is parked in the readiness poll; second must fail
        // the Stopped -> Starting transition.
        let first = {
            let worker = worker.clone();
            tokio::spawn(async move {
                let ctx = CallContext::new();
                worker.start(&ctx).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ctx = CallContext::new();
        let err = worker.start(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::WorkerStart(_)));

        worker.stop().await.unwrap();
        let _ = first.await;
    }
}
