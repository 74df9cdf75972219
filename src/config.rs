//! Configuration values for the pool and its workers.
//!
//! There is no global configuration: everything is carried in the
//! [`PoolConfig`] and [`WorkerSpec`] values passed at construction time.
//! The structs derive `Deserialize` so an application layer can populate
//! them from a config file; loading is not this crate's concern.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::CodecKind;

/// Environment variable through which the supervisor tells a worker
/// process where to bind its socket.
pub const SOCKET_PATH_ENV: &str = "PROCPOOL_SOCKET_PATH";

/// Default maximum frame size (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Default interval between health sweeps.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for a worker to bind its socket after spawn.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for dialing a worker socket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub workers: usize,
    /// Maximum concurrent requests per worker. The pool-wide backpressure
    /// capacity is `workers * max_in_flight`.
    pub max_in_flight: usize,
    /// Interval between background health sweeps.
    pub health_interval: Duration,
    /// Maximum frame size enforced on both read and write.
    pub max_frame_size: usize,
    /// Timeout for dialing a worker socket.
    pub connect_timeout: Duration,
    /// Payload codec. Both sides must agree by configuration; there is no
    /// in-band negotiation.
    pub codec: CodecKind,
    /// Restart back-off policy used by [`Worker::restart_with_backoff`]
    /// (restarts are never triggered automatically by the pool).
    ///
    /// [`Worker::restart_with_backoff`]: crate::worker::Worker::restart_with_backoff
    pub restart: RestartConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_in_flight: 10,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            codec: CodecKind::Json,
            restart: RestartConfig::default(),
        }
    }
}

/// Capped exponential back-off for worker restarts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Maximum restart attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between retries.
    pub max_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RestartConfig {
    /// The delay to wait before the given attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.multiplier);
            if delay >= self.max_backoff {
                return self.max_backoff;
            }
        }
        delay.min(self.max_backoff)
    }
}

/// Immutable configuration of a single worker process.
///
/// Created once per worker, never mutated afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSpec {
    /// Logical worker id used in logs and error messages.
    pub id: String,
    /// Executable to spawn (e.g. `python3` or a worker binary).
    pub executable: PathBuf,
    /// Optional worker script passed as the first argument.
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Additional arguments appended after the script.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides merged onto the driver's environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Socket path the worker is told to bind.
    pub socket_path: PathBuf,
    /// How long to wait for the socket to become connectable after spawn.
    #[serde(default = "default_start_timeout")]
    pub start_timeout: Duration,
}

fn default_start_timeout() -> Duration {
    DEFAULT_START_TIMEOUT
}

impl WorkerSpec {
    /// Create a spec with default timeouts and an empty environment.
    pub fn new(
        id: impl Into<String>,
        executable: impl Into<PathBuf>,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            executable: executable.into(),
            script: None,
            args: Vec::new(),
            env: HashMap::new(),
            socket_path: socket_path.into(),
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    /// Set the worker script path.
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Append an extra argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the socket readiness timeout.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Derive the spec for worker slot `index` of a pool: the logical id
    /// and the socket path both get a `-{index}` suffix.
    pub(crate) fn for_slot(&self, index: usize) -> WorkerSpec {
        let mut spec = self.clone();
        spec.id = format!("worker-{index}");
        let mut path = self.socket_path.as_os_str().to_os_string();
        path.push(format!("-{index}"));
        spec.socket_path = PathBuf::from(path);
        spec
    }
}
