//! Background health monitoring.
//!
//! A single task ticks at the configured interval and sweeps every
//! worker under one aggregate deadline, updating the per-worker healthy
//! flags the dispatcher consults and the pool-wide [`HealthSnapshot`].
//! The sweep only observes: unhealthy workers are logged, never
//! restarted here.

use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::PoolWorker;

/// Aggregate deadline for one sweep over all workers.
const SWEEP_DEADLINE: Duration = Duration::from_secs(5);

/// Consistent view of pool health.
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    /// Number of workers in the pool.
    pub total: usize,
    /// Number of workers that passed the last check.
    pub healthy: usize,
    /// When the last sweep finished.
    pub last_check: Instant,
}

/// Runs sweeps until the shutdown token fires.
pub(crate) async fn run(
    workers: Vec<Arc<PoolWorker>>,
    interval: Duration,
    status: Arc<RwLock<HealthSnapshot>>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The pool performs the initial sweep itself; skip the immediate
    // first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => sweep(&workers, &status).await,
        }
    }
}

/// Probe every worker once and publish the new snapshot.
pub(crate) async fn sweep(workers: &[Arc<PoolWorker>], status: &RwLock<HealthSnapshot>) {
    let deadline = tokio::time::Instant::now() + SWEEP_DEADLINE;
    let mut healthy = 0;

    for pw in workers {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let ok = if remaining.is_zero() {
            false
        } else {
            tokio::time::timeout(remaining, pw.worker.is_healthy())
                .await
                .unwrap_or(false)
        };

        pw.healthy.store(ok, Ordering::Release);
        if ok {
            healthy += 1;
        } else {
            tracing::warn!(worker_id = %pw.worker.id(), "worker is unhealthy");
        }
    }

    let total = workers.len();
    *status.write().expect("health lock") = HealthSnapshot {
        total,
        healthy,
        last_check: Instant::now(),
    };

    if healthy < total {
        tracing::warn!(healthy, total, "some workers are unhealthy");
    }
}
