//! Demo worker exposing a handful of methods.
//!
//! Doubles as the fixture for the crate's integration tests. Binds the
//! socket named by `PROCPOOL_SOCKET_PATH` and serves:
//!
//! - `echo` - returns its input unchanged
//! - `add` - `{a, b}` -> `{result: a + b}`
//! - `echo_worker_id` - like `echo`; the pool decorates the response
//!   with the serving worker's index
//! - `slow_operation` - sleeps `{duration}` seconds, cancellable
//! - `check_cleanup` - reports whether a cancelled `slow_operation` ran
//!   its cleanup

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use procpool::server::{RequestContext, WorkerServer};

#[tokio::main]
async fn main() -> procpool::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cleanup_performed = Arc::new(AtomicBool::new(false));
    let cleanup_flag = cleanup_performed.clone();

    WorkerServer::builder()
        .handle("echo", |body, _ctx| async move { Ok(body) })
        .handle("echo_worker_id", |body, _ctx| async move { Ok(body) })
        .handle("add", |body, _ctx| async move {
            let a = body["a"].as_f64().unwrap_or(0.0);
            let b = body["b"].as_f64().unwrap_or(0.0);
            let sum = a + b;
            // Keep integer sums integral in the reply.
            if sum.fract() == 0.0 {
                Ok(json!({"result": sum as i64}))
            } else {
                Ok(json!({"result": sum}))
            }
        })
        .handle("slow_operation", move |body, ctx: RequestContext| {
            let flag = cleanup_flag.clone();
            async move {
                let duration = body["duration"].as_f64().unwrap_or(1.0);
                let flag_for_cleanup = flag.clone();
                ctx.on_cleanup(move || {
                    if flag_for_cleanup.load(Ordering::SeqCst) {
                        tracing::info!("cleanup after cancellation done");
                    }
                });

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(duration)) => {
                        Ok(json!({"completed": true, "duration": duration}))
                    }
                    _ = ctx.cancelled() => {
                        flag.store(true, Ordering::SeqCst);
                        Err(ctx.cancellation_error())
                    }
                }
            }
        })
        .handle("check_cleanup", move |_body, _ctx| {
            let flag = cleanup_performed.clone();
            async move { Ok(json!({"cleanup_performed": flag.load(Ordering::SeqCst)})) }
        })
        .serve()
        .await
}
