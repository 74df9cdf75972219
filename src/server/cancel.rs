//! In-flight request cancellation registry.
//!
//! Each request handled by the server registers here for the duration of
//! its handler. A cancellation envelope carrying the same id trips the
//! request's token; the handler observes it at its own pace. Cleanup
//! callbacks registered by the handler run exactly once when the request
//! is unregistered, whether it completed or was cancelled.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

type Cleanup = Box<dyn FnOnce() + Send>;

struct Entry {
    token: CancellationToken,
    cleanups: Vec<Cleanup>,
}

/// Registry of active requests and their cancellation tokens.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<u64, Entry>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request, returning its cancellation token.
    pub fn register(&self, request_id: u64) -> CancellationToken {
        let mut inner = self.inner.lock().expect("cancel lock");
        if inner.contains_key(&request_id) {
            tracing::warn!(request_id, "request already registered, replacing");
        }
        let token = CancellationToken::new();
        inner.insert(
            request_id,
            Entry {
                token: token.clone(),
                cleanups: Vec::new(),
            },
        );
        token
    }

    /// Attach a cleanup callback that runs when the request is
    /// unregistered.
    pub fn add_cleanup(&self, request_id: u64, cleanup: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().expect("cancel lock");
        if let Some(entry) = inner.get_mut(&request_id) {
            entry.cleanups.push(Box::new(cleanup));
        }
    }

    /// Remove a completed or cancelled request and run its cleanups.
    pub fn unregister(&self, request_id: u64) {
        let entry = self.inner.lock().expect("cancel lock").remove(&request_id);
        if let Some(entry) = entry {
            for cleanup in entry.cleanups {
                cleanup();
            }
        }
    }

    /// Cancel a request by id. Returns whether a matching in-flight
    /// request was found.
    pub fn cancel(&self, request_id: u64, reason: &str) -> bool {
        let inner = self.inner.lock().expect("cancel lock");
        match inner.get(&request_id) {
            Some(entry) if !entry.token.is_cancelled() => {
                entry.token.cancel();
                tracing::info!(request_id, reason, "cancelled request");
                true
            }
            Some(_) => false,
            None => {
                tracing::warn!(request_id, "cannot cancel unknown request");
                false
            }
        }
    }

    /// Number of requests currently registered.
    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("cancel lock").len()
    }
}
