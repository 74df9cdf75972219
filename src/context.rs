//! Caller context: cancellation and deadlines.
//!
//! Every suspension point in the library observes the [`CallContext`]
//! passed by the caller: backpressure acquisition, socket readiness
//! polling, frame I/O, and the multiplexed response wait. A context is
//! cheap to clone; clones share the same cancellation token.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Cancellation token plus optional deadline, observed at every
/// suspension point.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl CallContext {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
            timeout: Some(timeout),
        }
    }

    /// A context driven by an external cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
            timeout: None,
        }
    }

    /// Attach a deadline to this context.
    pub fn and_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self.timeout = Some(timeout);
        self
    }

    /// The cancellation token backing this context.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of every operation holding a clone.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time remaining until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves with the matching error once the context is cancelled or
    /// its deadline passes; pends forever for an unbounded context.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => self.cancel_error(),
                _ = tokio::time::sleep_until(deadline) => {
                    Error::Timeout(self.timeout.unwrap_or_default())
                }
            },
            None => {
                self.cancel.cancelled().await;
                self.cancel_error()
            }
        }
    }

    /// The error a call should return for this context's current state.
    pub fn error(&self) -> Error {
        if self.cancel.is_cancelled() {
            self.cancel_error()
        } else {
            Error::Timeout(self.timeout.unwrap_or_default())
        }
    }

    fn cancel_error(&self) -> Error {
        Error::Cancelled("context cancelled".to_string())
    }
}
