//! Worker subprocess supervision.
//!
//! - [`Worker`] - lifecycle state machine over one subprocess and its
//!   control socket
//! - [`connect`] - dialing helpers, including the readiness polling used
//!   after spawn

pub mod connect;
mod supervisor;

pub use supervisor::{Worker, WorkerState};
