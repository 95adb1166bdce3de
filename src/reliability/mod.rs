//! Failure containment for calls to external (MCP) servers
//!
//! - `CircuitBreaker` - fail fast while a server is known to be down
//! - `RetryManager` - bounded retry with exponential backoff
//! - `ErrorIsolator` - classify errors, quarantine chronically failing servers
//! - `StatusTracker` - bounded per-server event log

mod buffer;
mod circuit_breaker;
mod isolation;
mod retry;
mod status;

pub use buffer::RingBuffer;
pub use circuit_breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use isolation::{ErrorCategory, ErrorIsolator, ErrorStats};
pub use retry::{BackoffPolicy, RetryError, RetryManager, RetryPolicy, RetryStats};
pub use status::{Event, EventKind, StatusTracker};

use std::time::Duration;
use thiserror::Error;

/// A call was rejected because the server's circuit is open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Server '{server_id}' is temporarily unavailable (circuit open, retry in {}s)", .retry_after.as_secs())]
pub struct CircuitOpenError {
    pub server_id: String,
    /// Time until the breaker admits a trial call
    pub retry_after: Duration,
}

/// A call was rejected because the server is quarantined.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Server '{server_id}' is quarantined: {reason}")]
pub struct QuarantinedServerError {
    pub server_id: String,
    pub reason: String,
}
