//! Dispatcher-local handle on a spawned process

use crate::process::ChildProcess;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// A child process the dispatcher believes may still be running
pub struct ProcessHandle {
    pub agent_name: String,
    pub pid: u32,
    pub child: Box<dyn ChildProcess>,
    /// Monotonic start, used for timeouts
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    /// Set once a result has been produced; the entry is about to be dropped.
    pub reaped: bool,
}

impl ProcessHandle {
    pub fn new(agent_name: impl Into<String>, pid: u32, child: Box<dyn ChildProcess>) -> Self {
        Self {
            agent_name: agent_name.into(),
            pid,
            child,
            started: Instant::now(),
            started_at: Utc::now(),
            reaped: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_overdue(&self, timeout: Duration) -> bool {
        self.elapsed() > timeout
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("agent_name", &self.agent_name)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("reaped", &self.reaped)
            .finish()
    }
}
