//! Per-server event log
//!
//! Append-only audit trail of what happened to each MCP server: breaker
//! transitions, call outcomes, retries and quarantines. Each server gets its
//! own bounded log so a noisy server cannot evict another's history.

use super::buffer::RingBuffer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of thing that happened to a server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
    CallSucceeded,
    CallFailed,
    Retrying,
    Quarantined,
    QuarantineCleared,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CircuitOpened => "circuit_opened",
            EventKind::CircuitHalfOpened => "circuit_half_opened",
            EventKind::CircuitClosed => "circuit_closed",
            EventKind::CallSucceeded => "call_succeeded",
            EventKind::CallFailed => "call_failed",
            EventKind::Retrying => "retrying",
            EventKind::Quarantined => "quarantined",
            EventKind::QuarantineCleared => "quarantine_cleared",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a server's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

/// Bounded event logs keyed by server id
pub struct StatusTracker {
    capacity: usize,
    logs: Mutex<HashMap<String, RingBuffer<Event>>>,
}

impl StatusTracker {
    /// `capacity` bounds each server's log independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, server_id: &str, kind: EventKind, detail: impl Into<String>) {
        let event = Event {
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
        };
        tracing::debug!(server = %server_id, kind = %kind, "{}", event.detail);
        self.logs
            .lock()
            .entry(server_id.to_string())
            .or_insert_with(|| RingBuffer::new(self.capacity))
            .push(event);
    }

    /// All retained events for a server, oldest first.
    pub fn events(&self, server_id: &str) -> Vec<Event> {
        self.logs
            .lock()
            .get(server_id)
            .map(RingBuffer::to_vec)
            .unwrap_or_default()
    }

    /// The newest `n` events for a server, oldest first.
    pub fn recent(&self, server_id: &str, n: usize) -> Vec<Event> {
        self.logs
            .lock()
            .get(server_id)
            .map(|log| log.recent(n))
            .unwrap_or_default()
    }

    pub fn last(&self, server_id: &str) -> Option<Event> {
        self.logs.lock().get(server_id).and_then(|log| log.last().cloned())
    }

    /// Servers with at least one event, sorted.
    pub fn servers(&self) -> Vec<String> {
        let mut servers: Vec<_> = self.logs.lock().keys().cloned().collect();
        servers.sort();
        servers
    }

    pub fn clear(&self, server_id: &str) {
        self.logs.lock().remove(server_id);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new(crate::config::StatusConfig::default().capacity)
    }
}
