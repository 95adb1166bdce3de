//! Error classification and server quarantine
//!
//! Every failed call to a server is classified and counted. A server that
//! fails `threshold` times inside the rolling window is quarantined: it stays
//! unavailable until an operator clears it, unlike an open circuit which
//! recovers on its own.

use super::QuarantinedServerError;
use super::status::{EventKind, StatusTracker};
use crate::config::IsolationConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Broad failure class of an error
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Timeout,
    Protocol,
    Internal,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Connection => "connection",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Connection | ErrorCategory::Timeout | ErrorCategory::Unknown
        )
    }

    /// Classify an error by walking its source chain, falling back to
    /// keywords in the top-level message.
    pub fn classify(error: &(dyn Error + 'static)) -> ErrorCategory {
        let mut current = Some(error);
        while let Some(err) = current {
            if let Some(category) = Self::from_known_type(err) {
                return category;
            }
            current = err.source();
        }
        Self::from_message(&error.to_string())
    }

    fn from_known_type(err: &(dyn Error + 'static)) -> Option<ErrorCategory> {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Self::from_io_kind(io_err.kind());
        }
        if err.is::<tokio::time::error::Elapsed>() {
            return Some(ErrorCategory::Timeout);
        }
        if err.is::<serde_json::Error>() {
            return Some(ErrorCategory::Protocol);
        }
        None
    }

    fn from_io_kind(kind: io::ErrorKind) -> Option<ErrorCategory> {
        use io::ErrorKind::*;
        match kind {
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | BrokenPipe | AddrInUse | AddrNotAvailable => Some(ErrorCategory::Connection),
            TimedOut | WouldBlock => Some(ErrorCategory::Timeout),
            InvalidData | InvalidInput | UnexpectedEof => Some(ErrorCategory::Protocol),
            // Other kinds say little about the server; try the message.
            _ => None,
        }
    }

    fn from_message(message: &str) -> ErrorCategory {
        let message = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| message.contains(w));
        if has(&["timeout", "timed out", "deadline"]) {
            ErrorCategory::Timeout
        } else if has(&["connection", "connect", "refused", "unreachable", "broken pipe", "reset by peer"]) {
            ErrorCategory::Connection
        } else if has(&["protocol", "parse", "malformed", "invalid", "json", "unexpected response"]) {
            ErrorCategory::Protocol
        } else if has(&["internal", "server error", "panic"]) {
            ErrorCategory::Internal
        } else {
            ErrorCategory::Unknown
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error statistics for one server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub total_errors: u64,
    /// Errors still inside the rolling window
    pub errors_in_window: usize,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub quarantined: bool,
    pub quarantine_reason: Option<String>,
    pub quarantined_at: Option<DateTime<Utc>>,
}

impl ErrorStats {
    /// Most frequent category so far
    pub fn dominant_category(&self) -> Option<ErrorCategory> {
        self.by_category
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(category, _)| *category)
    }
}

#[derive(Debug, Default)]
struct ServerErrors {
    stats: ErrorStats,
    window: VecDeque<Instant>,
}

/// Tracks errors per server and quarantines the unreliable ones
pub struct ErrorIsolator {
    threshold: u32,
    window: Duration,
    servers: Mutex<HashMap<String, ServerErrors>>,
    tracker: Option<Arc<StatusTracker>>,
}

impl ErrorIsolator {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            servers: Mutex::new(HashMap::new()),
            tracker: None,
        }
    }

    pub fn from_config(config: &IsolationConfig) -> Self {
        Self::new(config.quarantine_threshold, config.window())
    }

    pub fn with_tracker(mut self, tracker: Arc<StatusTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Classify and count an error, quarantining the server if it has now
    /// failed too often within the window.
    pub fn record_error(&self, server_id: &str, error: &(dyn Error + 'static)) -> ErrorCategory {
        let category = ErrorCategory::classify(error);
        let now = Instant::now();

        let mut servers = self.servers.lock();
        let entry = servers.entry(server_id.to_string()).or_default();
        entry.window.push_back(now);
        while let Some(oldest) = entry.window.front() {
            if now.duration_since(*oldest) > self.window {
                entry.window.pop_front();
            } else {
                break;
            }
        }

        let stats = &mut entry.stats;
        *stats.by_category.entry(category).or_insert(0) += 1;
        stats.total_errors += 1;
        stats.errors_in_window = entry.window.len();
        stats.last_error = Some(error.to_string());
        stats.last_error_at = Some(Utc::now());

        let mut newly_quarantined = None;
        if !stats.quarantined && stats.errors_in_window >= self.threshold as usize {
            let reason = format!(
                "{} errors within {}s, mostly {}",
                stats.errors_in_window,
                self.window.as_secs(),
                stats.dominant_category().unwrap_or(category)
            );
            stats.quarantined = true;
            stats.quarantine_reason = Some(reason.clone());
            stats.quarantined_at = Some(Utc::now());
            newly_quarantined = Some(reason);
        }
        drop(servers);

        tracing::debug!(server = %server_id, %category, "recorded error: {}", error);
        if let Some(reason) = newly_quarantined {
            tracing::warn!(server = %server_id, "server quarantined: {}", reason);
            if let Some(tracker) = &self.tracker {
                tracker.record(server_id, EventKind::Quarantined, reason);
            }
        }
        category
    }

    pub fn is_quarantined(&self, server_id: &str) -> bool {
        self.servers
            .lock()
            .get(server_id)
            .is_some_and(|s| s.stats.quarantined)
    }

    /// Fail fast if the server is quarantined.
    pub fn check(&self, server_id: &str) -> Result<(), QuarantinedServerError> {
        let servers = self.servers.lock();
        match servers.get(server_id) {
            Some(s) if s.stats.quarantined => Err(QuarantinedServerError {
                server_id: server_id.to_string(),
                reason: s.stats.quarantine_reason.clone().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    /// Lift a quarantine and forget the server's error history.
    pub fn clear_quarantine(&self, server_id: &str) {
        let removed = self.servers.lock().remove(server_id);
        if removed.is_some_and(|s| s.stats.quarantined) {
            tracing::info!(server = %server_id, "quarantine cleared");
            if let Some(tracker) = &self.tracker {
                tracker.record(server_id, EventKind::QuarantineCleared, "cleared by operator");
            }
        }
    }

    pub fn stats(&self, server_id: &str) -> Option<ErrorStats> {
        self.servers.lock().get(server_id).map(|s| s.stats.clone())
    }

    /// Quarantined server ids, sorted.
    pub fn quarantined_servers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .servers
            .lock()
            .iter()
            .filter(|(_, s)| s.stats.quarantined)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Default for ErrorIsolator {
    fn default() -> Self {
        Self::from_config(&IsolationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[derive(Debug, thiserror::Error)]
    #[error("tool call failed")]
    struct Wrapped(#[source] io::Error);

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct Plain(String);

    #[test]
    fn test_classify_io_kinds() {
        assert_eq!(ErrorCategory::classify(&refused()), ErrorCategory::Connection);
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(ErrorCategory::classify(&timed_out), ErrorCategory::Timeout);
        let bad = io::Error::new(io::ErrorKind::InvalidData, "garbage frame");
        assert_eq!(ErrorCategory::classify(&bad), ErrorCategory::Protocol);
    }

    #[test]
    fn test_classify_walks_source_chain() {
        let err = Wrapped(refused());
        assert_eq!(ErrorCategory::classify(&err), ErrorCategory::Connection);
    }

    #[test]
    fn test_classify_json_and_keywords() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(ErrorCategory::classify(&json_err), ErrorCategory::Protocol);

        let cases = [
            ("request timed out", ErrorCategory::Timeout),
            ("could not connect to host", ErrorCategory::Connection),
            ("internal server error", ErrorCategory::Internal),
            ("something odd", ErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(ErrorCategory::classify(&Plain(message.to_string())), expected, "{}", message);
        }
    }

    #[tokio::test]
    async fn test_classify_elapsed() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(ErrorCategory::classify(&elapsed), ErrorCategory::Timeout);
    }

    #[test]
    fn test_retryable_categories() {
        assert!(ErrorCategory::Connection.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::Unknown.is_retryable());
        assert!(!ErrorCategory::Protocol.is_retryable());
        assert!(!ErrorCategory::Internal.is_retryable());
    }

    #[test]
    fn test_quarantine_at_threshold_and_clear() {
        let isolator = ErrorIsolator::new(5, Duration::from_secs(300));
        for _ in 0..4 {
            isolator.record_error("fs", &refused());
        }
        assert!(!isolator.is_quarantined("fs"));
        assert!(isolator.check("fs").is_ok());

        isolator.record_error("fs", &refused());
        assert!(isolator.is_quarantined("fs"));
        let err = isolator.check("fs").unwrap_err();
        assert!(!err.reason.is_empty());
        assert!(err.reason.contains("connection"));
        assert_eq!(isolator.quarantined_servers(), vec!["fs"]);

        isolator.clear_quarantine("fs");
        assert!(!isolator.is_quarantined("fs"));
        assert!(isolator.stats("fs").is_none());
        assert!(isolator.quarantined_servers().is_empty());
    }

    #[test]
    fn test_stats_count_categories() {
        let isolator = ErrorIsolator::new(10, Duration::from_secs(300));
        isolator.record_error("fs", &refused());
        isolator.record_error("fs", &refused());
        let category = isolator.record_error("fs", &Plain("invalid response".to_string()));
        assert_eq!(category, ErrorCategory::Protocol);

        let stats = isolator.stats("fs").unwrap();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.by_category[&ErrorCategory::Connection], 2);
        assert_eq!(stats.by_category[&ErrorCategory::Protocol], 1);
        assert_eq!(stats.dominant_category(), Some(ErrorCategory::Connection));
        assert_eq!(stats.last_error.as_deref(), Some("invalid response"));
        assert!(!stats.quarantined);
    }

    #[test]
    fn test_old_errors_leave_the_window() {
        let isolator = ErrorIsolator::new(3, Duration::from_millis(30));
        isolator.record_error("fs", &refused());
        isolator.record_error("fs", &refused());
        std::thread::sleep(Duration::from_millis(60));
        isolator.record_error("fs", &refused());

        assert!(!isolator.is_quarantined("fs"));
        let stats = isolator.stats("fs").unwrap();
        assert_eq!(stats.errors_in_window, 1);
        assert_eq!(stats.total_errors, 3);
    }

    #[test]
    fn test_quarantine_is_tracked() {
        let tracker = Arc::new(StatusTracker::new(8));
        let isolator = ErrorIsolator::new(1, Duration::from_secs(60)).with_tracker(tracker.clone());
        isolator.record_error("git", &refused());
        isolator.clear_quarantine("git");

        let kinds: Vec<_> = tracker.events("git").into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Quarantined, EventKind::QuarantineCleared]);
    }
}
