//! Circuit breaker for calls to external servers
//!
//! Closed lets calls through and counts consecutive failures. Reaching the
//! threshold opens the circuit: calls are rejected without being attempted
//! until the cooldown elapses. The breaker then goes half-open and admits a
//! limited number of trial calls; enough successes close it again, a single
//! failure re-opens it.

use super::CircuitOpenError;
use super::status::{EventKind, StatusTracker};
use crate::config::BreakerConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Breaker state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of a breaker, for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub server_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Successes in the current half-open period
    pub half_open_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_transition: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// Trial calls admitted in the current half-open period
    trials_admitted: u32,
    total_failures: u64,
    total_successes: u64,
    /// Start of the current open period
    opened_at: Option<Instant>,
    /// Start of the current half-open trial window
    trials_started_at: Option<Instant>,
    last_transition: DateTime<Utc>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            trials_admitted: 0,
            total_failures: 0,
            total_successes: 0,
            opened_at: None,
            trials_started_at: None,
            last_transition: Utc::now(),
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_transition = Utc::now();
        self.half_open_successes = 0;
        self.trials_admitted = 0;
        self.trials_started_at = None;
        match to {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => self.trials_started_at = Some(Instant::now()),
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
            }
        }
    }
}

/// Per-server circuit breaker
pub struct CircuitBreaker {
    server_id: String,
    failure_threshold: u32,
    cooldown: Duration,
    half_open_trials: u32,
    state: Mutex<BreakerState>,
    tracker: Option<Arc<StatusTracker>>,
}

impl CircuitBreaker {
    pub fn new(
        server_id: impl Into<String>,
        failure_threshold: u32,
        cooldown: Duration,
        half_open_trials: u32,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            half_open_trials: half_open_trials.max(1),
            state: Mutex::new(BreakerState::new()),
            tracker: None,
        }
    }

    pub fn from_config(server_id: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(
            server_id,
            config.failure_threshold,
            config.cooldown(),
            config.half_open_trials,
        )
    }

    /// Log state transitions to `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<StatusTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Whether a call may be attempted now.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits the call as its first trial. Trials that never report an
    /// outcome (a cancelled caller) are written off once a further cooldown
    /// passes, and a new trial window starts.
    pub fn allow_call(&self) -> bool {
        let mut inner = self.state.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() > self.cooldown);
                if !cooled {
                    return false;
                }
                inner.transition(CircuitState::HalfOpen);
                inner.trials_admitted = 1;
                drop(inner);
                tracing::info!(server = %self.server_id, "circuit half-open, admitting trial calls");
                self.emit(EventKind::CircuitHalfOpened, "cooldown elapsed");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trials_admitted < self.half_open_trials {
                    inner.trials_admitted += 1;
                    return true;
                }
                let stalled = inner
                    .trials_started_at
                    .is_none_or(|started| started.elapsed() > self.cooldown);
                if !stalled {
                    return false;
                }
                let outstanding = inner.trials_admitted.saturating_sub(inner.half_open_successes);
                inner.trials_started_at = Some(Instant::now());
                inner.trials_admitted = inner.half_open_successes + 1;
                drop(inner);
                tracing::debug!(
                    server = %self.server_id,
                    outstanding,
                    "trial calls never reported back, starting a new trial window"
                );
                true
            }
        }
    }

    /// `allow_call` as a fail-fast check.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        if self.allow_call() {
            return Ok(());
        }
        Err(CircuitOpenError {
            server_id: self.server_id.clone(),
            retry_after: self.retry_after(),
        })
    }

    /// Time left before an open breaker admits a trial call.
    pub fn retry_after(&self) -> Duration {
        let inner = self.state.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => self.cooldown.saturating_sub(opened.elapsed()),
            (CircuitState::HalfOpen, _) if inner.trials_admitted >= self.half_open_trials => inner
                .trials_started_at
                .map_or(Duration::ZERO, |started| {
                    self.cooldown.saturating_sub(started.elapsed())
                }),
            _ => Duration::ZERO,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.state.lock();
        inner.total_successes += 1;
        let state = inner.state;
        match state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.half_open_trials {
                    inner.transition(CircuitState::Closed);
                    drop(inner);
                    tracing::info!(server = %self.server_id, "circuit closed");
                    self.emit(EventKind::CircuitClosed, "trial calls succeeded");
                }
            }
            // A call admitted before the breaker opened; it proves nothing.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.state.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    let failures = inner.consecutive_failures;
                    inner.transition(CircuitState::Open);
                    drop(inner);
                    tracing::warn!(server = %self.server_id, failures, "circuit opened");
                    self.emit(
                        EventKind::CircuitOpened,
                        format!("{} consecutive failures", failures),
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Open);
                drop(inner);
                tracing::warn!(server = %self.server_id, "trial call failed, circuit re-opened");
                self.emit(EventKind::CircuitOpened, "trial call failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        let was = inner.state;
        *inner = BreakerState::new();
        drop(inner);
        if was != CircuitState::Closed {
            tracing::info!(server = %self.server_id, "circuit reset");
            self.emit(EventKind::CircuitClosed, "manual reset");
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.state.lock();
        BreakerSnapshot {
            server_id: self.server_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            last_transition: inner.last_transition,
        }
    }

    fn emit(&self, kind: EventKind, detail: impl Into<String>) {
        if let Some(tracker) = &self.tracker {
            tracker.record(&self.server_id, kind, detail);
        }
    }
}

/// One breaker per server, created on first use
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    tracker: Option<Arc<StatusTracker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            tracker: None,
        }
    }

    /// Breakers created from now on log transitions to `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<StatusTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn get_or_create(&self, server_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(server_id.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::from_config(server_id, &self.config);
                Arc::new(match &self.tracker {
                    Some(tracker) => breaker.with_tracker(tracker.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(server_id).cloned()
    }

    /// Snapshots of every known breaker, sorted by server id.
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        snapshots
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
