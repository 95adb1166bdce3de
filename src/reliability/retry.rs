//! Bounded retry with exponential backoff
//!
//! Each attempt goes through the server's quarantine flag and circuit
//! breaker first. Outcomes feed back into both, so a retry loop against a
//! failing server opens its circuit instead of hammering it.

use super::circuit_breaker::BreakerRegistry;
use super::isolation::{ErrorCategory, ErrorIsolator};
use super::status::{EventKind, StatusTracker};
use super::{CircuitOpenError, QuarantinedServerError};
use crate::config::{RetryConfig, WardenConfig};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Fraction of a delay that jitter may add or remove
const JITTER_RATIO: f64 = 0.25;

/// Exponential backoff between attempts
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Delay after the `attempt`th failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let mut delay = if base.is_finite() { base.min(max) } else { max };
        if self.jitter {
            let factor = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
            delay = (delay * factor).min(max);
        }
        Duration::from_secs_f64(delay.max(0.0))
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

/// How many times to try, and how long to wait in between
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: BackoffPolicy::from(config),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Why a guarded call did not produce a value
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Quarantined(#[from] QuarantinedServerError),

    #[error("Gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("Not retrying {category} error: {source}")]
    NotRetryable {
        category: ErrorCategory,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The server was not called at all; callers should report it as
    /// temporarily unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RetryError::CircuitOpen(_) | RetryError::Quarantined(_))
    }

    /// The last error returned by the operation, if it ran.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::NotRetryable { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Per-server retry counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    /// `call_with_retry` invocations
    pub calls: u64,
    /// Times the operation actually ran
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Backoff sleeps taken
    pub retries: u64,
    pub circuit_rejections: u64,
    pub quarantine_rejections: u64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Runs operations against servers with retry, circuit breaking and
/// quarantine.
pub struct RetryManager {
    breakers: Arc<BreakerRegistry>,
    isolator: Arc<ErrorIsolator>,
    tracker: Arc<StatusTracker>,
    policy: RetryPolicy,
    stats: Mutex<HashMap<String, RetryStats>>,
}

impl RetryManager {
    pub fn new(
        breakers: Arc<BreakerRegistry>,
        isolator: Arc<ErrorIsolator>,
        tracker: Arc<StatusTracker>,
        config: RetryConfig,
    ) -> Self {
        Self {
            breakers,
            isolator,
            tracker,
            policy: RetryPolicy::from(&config),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Build the whole reliability stack from config, sharing one tracker.
    pub fn from_config(config: &WardenConfig) -> Self {
        let tracker = Arc::new(StatusTracker::new(config.status.capacity));
        let breakers = BreakerRegistry::new(config.breaker.clone()).with_tracker(tracker.clone());
        let isolator = ErrorIsolator::from_config(&config.isolation).with_tracker(tracker.clone());
        Self::new(
            Arc::new(breakers),
            Arc::new(isolator),
            tracker,
            config.retry.clone(),
        )
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn isolator(&self) -> &Arc<ErrorIsolator> {
        &self.isolator
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `call_with_retry` with the configured policy.
    pub async fn call<T, E, F, Fut>(&self, server_id: &str, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let policy = self.policy.clone();
        self.call_with_retry(server_id, &policy, op).await
    }

    /// Run `op` against `server_id` until it succeeds, fails with a
    /// non-retryable error, or runs out of attempts.
    ///
    /// Quarantine and circuit checks happen before every attempt and never
    /// count as one.
    pub async fn call_with_retry<T, E, F, Fut>(
        &self,
        server_id: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let breaker = self.breakers.get_or_create(server_id);
        let max_attempts = policy.max_attempts.max(1);
        self.update_stats(server_id, |s| s.calls += 1);

        let mut attempt = 0;
        loop {
            if let Err(e) = self.isolator.check(server_id) {
                self.update_stats(server_id, |s| s.quarantine_rejections += 1);
                return Err(e.into());
            }
            if let Err(e) = breaker.check() {
                self.update_stats(server_id, |s| s.circuit_rejections += 1);
                return Err(e.into());
            }

            attempt += 1;
            self.update_stats(server_id, |s| {
                s.attempts += 1;
                s.last_attempt_at = Some(Utc::now());
            });

            let err = match op().await {
                Ok(value) => {
                    breaker.record_success();
                    self.update_stats(server_id, |s| s.successes += 1);
                    self.tracker.record(
                        server_id,
                        EventKind::CallSucceeded,
                        format!("attempt {}", attempt),
                    );
                    return Ok(value);
                }
                Err(err) => err,
            };

            breaker.record_failure();
            let category = self.isolator.record_error(server_id, &err);
            self.update_stats(server_id, |s| s.failures += 1);
            self.tracker.record(
                server_id,
                EventKind::CallFailed,
                format!("attempt {}/{} ({}): {}", attempt, max_attempts, category, err),
            );

            if !category.is_retryable() {
                tracing::debug!(server = %server_id, %category, "not retrying");
                return Err(RetryError::NotRetryable {
                    category,
                    source: err,
                });
            }
            if attempt >= max_attempts {
                tracing::warn!(server = %server_id, attempts = attempt, "retries exhausted: {}", err);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = policy.backoff.delay_for(attempt);
            self.update_stats(server_id, |s| s.retries += 1);
            self.tracker.record(
                server_id,
                EventKind::Retrying,
                format!("attempt {} in {}ms", attempt + 1, delay.as_millis()),
            );
            tracing::debug!(server = %server_id, attempt, ?delay, "retrying after error: {}", err);
            drop(err);
            tokio::time::sleep(delay).await;
        }
    }

    pub fn stats(&self, server_id: &str) -> Option<RetryStats> {
        self.stats.lock().get(server_id).cloned()
    }

    fn update_stats(&self, server_id: &str, f: impl FnOnce(&mut RetryStats)) {
        f(self.stats.lock().entry(server_id.to_string()).or_default());
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::from_config(&WardenConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, IsolationConfig, StatusConfig};
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> WardenConfig {
        WardenConfig {
            breaker: BreakerConfig {
                failure_threshold: 5,
                cooldown_secs: 60,
                half_open_trials: 1,
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                multiplier: 2.0,
                max_delay_ms: 5,
                jitter: false,
            },
            isolation: IsolationConfig {
                quarantine_threshold: 10,
                window_secs: 300,
            },
            status: StatusConfig { capacity: 64 },
            ..WardenConfig::default()
        }
    }

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(150),
            jitter: true,
        };
        for _ in 0..100 {
            let first = backoff.delay_for(1);
            assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
            assert!(backoff.delay_for(5) <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let manager = RetryManager::from_config(&fast_config());
        let calls = &AtomicU32::new(0);

        let value = manager
            .call("fs", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(refused())
                } else {
                    Ok("listing")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "listing");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let breaker = manager.breakers().get("fs").unwrap().snapshot();
        assert_eq!(breaker.total_failures, 2);
        assert_eq!(breaker.total_successes, 1);
        assert_eq!(breaker.consecutive_failures, 0);

        let stats = manager.stats("fs").unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_with_last_error() {
        let manager = RetryManager::from_config(&fast_config());
        let calls = &AtomicU32::new(0);

        let err = manager
            .call("fs", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("reset #{}", n),
                ))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.into_source().unwrap().to_string(), "reset #2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_after_one_attempt() {
        let manager = RetryManager::from_config(&fast_config());
        let calls = &AtomicU32::new(0);

        let err = manager
            .call("fs", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "bad frame"))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RetryError::NotRetryable {
                category: ErrorCategory::Protocol,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_calling() {
        let manager = RetryManager::from_config(&fast_config());
        let breaker = manager.breakers().get_or_create("fs");
        for _ in 0..5 {
            breaker.record_failure();
        }
        let calls = &AtomicU32::new(0);

        let err = manager
            .call("fs", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::CircuitOpen(_)));
        assert!(err.is_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stats("fs").unwrap().circuit_rejections, 1);
    }

    #[tokio::test]
    async fn test_cancelled_trial_call_does_not_jam_breaker() {
        let mut config = fast_config();
        config.breaker = BreakerConfig {
            failure_threshold: 1,
            cooldown_secs: 0,
            half_open_trials: 1,
        };
        let manager = RetryManager::from_config(&config);
        manager.breakers().get_or_create("fs").record_failure();

        // The caller gives up on the trial call mid-flight.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            manager.call("fs", || std::future::pending::<Result<(), io::Error>>()),
        )
        .await;
        assert!(abandoned.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let value = manager
            .call("fs", || async { Ok::<_, io::Error>("back") })
            .await
            .unwrap();

        assert_eq!(value, "back");
        let breaker = manager.breakers().get("fs").unwrap();
        assert_eq!(breaker.state(), crate::reliability::CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_quarantined_server_is_rejected_without_calling() {
        let manager = RetryManager::from_config(&fast_config());
        for _ in 0..10 {
            manager.isolator().record_error("fs", &refused());
        }
        let calls = &AtomicU32::new(0);

        let err = manager
            .call("fs", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Quarantined(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_opening_mid_retry_stops_the_loop() {
        let mut config = fast_config();
        config.breaker.failure_threshold = 2;
        config.retry.max_attempts = 5;
        let manager = RetryManager::from_config(&config);
        let calls = &AtomicU32::new(0);

        let err = manager
            .call("fs", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(refused())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::CircuitOpen(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_events_are_tracked() {
        let manager = RetryManager::from_config(&fast_config());
        let calls = &AtomicU32::new(0);
        manager
            .call("fs", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(refused())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        let kinds: Vec<_> = manager.tracker().events("fs").into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::CallFailed, EventKind::Retrying, EventKind::CallSucceeded]
        );
    }
}
