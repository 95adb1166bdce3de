//! Warden configuration.
//!
//! Values are supplied by whatever loads configuration for the host
//! application; every struct deserializes from a partial document and fills
//! the rest from `Default`.

use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Program (plus leading arguments) that child agents are launched through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl EntryPoint {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The running executable, so children re-enter this binary in child mode.
    pub fn current_exe() -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("warden"));
        Self {
            program,
            args: Vec::new(),
        }
    }
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self::current_exe()
    }
}

/// Process dispatcher knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds a child may run before `terminate_hanging` reaps it.
    pub timeout_secs: u64,
    /// Seconds between the graceful signal and the hard kill.
    pub grace_period_secs: u64,
    /// Interval of the background poller.
    pub poll_interval_ms: u64,
    /// How long to keep draining output pipes after a child exits.
    pub output_drain_ms: u64,
    pub entry_point: EntryPoint,
}

impl DispatcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            grace_period_secs: 5,
            poll_interval_ms: 1000,
            output_drain_ms: 2000,
            entry_point: EntryPoint::default(),
        }
    }
}

/// Circuit breaker knobs, shared by every per-server breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before trial calls are allowed.
    pub cooldown_secs: u64,
    /// Successful trial calls needed to close from half-open.
    pub half_open_trials: u32,
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            half_open_trials: 2,
        }
    }
}

/// Retry and backoff knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// Error isolation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Failures inside the window that quarantine a server.
    pub quarantine_threshold: u32,
    /// Length of the rolling failure window.
    pub window_secs: u64,
}

impl IsolationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: 5,
            window_secs: 300,
        }
    }
}

/// Status tracker knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Events kept per server before the oldest are dropped.
    pub capacity: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Top-level runtime config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub dispatcher: DispatcherConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub isolation: IsolationConfig,
    pub status: StatusConfig,
}

impl WardenConfig {
    /// Reject values that would make a component degenerate.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.timeout_secs == 0 {
            return Err(config_err("dispatcher.timeout_secs must be positive"));
        }
        if self.dispatcher.poll_interval_ms == 0 {
            return Err(config_err("dispatcher.poll_interval_ms must be positive"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(config_err("breaker.failure_threshold must be positive"));
        }
        if self.breaker.half_open_trials == 0 {
            return Err(config_err("breaker.half_open_trials must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_err("retry.max_attempts must be positive"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(config_err("retry.multiplier must be at least 1.0"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(config_err("retry.max_delay_ms is below retry.initial_delay_ms"));
        }
        if self.isolation.quarantine_threshold == 0 {
            return Err(config_err("isolation.quarantine_threshold must be positive"));
        }
        if self.status.capacity == 0 {
            return Err(config_err("status.capacity must be positive"));
        }
        Ok(())
    }
}

fn config_err(message: &str) -> WardenError {
    WardenError::Config(message.to_string())
}
