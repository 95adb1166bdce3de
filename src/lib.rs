//! Warden: lifecycle and reliability core for agent processes
//!
//! Spawns agent worker processes and keeps a shared registry of their state
//! truthful against the OS process table. Calls to unreliable external
//! (MCP) servers go through a circuit breaker, retry manager and error
//! isolator so one bad server cannot drag the rest of the system down.

pub mod agent;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod invoke;
pub mod process;
pub mod reliability;
pub mod runtime;

use reliability::{CircuitOpenError, QuarantinedServerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn agent '{agent_name}': {source}")]
    Spawn {
        agent_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent {0} not found in agent states")]
    NotFound(String),

    #[error("Agent {0} is already registered")]
    DuplicateAgent(String),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Quarantined(#[from] QuarantinedServerError),

    #[error("Process probe error: {0}")]
    Probe(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Invalid invocation: {0}")]
    Invocation(String),

    #[error("Too many agents requested ({requested}). Maximum is {max}.")]
    TooManyInvocations { requested: usize, max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl WardenError {
    /// True for the reliability-layer rejections callers should surface as
    /// "temporarily unavailable" rather than as a failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, WardenError::CircuitOpen(_) | WardenError::Quarantined(_))
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
