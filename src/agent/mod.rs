//! Agent state and catalog
//!
//! Tracks the lifecycle record of every spawned agent and the set of agent
//! kinds that can be invoked.

mod catalog;
mod registry;

pub use catalog::*;
pub use registry::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an agent process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Process is believed to be alive
    Running,
    /// Process exited and its exit code was observed
    Completed,
    /// Agent reported a failure of its own
    Errored,
    /// Process was killed, vanished, or became a zombie
    Terminated,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Errored => "errored",
            AgentStatus::Terminated => "terminated",
        }
    }

    /// Terminal statuses never move back to `Running`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, AgentStatus::Running)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registry entry for one spawned agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// OS process id
    pub pid: u32,
    pub status: AgentStatus,
    /// Latest human-readable progress note
    pub last_reasoning: Option<String>,
    /// Terminal output or failure explanation
    pub result: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Whether the process runs attached to a visible terminal
    pub visible: bool,
    pub model: Option<String>,
    /// Opaque session metadata owned by the caller
    pub session_info: Option<serde_json::Value>,
}

impl AgentRecord {
    pub fn new(pid: u32, visible: bool, model: Option<String>) -> Self {
        Self {
            pid,
            status: AgentStatus::Running,
            last_reasoning: None,
            result: None,
            start_time: Utc::now(),
            visible,
            model,
            session_info: None,
        }
    }
}

/// Field group merged into a record by `AgentRegistry::update`.
///
/// Unset optional fields leave the record untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentUpdate {
    pub status: AgentStatus,
    pub last_reasoning: Option<String>,
    pub result: Option<String>,
    pub session_info: Option<serde_json::Value>,
}

impl AgentUpdate {
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status,
            last_reasoning: None,
            result: None,
            session_info: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.last_reasoning = Some(reasoning.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_session_info(mut self, info: serde_json::Value) -> Self {
        self.session_info = Some(info);
        self
    }
}
