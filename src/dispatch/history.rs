//! Process results and where they are recorded

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome of a finished (or abandoned) agent process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub agent_id: String,
    pub stdout: String,
    pub stderr: String,
    /// -1 when the process timed out or could not be waited on
    pub exit_code: i32,
    pub completed_at: DateTime<Utc>,
}

impl ProcessResult {
    pub fn new(agent_id: impl Into<String>, stdout: String, stderr: String, exit_code: i32) -> Self {
        Self {
            agent_id: agent_id.into(),
            stdout,
            stderr,
            exit_code,
            completed_at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// We gave up on the process rather than it exiting on its own.
    pub fn is_abandoned(&self) -> bool {
        self.exit_code == -1 && !self.stderr.is_empty()
    }
}

/// Sink for process results
///
/// Picked once when the dispatcher is built: a single shared log, or one
/// log per agent.
pub trait MessageHistory: Send + Sync {
    fn append(&self, result: &ProcessResult);

    /// Every recorded result, oldest first.
    fn entries(&self) -> Vec<ProcessResult>;
}

/// One log for all agents
#[derive(Default)]
pub struct SharedHistory {
    entries: Mutex<Vec<ProcessResult>>,
}

impl SharedHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageHistory for SharedHistory {
    fn append(&self, result: &ProcessResult) {
        self.entries.lock().push(result.clone());
    }

    fn entries(&self) -> Vec<ProcessResult> {
        self.entries.lock().clone()
    }
}

/// A separate log per agent id
#[derive(Default)]
pub struct AgentHistory {
    by_agent: Mutex<HashMap<String, Vec<ProcessResult>>>,
}

impl AgentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_agent(&self, agent_id: &str) -> Vec<ProcessResult> {
        self.by_agent
            .lock()
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl MessageHistory for AgentHistory {
    fn append(&self, result: &ProcessResult) {
        self.by_agent
            .lock()
            .entry(result.agent_id.clone())
            .or_default()
            .push(result.clone());
    }

    fn entries(&self) -> Vec<ProcessResult> {
        let mut all: Vec<_> = self.by_agent.lock().values().flatten().cloned().collect();
        all.sort_by_key(|r| r.completed_at);
        all
    }
}
