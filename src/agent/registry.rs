//! Agent registry - thread-safe map of agent id to lifecycle record

use super::{AgentRecord, AgentStatus, AgentUpdate};
use crate::process::{Liveness, ProcessProbe, SystemProbe};
use crate::{Result, WardenError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Result recorded when reconciliation finds the pid gone.
pub const RESULT_UNEXPECTED_EXIT: &str = "Process unexpectedly terminated";
/// Result recorded when reconciliation finds the pid zombified.
pub const RESULT_ZOMBIE: &str = "Process became a zombie";

static SHARED: OnceCell<Arc<AgentRegistry>> = OnceCell::new();

/// Registry of agent lifecycle records.
///
/// Every operation takes the single lock for its whole read/modify/write
/// sequence, and every accessor hands out copies, so no caller ever sees a
/// half-updated record or holds a reference into the map.
pub struct AgentRegistry {
    records: Mutex<HashMap<String, AgentRecord>>,
    probe: Arc<dyn ProcessProbe>,
}

impl AgentRegistry {
    pub fn new(probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            probe,
        }
    }

    /// Process-wide registry backed by the OS process table.
    pub fn shared() -> Arc<AgentRegistry> {
        SHARED
            .get_or_init(|| Arc::new(AgentRegistry::new(Arc::new(SystemProbe::new()))))
            .clone()
    }

    /// Register a freshly spawned agent as `Running`.
    pub fn add(&self, agent_id: &str, pid: u32, visible: bool, model: Option<String>) -> Result<()> {
        let mut records = self.records.lock();
        if records.contains_key(agent_id) {
            return Err(WardenError::DuplicateAgent(agent_id.to_string()));
        }
        records.insert(agent_id.to_string(), AgentRecord::new(pid, visible, model));
        tracing::debug!(agent_id, pid, "agent registered");
        Ok(())
    }

    /// Merge an update into an existing record.
    ///
    /// A terminal record keeps its status when asked to go back to `Running`;
    /// the other provided fields are still applied.
    pub fn update(&self, agent_id: &str, update: AgentUpdate) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(agent_id)
            .ok_or_else(|| WardenError::NotFound(agent_id.to_string()))?;

        if record.status.is_terminal() && update.status == AgentStatus::Running {
            tracing::debug!(
                agent_id,
                status = %record.status,
                "ignoring transition back to running"
            );
        } else {
            record.status = update.status;
        }
        if let Some(reasoning) = update.last_reasoning {
            record.last_reasoning = Some(reasoning);
        }
        if let Some(result) = update.result {
            record.result = Some(result);
        }
        if let Some(info) = update.session_info {
            record.session_info = Some(info);
        }
        Ok(())
    }

    /// Snapshot of one record.
    pub fn get(&self, agent_id: &str) -> Result<AgentRecord> {
        self.records
            .lock()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| WardenError::NotFound(agent_id.to_string()))
    }

    /// Snapshot of every record, for status reporters.
    pub fn list(&self) -> Vec<(String, AgentRecord)> {
        let mut out: Vec<_> = self
            .records
            .lock()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        out.sort_by(|a, b| a.1.start_time.cmp(&b.1.start_time));
        out
    }

    /// Remove a record. Removing an unknown id is a no-op.
    pub fn remove(&self, agent_id: &str) {
        self.records.lock().remove(agent_id);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Compare every `Running` record against the OS process table.
    ///
    /// Missing or zombie pids become `Terminated`. Terminal records are
    /// never touched, and a probe failure only skips that record until the
    /// next sweep.
    pub fn reconcile(&self) {
        let mut records = self.records.lock();
        for (agent_id, record) in records.iter_mut() {
            if record.status != AgentStatus::Running {
                continue;
            }
            let explanation = match self.probe.inspect(record.pid) {
                Ok(Liveness::Alive) => continue,
                Ok(Liveness::Missing) => RESULT_UNEXPECTED_EXIT,
                Ok(Liveness::Zombie) => RESULT_ZOMBIE,
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, pid = record.pid, "probe failed: {}", e);
                    continue;
                }
            };
            tracing::info!(agent_id = %agent_id, pid = record.pid, "{}", explanation);
            record.status = AgentStatus::Terminated;
            record.result = Some(explanation.to_string());
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemProbe::new()))
    }
}
