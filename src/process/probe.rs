//! OS-level liveness checks

use crate::Result;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// What the OS process table says about a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// No such pid
    Missing,
    /// Exited but not yet reaped
    Zombie,
}

/// Ground-truth source for "is this pid still alive".
pub trait ProcessProbe: Send + Sync {
    fn inspect(&self, pid: u32) -> Result<Liveness>;
}

/// Probe backed by the OS process table.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn inspect(&self, pid: u32) -> Result<Liveness> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        // Only refresh the pid we care about; dead entries are dropped.
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        Ok(match system.process(pid) {
            None => Liveness::Missing,
            Some(process) if process.status() == ProcessStatus::Zombie => Liveness::Zombie,
            Some(_) => Liveness::Alive,
        })
    }
}
