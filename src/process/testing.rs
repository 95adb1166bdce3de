//! Scriptable stand-ins for OS processes, used by unit tests.

use super::launcher::{ChildProcess, LaunchSpec, ProcessLauncher};
use super::probe::{Liveness, ProcessProbe};
use super::CapturedOutput;
use crate::{Result, WardenError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Probe answering from a table; unknown pids are alive.
#[derive(Default)]
pub struct FakeProbe {
    answers: Mutex<HashMap<u32, Option<Liveness>>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: u32, liveness: Liveness) {
        self.answers.lock().insert(pid, Some(liveness));
    }

    /// Make `inspect(pid)` return an error.
    pub fn fail(&self, pid: u32) {
        self.answers.lock().insert(pid, None);
    }
}

impl ProcessProbe for FakeProbe {
    fn inspect(&self, pid: u32) -> Result<Liveness> {
        match self.answers.lock().get(&pid) {
            Some(Some(liveness)) => Ok(*liveness),
            Some(None) => Err(WardenError::Probe(format!("cannot inspect pid {}", pid))),
            None => Ok(Liveness::Alive),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    exit_code: Option<i32>,
    try_wait_fails: bool,
    /// Exit code applied when SIGTERM arrives; `None` ignores SIGTERM.
    exit_on_terminate: Option<i32>,
    terminated: bool,
    killed: bool,
    output: CapturedOutput,
}

/// Remote control for a `FakeChild` after it has been handed to the dispatcher.
#[derive(Clone, Default)]
pub struct FakeControl {
    state: Arc<Mutex<FakeState>>,
}

impl FakeControl {
    pub fn exit(&self, code: i32) {
        self.state.lock().exit_code = Some(code);
    }

    pub fn set_output(&self, stdout: &str, stderr: &str) {
        self.state.lock().output = CapturedOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
    }

    pub fn ignore_terminate(&self) {
        self.state.lock().exit_on_terminate = None;
    }

    pub fn fail_try_wait(&self) {
        self.state.lock().try_wait_fails = true;
    }

    pub fn was_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn was_killed(&self) -> bool {
        self.state.lock().killed
    }
}

/// Child whose behaviour is driven through its `FakeControl`
pub struct FakeChild {
    control: FakeControl,
}

impl FakeChild {
    pub fn new() -> (Self, FakeControl) {
        let control = FakeControl::default();
        control.state.lock().exit_on_terminate = Some(143);
        (
            Self {
                control: control.clone(),
            },
            control,
        )
    }
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        let state = self.control.state.lock();
        if state.try_wait_fails {
            return Err(io::Error::other("try_wait failed"));
        }
        Ok(state.exit_code)
    }

    fn terminate(&mut self) -> io::Result<()> {
        let mut state = self.control.state.lock();
        state.terminated = true;
        if state.exit_code.is_none() {
            state.exit_code = state.exit_on_terminate;
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        let mut state = self.control.state.lock();
        state.killed = true;
        if state.exit_code.is_none() {
            state.exit_code = Some(137);
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<i32> {
        loop {
            let exit_code = self.control.state.lock().exit_code;
            if let Some(code) = exit_code {
                return Ok(code);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn take_output(&mut self) -> CapturedOutput {
        let output = std::mem::take(&mut self.control.state.lock().output);
        output
    }
}

/// Launcher producing `FakeChild`ren with sequential pids from 1000.
pub struct FakeLauncher {
    next_pid: AtomicU32,
    fail: AtomicBool,
    launched: Mutex<Vec<(u32, LaunchSpec, FakeControl)>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            fail: AtomicBool::new(false),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_launches(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Pid, spec and control of the `n`th launch.
    pub fn launched(&self, n: usize) -> (u32, LaunchSpec, FakeControl) {
        self.launched.lock()[n].clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().len()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<(u32, Box<dyn ChildProcess>)> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (child, control) = FakeChild::new();
        self.launched.lock().push((pid, spec.clone(), control));
        Ok((pid, Box::new(child)))
    }
}
