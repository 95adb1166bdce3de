//! Process dispatcher
//!
//! Spawns agent processes, keeps a handle on each, and keeps the agent
//! registry truthful: exits, vanished pids, zombies and overdue processes
//! are all written through to the registry as terminal states.

mod command;
mod handle;
mod history;
mod poller;

pub use command::{AgentCommand, ChildArgs, ChildInvocation};
pub use handle::ProcessHandle;
pub use history::{AgentHistory, MessageHistory, ProcessResult, SharedHistory};
pub use poller::Poller;

use crate::agent::{
    AgentRegistry, AgentStatus, AgentUpdate, RESULT_UNEXPECTED_EXIT, RESULT_ZOMBIE,
};
use crate::config::DispatcherConfig;
use crate::process::{Liveness, ProcessLauncher, ProcessProbe, SystemLauncher, SystemProbe};
use crate::{Result, WardenError};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type SharedHandle = Arc<Mutex<ProcessHandle>>;

/// Request to start one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub agent_name: String,
    pub prompt: String,
    /// Return as soon as the process is started instead of waiting for it
    pub background: bool,
    pub visible: bool,
    pub model: Option<String>,
}

impl SpawnRequest {
    /// A hidden background spawn.
    pub fn new(agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            background: true,
            visible: false,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Block in `spawn` until the process exits.
    pub fn foreground(mut self) -> Self {
        self.background = false;
        self
    }
}

/// Dispatcher-local view of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub running: bool,
    /// `None` while running, or when the process ended without a known code
    pub exit_code: Option<i32>,
}

enum PollOutcome {
    Running,
    Exited(i32),
    Gone(&'static str),
}

/// Owns the lifecycle of locally spawned agent processes
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<AgentRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn ProcessProbe>,
    history: Arc<dyn MessageHistory>,
    handles: Mutex<HashMap<String, SharedHandle>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<AgentRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn ProcessProbe>,
        history: Arc<dyn MessageHistory>,
    ) -> Self {
        Self {
            config,
            registry,
            launcher,
            probe,
            history,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatcher backed by real processes and the OS process table.
    pub fn with_system(
        config: DispatcherConfig,
        registry: Arc<AgentRegistry>,
        history: Arc<dyn MessageHistory>,
    ) -> Self {
        let launcher = Arc::new(SystemLauncher::new(config.output_drain()));
        Self::new(config, registry, launcher, Arc::new(SystemProbe::new()), history)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &Arc<dyn MessageHistory> {
        &self.history
    }

    /// Start an agent process and register it.
    ///
    /// Returns the new agent id. A foreground request also waits for the
    /// process to exit (see `monitor`). If the process cannot be started,
    /// or cannot be registered, nothing is left behind.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<String> {
        let (agent_id, handle) = self.start(&request).await?;
        if request.background {
            drop(handle);
        } else {
            self.reap(&agent_id, handle, None).await;
        }
        Ok(agent_id)
    }

    /// Start an agent and wait for its result in one step.
    ///
    /// The handle stays locked from launch until the result is collected,
    /// so a concurrent `poll` or `terminate_hanging` cannot reap it first.
    /// `request.background` is ignored; `timeout` behaves as in `wait`.
    pub async fn spawn_and_wait(
        &self,
        request: SpawnRequest,
        timeout: Option<Duration>,
    ) -> Result<ProcessResult> {
        let (agent_id, handle) = self.start(&request).await?;
        let timeout = timeout.unwrap_or_else(|| self.config.timeout());
        Ok(self.reap(&agent_id, handle, Some(timeout)).await)
    }

    /// Wait for a process to exit and collect its output.
    ///
    /// Returns `None` if the id is not tracked by this dispatcher.
    pub async fn monitor(&self, agent_id: &str) -> Option<ProcessResult> {
        let handle = self.handle(agent_id).await?.lock_owned().await;
        if handle.reaped {
            return None;
        }
        Some(self.reap(agent_id, handle, None).await)
    }

    /// Like `monitor`, but gives up after `timeout` (default: the configured
    /// dispatcher timeout), shuts the process down and returns a result with
    /// exit code -1.
    pub async fn wait(&self, agent_id: &str, timeout: Option<Duration>) -> Option<ProcessResult> {
        let timeout = timeout.unwrap_or_else(|| self.config.timeout());
        let handle = self.handle(agent_id).await?.lock_owned().await;
        if handle.reaped {
            return None;
        }
        Some(self.reap(agent_id, handle, Some(timeout)).await)
    }

    /// Shut down every process that has outlived the dispatcher timeout.
    ///
    /// Each gets SIGTERM, then SIGKILL after the grace period. Returns the
    /// ids of the terminated agents.
    pub async fn terminate_hanging(&self) -> Vec<String> {
        let timeout = self.config.timeout();
        let mut overdue = Vec::new();
        for (agent_id, shared) in self.snapshot().await {
            // Someone is already waiting on it; their timeout applies.
            let Ok(mut handle) = shared.try_lock_owned() else {
                continue;
            };
            if handle.reaped || !handle.is_overdue(timeout) {
                continue;
            }
            match handle.child.try_exit_code() {
                Ok(None) => overdue.push((agent_id, handle)),
                // Exited on its own; poll records the exit code.
                Ok(Some(_)) => {}
                Err(e) => tracing::debug!(agent_id = %agent_id, "exit check failed: {}", e),
            }
        }
        if overdue.is_empty() {
            return Vec::new();
        }

        let shutdowns = overdue
            .into_iter()
            .map(|(agent_id, handle)| self.terminate_overdue(agent_id, handle));
        let mut terminated = join_all(shutdowns).await;
        terminated.sort();

        let reason = format!("Process exceeded timeout of {}s", timeout.as_secs_f64());
        for agent_id in &terminated {
            self.untrack(agent_id).await;
            self.write_through(
                agent_id,
                AgentUpdate::status(AgentStatus::Terminated).with_result(reason.as_str()),
            );
        }
        terminated
    }

    /// Reconcile every tracked handle against its exit code and the OS
    /// process table, then let the registry sweep everything else.
    pub async fn poll(&self) {
        for (agent_id, shared) in self.snapshot().await {
            let Ok(mut handle) = shared.try_lock() else {
                // Being waited on by monitor/wait.
                continue;
            };
            if handle.reaped {
                continue;
            }

            let outcome = match handle.child.try_exit_code() {
                Ok(Some(code)) => PollOutcome::Exited(code),
                Ok(None) => match self.probe.inspect(handle.pid) {
                    Ok(Liveness::Alive) => PollOutcome::Running,
                    // Our own child may have exited between the two checks.
                    Ok(liveness) => match handle.child.try_exit_code() {
                        Ok(Some(code)) => PollOutcome::Exited(code),
                        _ if liveness == Liveness::Zombie => PollOutcome::Gone(RESULT_ZOMBIE),
                        _ => PollOutcome::Gone(RESULT_UNEXPECTED_EXIT),
                    },
                    Err(e) => {
                        tracing::warn!(agent_id = %agent_id, pid = handle.pid, "probe failed: {}", e);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, pid = handle.pid, "exit check failed: {}", e);
                    continue;
                }
            };

            let (result, update) = match outcome {
                PollOutcome::Running => {
                    drop(handle);
                    self.write_through(&agent_id, AgentUpdate::status(AgentStatus::Running));
                    continue;
                }
                PollOutcome::Exited(code) => {
                    let (result, update) = Self::exited(&agent_id, &mut handle, code).await;
                    (Some(result), update)
                }
                PollOutcome::Gone(reason) => {
                    tracing::warn!(agent_id = %agent_id, pid = handle.pid, "{}", reason);
                    (None, AgentUpdate::status(AgentStatus::Terminated).with_result(reason))
                }
            };
            handle.reaped = true;
            drop(handle);
            match result {
                Some(result) => self.finish(&agent_id, &result, update).await,
                None => {
                    self.untrack(&agent_id).await;
                    self.write_through(&agent_id, update);
                }
            }
        }

        self.registry.reconcile();
    }

    /// Running state and exit code of a tracked process; `None` if this
    /// dispatcher does not track the id.
    pub async fn status(&self, agent_id: &str) -> Option<ProcessStatus> {
        let shared = self.handle(agent_id).await?;
        let Ok(mut handle) = shared.try_lock() else {
            // Locked by a waiter, so it has not been reaped yet.
            return Some(ProcessStatus {
                running: true,
                exit_code: None,
            });
        };
        Some(match handle.child.try_exit_code() {
            Ok(None) => ProcessStatus {
                running: true,
                exit_code: None,
            },
            Ok(Some(code)) => ProcessStatus {
                running: false,
                exit_code: Some(code),
            },
            Err(_) => ProcessStatus {
                running: false,
                exit_code: None,
            },
        })
    }

    /// Ids of the processes this dispatcher currently tracks, sorted.
    pub async fn tracked_agents(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.handles.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run `poll` and `terminate_hanging` every `poll_interval_ms` in the
    /// background.
    pub fn start_poller(self: &Arc<Self>) -> Poller {
        let interval = self.config.poll_interval().max(Duration::from_millis(1));
        Poller::spawn(self.clone(), interval)
    }

    /// Launch and register a process, returning its handle already locked.
    async fn start(
        &self,
        request: &SpawnRequest,
    ) -> Result<(String, OwnedMutexGuard<ProcessHandle>)> {
        let agent_id = Uuid::new_v4().to_string();
        let command = AgentCommand::new(
            &self.config.entry_point,
            &agent_id,
            &request.agent_name,
            &request.prompt,
            request.model.clone(),
        );

        let (pid, mut child) = self
            .launcher
            .launch(&command.to_launch_spec(request.visible))
            .map_err(|source| WardenError::Spawn {
                agent_name: request.agent_name.clone(),
                source,
            })?;

        if let Err(e) = self
            .registry
            .add(&agent_id, pid, request.visible, request.model.clone())
        {
            if let Err(kill_err) = child.kill().await {
                tracing::warn!(pid, "failed to kill unregistered child: {}", kill_err);
            }
            return Err(e);
        }

        let shared = Arc::new(Mutex::new(ProcessHandle::new(
            request.agent_name.as_str(),
            pid,
            child,
        )));
        let handle = shared.clone().lock_owned().await;
        self.handles.lock().await.insert(agent_id.clone(), shared);
        tracing::info!(
            agent_id = %agent_id,
            agent = %request.agent_name,
            pid,
            visible = request.visible,
            "spawned agent"
        );
        Ok((agent_id, handle))
    }

    /// Wait on a locked handle (bounded by `timeout` if given), record the
    /// outcome and stop tracking it.
    async fn reap(
        &self,
        agent_id: &str,
        mut handle: OwnedMutexGuard<ProcessHandle>,
        timeout: Option<Duration>,
    ) -> ProcessResult {
        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, handle.child.wait())
                .await
                .map_err(|_| limit),
            None => Ok(handle.child.wait().await),
        };
        let (result, update) = match waited {
            Ok(Ok(code)) => Self::exited(agent_id, &mut handle, code).await,
            Ok(Err(e)) => Self::wait_failed(agent_id, e),
            Err(limit) => {
                tracing::warn!(agent_id, pid = handle.pid, timeout = ?limit, "agent timed out");
                self.shut_down(agent_id, &mut handle).await;
                let output = handle.child.take_output().await;
                let message = format!("Process timed out after {}s", limit.as_secs_f64());
                (
                    ProcessResult::new(agent_id, output.stdout, message.clone(), -1),
                    AgentUpdate::status(AgentStatus::Terminated).with_result(message),
                )
            }
        };
        handle.reaped = true;
        drop(handle);

        self.finish(agent_id, &result, update).await;
        result
    }

    async fn handle(&self, agent_id: &str) -> Option<SharedHandle> {
        self.handles.lock().await.get(agent_id).cloned()
    }

    async fn snapshot(&self) -> Vec<(String, SharedHandle)> {
        self.handles
            .lock()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    async fn untrack(&self, agent_id: &str) {
        self.handles.lock().await.remove(agent_id);
    }

    /// Registry write that tolerates records removed by someone else.
    fn write_through(&self, agent_id: &str, update: AgentUpdate) {
        match self.registry.update(agent_id, update) {
            Ok(()) | Err(WardenError::NotFound(_)) => {}
            Err(e) => tracing::warn!(agent_id, "registry update failed: {}", e),
        }
    }

    async fn finish(&self, agent_id: &str, result: &ProcessResult, update: AgentUpdate) {
        self.untrack(agent_id).await;
        self.write_through(agent_id, update);
        self.history.append(result);
    }

    async fn exited(
        agent_id: &str,
        handle: &mut ProcessHandle,
        code: i32,
    ) -> (ProcessResult, AgentUpdate) {
        let output = handle.child.take_output().await;
        tracing::info!(agent_id, code, "agent finished");
        (
            ProcessResult::new(agent_id, output.stdout, output.stderr, code),
            AgentUpdate::status(AgentStatus::Completed)
                .with_result(format!("Process terminated with exit code {}", code)),
        )
    }

    fn wait_failed(agent_id: &str, error: std::io::Error) -> (ProcessResult, AgentUpdate) {
        let message = format!("Error waiting for process: {}", error);
        tracing::warn!(agent_id, "{}", message);
        (
            ProcessResult::new(agent_id, String::new(), message.clone(), -1),
            AgentUpdate::status(AgentStatus::Errored).with_result(message),
        )
    }

    /// SIGTERM, then SIGKILL if the process outlives the grace period.
    async fn shut_down(&self, agent_id: &str, handle: &mut ProcessHandle) {
        if let Err(e) = handle.child.terminate() {
            tracing::debug!(agent_id, pid = handle.pid, "terminate failed: {}", e);
        }
        let grace = self.config.grace_period();
        if tokio::time::timeout(grace, handle.child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(agent_id, pid = handle.pid, "still alive after {:?}, killing", grace);
        if let Err(e) = handle.child.kill().await {
            tracing::warn!(agent_id, pid = handle.pid, "kill failed: {}", e);
        }
    }

    async fn terminate_overdue(
        &self,
        agent_id: String,
        mut handle: OwnedMutexGuard<ProcessHandle>,
    ) -> String {
        tracing::warn!(
            agent_id = %agent_id,
            pid = handle.pid,
            elapsed = ?handle.elapsed(),
            "agent exceeded timeout"
        );
        self.shut_down(&agent_id, &mut handle).await;
        handle.reaped = true;
        agent_id
    }
}
