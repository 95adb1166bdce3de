//! Agent invocation
//!
//! Runs one agent or a batch of agents in parallel through the dispatcher
//! and collects their responses. Requests arrive as JSON from tool calls, so
//! both an object and a JSON-encoded string of one are accepted.

use crate::agent::{AgentCatalog, AgentInfo};
use crate::dispatch::{Dispatcher, SpawnRequest};
use crate::{Result, WardenError, runtime};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Largest batch a single request may start
pub const MAX_PARALLEL_INVOCATIONS: usize = 10;

/// One agent to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(alias = "agent")]
    pub agent_name: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// A single invocation or a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InvocationRequest {
    Single(Invocation),
    Batch(Vec<Invocation>),
}

impl InvocationRequest {
    /// Accept an object, a list of objects, or a string holding either.
    pub fn parse(value: &Value) -> Result<Self> {
        if let Value::String(text) = value {
            let inner: Value = serde_json::from_str(text)?;
            if inner.is_string() {
                return Err(WardenError::Invocation(
                    "request is a doubly encoded string".to_string(),
                ));
            }
            return Self::parse(&inner);
        }
        serde_json::from_value(value.clone()).map_err(|e| {
            WardenError::Invocation(format!(
                "expected an invocation object or a list of them: {}",
                e
            ))
        })
    }

    pub fn parse_str(text: &str) -> Result<Self> {
        Self::parse(&serde_json::from_str::<Value>(text)?)
    }

    pub fn into_invocations(self) -> Vec<Invocation> {
        match self {
            InvocationRequest::Single(invocation) => vec![invocation],
            InvocationRequest::Batch(batch) => batch,
        }
    }
}

/// What one invocation produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationOutput {
    pub agent_name: String,
    /// `None` if the agent never started
    pub agent_id: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl InvocationOutput {
    fn failed(agent_name: String, agent_id: Option<String>, error: String) -> Self {
        Self {
            agent_name,
            agent_id,
            response: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs invocations through a dispatcher
pub struct Invoker {
    dispatcher: Arc<Dispatcher>,
    catalog: AgentCatalog,
    /// Per-invocation wait limit; `None` uses the dispatcher timeout
    timeout: Option<Duration>,
}

impl Invoker {
    pub fn new(dispatcher: Arc<Dispatcher>, catalog: AgentCatalog) -> Self {
        Self {
            dispatcher,
            catalog,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Agents that can be invoked.
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.catalog.list()
    }

    /// Run every invocation in parallel; outputs come back in request order.
    ///
    /// Oversized and empty batches are rejected before anything starts.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<Vec<InvocationOutput>> {
        let invocations = request.into_invocations();
        if invocations.len() > MAX_PARALLEL_INVOCATIONS {
            return Err(WardenError::TooManyInvocations {
                requested: invocations.len(),
                max: MAX_PARALLEL_INVOCATIONS,
            });
        }
        if invocations.is_empty() {
            return Err(WardenError::Invocation("no agents requested".to_string()));
        }

        tracing::info!(count = invocations.len(), "invoking agents");
        let runs = invocations.into_iter().map(|invocation| self.run(invocation));
        Ok(join_all(runs).await)
    }

    /// Blocking form of `invoke` for synchronous callers.
    pub fn invoke_blocking(&self, request: InvocationRequest) -> Result<Vec<InvocationOutput>> {
        runtime::block_on(self.invoke(request))?
    }

    async fn run(&self, invocation: Invocation) -> InvocationOutput {
        let Invocation {
            agent_name,
            prompt,
            model,
        } = invocation;

        if !self.catalog.contains(&agent_name) {
            let known: Vec<_> = self.catalog.list().into_iter().map(|a| a.name).collect();
            return InvocationOutput::failed(
                agent_name.clone(),
                None,
                format!("Unknown agent '{}'. Available: {}", agent_name, known.join(", ")),
            );
        }

        let mut request = SpawnRequest::new(agent_name.as_str(), prompt);
        request.model = model;
        let result = match self.dispatcher.spawn_and_wait(request, self.timeout).await {
            Ok(result) => result,
            Err(e) => return InvocationOutput::failed(agent_name, None, e.to_string()),
        };
        let agent_id = result.agent_id.clone();

        if result.success() {
            InvocationOutput {
                agent_name,
                agent_id: Some(agent_id),
                response: Some(result.stdout.trim_end().to_string()),
                error: None,
            }
        } else {
            let error = if result.stderr.trim().is_empty() {
                format!("Agent exited with code {}", result.exit_code)
            } else {
                result.stderr.trim_end().to_string()
            };
            InvocationOutput {
                agent_name,
                agent_id: Some(agent_id),
                response: (!result.stdout.is_empty()).then(|| result.stdout.trim_end().to_string()),
                error: Some(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRegistry;
    use crate::config::{DispatcherConfig, EntryPoint};
    use crate::dispatch::SharedHistory;
    use crate::process::testing::{FakeLauncher, FakeProbe};
    use serde_json::json;

    fn invoker() -> (Invoker, Arc<FakeLauncher>) {
        let config = DispatcherConfig {
            grace_period_secs: 0,
            poll_interval_ms: 1,
            entry_point: EntryPoint::new("/usr/bin/warden", Vec::new()),
            ..DispatcherConfig::default()
        };
        let launcher = Arc::new(FakeLauncher::new());
        let dispatcher = Dispatcher::new(
            config,
            Arc::new(AgentRegistry::new(Arc::new(FakeProbe::new()))),
            launcher.clone(),
            Arc::new(FakeProbe::new()),
            Arc::new(SharedHistory::new()),
        );
        (Invoker::new(Arc::new(dispatcher), AgentCatalog::new()), launcher)
    }

    /// Exit every launched child with its prompt echoed, until `count` ran.
    async fn answer_all(launcher: Arc<FakeLauncher>, count: usize) {
        let mut answered = 0;
        while answered < count {
            while launcher.launch_count() > answered {
                let (_, spec, control) = launcher.launched(answered);
                let invocation = crate::dispatch::ChildInvocation::from_args(spec.args).unwrap();
                if invocation.prompt == "fail" {
                    control.set_output("", "it broke\n");
                    control.exit(1);
                } else {
                    control.set_output(&format!("echo: {}\n", invocation.prompt), "");
                    control.exit(0);
                }
                answered += 1;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn test_parse_single_batch_and_string() {
        let single = InvocationRequest::parse(&json!({"agent_name": "codex", "prompt": "hi"})).unwrap();
        assert_eq!(single.into_invocations().len(), 1);

        let batch = InvocationRequest::parse(&json!([
            {"agent_name": "codex", "prompt": "a"},
            {"agent": "aider", "prompt": "b", "model": "gpt"}
        ]))
        .unwrap()
        .into_invocations();
        assert_eq!(batch[1].agent_name, "aider");
        assert_eq!(batch[1].model.as_deref(), Some("gpt"));

        let encoded = json!(r#"{"agent_name": "codex", "prompt": "hi"}"#);
        assert_eq!(
            InvocationRequest::parse(&encoded).unwrap(),
            InvocationRequest::Single(Invocation {
                agent_name: "codex".to_string(),
                prompt: "hi".to_string(),
                model: None,
            })
        );
    }

    #[test]
    fn test_parse_rejects_scalars() {
        assert!(InvocationRequest::parse(&json!(42)).is_err());
        assert!(InvocationRequest::parse(&json!({"prompt": "no agent"})).is_err());
        assert!(InvocationRequest::parse(&json!("not json")).is_err());
        assert!(InvocationRequest::parse_str("true").is_err());
    }

    #[tokio::test]
    async fn test_batch_too_large_spawns_nothing() {
        let (invoker, launcher) = invoker();
        let batch = (0..11)
            .map(|i| Invocation {
                agent_name: "codex".to_string(),
                prompt: format!("task {}", i),
                model: None,
            })
            .collect();

        let err = invoker.invoke(InvocationRequest::Batch(batch)).await.unwrap_err();

        assert!(matches!(err, WardenError::TooManyInvocations { requested: 11, max: 10 }));
        assert_eq!(err.to_string(), "Too many agents requested (11). Maximum is 10.");
        assert_eq!(launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let (invoker, _) = invoker();
        assert!(invoker.invoke(InvocationRequest::Batch(Vec::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_parallel_batch_in_request_order() {
        let (invoker, launcher) = invoker();
        let answers = tokio::spawn(answer_all(launcher.clone(), 3));
        let request = InvocationRequest::parse(&json!([
            {"agent_name": "codex", "prompt": "one"},
            {"agent_name": "claude-code", "prompt": "fail"},
            {"agent_name": "aider", "prompt": "three"}
        ]))
        .unwrap();

        let outputs = invoker.invoke(request).await.unwrap();
        answers.await.unwrap();

        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].agent_name, "codex");
        assert_eq!(outputs[0].response.as_deref(), Some("echo: one"));
        assert!(outputs[0].is_success());
        assert_eq!(outputs[1].error.as_deref(), Some("it broke"));
        assert!(outputs[1].agent_id.is_some());
        assert_eq!(outputs[2].response.as_deref(), Some("echo: three"));
    }

    #[tokio::test]
    async fn test_batch_alongside_background_poller() {
        let (invoker, launcher) = invoker();
        let poller = invoker.dispatcher.start_poller();
        let answers = tokio::spawn(answer_all(launcher.clone(), 2));
        let request = InvocationRequest::parse(&json!([
            {"agent_name": "codex", "prompt": "one"},
            {"agent_name": "aider", "prompt": "two"}
        ]))
        .unwrap();

        let outputs = invoker.invoke(request).await.unwrap();
        answers.await.unwrap();
        poller.stop().await;

        assert!(outputs.iter().all(InvocationOutput::is_success));
        assert_eq!(outputs[0].response.as_deref(), Some("echo: one"));
        assert_eq!(outputs[1].response.as_deref(), Some("echo: two"));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_a_per_item_error() {
        let (invoker, launcher) = invoker();
        let answers = tokio::spawn(answer_all(launcher.clone(), 1));
        let request = InvocationRequest::parse(&json!([
            {"agent_name": "nonexistent", "prompt": "x"},
            {"agent_name": "codex", "prompt": "y"}
        ]))
        .unwrap();

        let outputs = invoker.invoke(request).await.unwrap();
        answers.await.unwrap();

        assert!(outputs[0].agent_id.is_none());
        assert!(outputs[0].error.as_deref().unwrap().contains("Unknown agent 'nonexistent'"));
        assert!(outputs[1].is_success());
        assert_eq!(launcher.launch_count(), 1);
    }

    #[test]
    fn test_list_agents() {
        let (invoker, _) = invoker();
        let names: Vec<_> = invoker.list_agents().into_iter().map(|a| a.name).collect();
        assert!(names.contains(&"claude-code".to_string()));
        assert!(names.contains(&"codex".to_string()));
    }

    #[test]
    fn test_invoke_blocking_from_sync_code() {
        let (invoker, launcher) = invoker();
        let answerer = std::thread::spawn(move || {
            runtime::block_on(answer_all(launcher, 1)).unwrap();
        });
        let request = InvocationRequest::parse_str(r#"{"agent_name": "codex", "prompt": "sync"}"#).unwrap();

        let outputs = invoker.invoke_blocking(request).unwrap();
        answerer.join().unwrap();

        assert_eq!(outputs[0].response.as_deref(), Some("echo: sync"));
    }
}
