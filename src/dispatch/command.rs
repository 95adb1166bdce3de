//! Child process command line
//!
//! The dispatcher re-launches the entry point in child mode. Everything the
//! child needs is passed as `--key=value` flags so values starting with `-`
//! survive parsing.

use crate::config::EntryPoint;
use crate::process::LaunchSpec;
use crate::{Result, WardenError};
use clap::{Args, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

/// Hidden flags understood by the binary in child mode
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildArgs {
    /// Run a single agent task and exit
    #[arg(long = "child-mode", hide = true)]
    pub child_mode: bool,

    #[arg(long = "task-id", hide = true, requires = "child_mode")]
    pub task_id: Option<String>,

    #[arg(long = "agent", hide = true, requires = "child_mode")]
    pub agent: Option<String>,

    #[arg(long = "prompt", hide = true, requires = "child_mode", allow_hyphen_values = true)]
    pub prompt: Option<String>,

    #[arg(long = "model", hide = true, requires = "child_mode")]
    pub model: Option<String>,
}

impl ChildArgs {
    /// The task to run, or `None` when not in child mode.
    pub fn invocation(&self) -> Result<Option<ChildInvocation>> {
        if !self.child_mode {
            return Ok(None);
        }
        let require = |value: &Option<String>, flag: &str| {
            value
                .clone()
                .ok_or_else(|| WardenError::Invocation(format!("child mode requires --{}", flag)))
        };
        Ok(Some(ChildInvocation {
            task_id: require(&self.task_id, "task-id")?,
            agent_name: require(&self.agent, "agent")?,
            prompt: require(&self.prompt, "prompt")?,
            model: self.model.clone(),
        }))
    }
}

#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct ChildCommand {
    #[command(flatten)]
    child: ChildArgs,
}

/// What a child process was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInvocation {
    pub task_id: String,
    pub agent_name: String,
    pub prompt: String,
    pub model: Option<String>,
}

impl ChildInvocation {
    /// Recover the invocation from child-mode flags (without the program name).
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let parsed = ChildCommand::try_parse_from(args)
            .map_err(|e| WardenError::Invocation(e.to_string()))?;
        parsed
            .child
            .invocation()?
            .ok_or_else(|| WardenError::Invocation("missing --child-mode".to_string()))
    }
}

/// Command line that launches one agent task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: PathBuf,
    /// Entry-point arguments placed before the child flags
    pub base_args: Vec<String>,
    pub task_id: String,
    pub agent_name: String,
    pub prompt: String,
    pub model: Option<String>,
}

impl AgentCommand {
    pub fn new(
        entry_point: &EntryPoint,
        task_id: impl Into<String>,
        agent_name: impl Into<String>,
        prompt: impl Into<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            program: entry_point.program.clone(),
            base_args: entry_point.args.clone(),
            task_id: task_id.into(),
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            model,
        }
    }

    /// Just the child-mode flags.
    pub fn child_args(&self) -> Vec<String> {
        let mut args = vec![
            "--child-mode".to_string(),
            format!("--task-id={}", self.task_id),
            format!("--agent={}", self.agent_name),
            format!("--prompt={}", self.prompt),
        ];
        if let Some(model) = &self.model {
            args.push(format!("--model={}", model));
        }
        args
    }

    /// Full argument vector after the program.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend(self.child_args());
        args
    }

    pub fn to_launch_spec(&self, visible: bool) -> LaunchSpec {
        LaunchSpec {
            program: self.program.clone(),
            args: self.args(),
            visible,
        }
    }
}
