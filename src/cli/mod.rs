//! CLI command definitions

use crate::dispatch::ChildArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Spawn and supervise coding agents", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Flags used when the dispatcher re-launches us for one agent task
    #[command(flatten)]
    pub child: ChildArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Spawn an agent, wait for it and print its result as JSON
    Spawn {
        /// Agent type (claude-code, opencode, codex, aider, amp)
        agent: String,

        /// Task for the agent
        prompt: String,

        /// Model to ask the agent to use
        #[arg(short, long)]
        model: Option<String>,

        /// Seconds before the agent is shut down (default 300)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Run in a terminal and mirror its output
        #[arg(long)]
        visible: bool,
    },

    /// Run one or more agents in parallel from a JSON request
    Invoke {
        /// `{"agent_name": .., "prompt": ..}` or a list of those (max 10)
        request: String,

        /// Seconds each agent may run
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// List the agents that can be invoked
    Agents,
}
