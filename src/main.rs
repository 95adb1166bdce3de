use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::sync::Arc;
use std::time::Duration;
use warden::agent::{AgentCatalog, AgentRegistry};
use warden::cli::{Cli, Commands};
use warden::config::WardenConfig;
use warden::dispatch::{ChildInvocation, Dispatcher, SharedHistory, SpawnRequest};
use warden::invoke::{InvocationRequest, Invoker};
use warden::runtime;

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries results.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warden=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(invocation) = cli.child.invocation()? {
        let code = run_child(&invocation)?;
        std::process::exit(code);
    }

    let config = WardenConfig::default();
    config.validate()?;

    match cli.command {
        Some(Commands::Spawn {
            agent,
            prompt,
            model,
            timeout,
            visible,
        }) => {
            let mut dispatcher_config = config.dispatcher.clone();
            if let Some(secs) = timeout {
                dispatcher_config.timeout_secs = secs;
            }

            let code = runtime::block_on(async move {
                let dispatcher = Dispatcher::with_system(
                    dispatcher_config,
                    AgentRegistry::shared(),
                    Arc::new(SharedHistory::new()),
                );
                let mut request = SpawnRequest::new(agent, prompt).visible(visible);
                request.model = model;

                let result = dispatcher.spawn_and_wait(request, None).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
                anyhow::Ok(result.exit_code)
            })??;
            std::process::exit(code);
        }

        Some(Commands::Invoke { request, timeout }) => {
            let request = InvocationRequest::parse_str(&request)
                .with_context(|| "invalid invocation request")?;
            let dispatcher = Dispatcher::with_system(
                config.dispatcher.clone(),
                AgentRegistry::shared(),
                Arc::new(SharedHistory::new()),
            );
            let mut invoker = Invoker::new(Arc::new(dispatcher), AgentCatalog::new());
            if let Some(secs) = timeout {
                invoker = invoker.with_timeout(Duration::from_secs(secs));
            }

            let outputs = invoker.invoke_blocking(request)?;
            println!("{}", serde_json::to_string_pretty(&outputs)?);
            if outputs.iter().any(|o| !o.is_success()) {
                std::process::exit(1);
            }
        }

        Some(Commands::Agents) => {
            println!("Available agents:");
            for agent in AgentCatalog::new().list() {
                println!("  {:<14} {}", agent.name, agent.display_name);
            }
        }

        None => {
            Cli::command().print_help()?;
        }
    }

    Ok(())
}

/// Child mode: run the agent CLI for one task with our stdio and report its
/// exit code.
fn run_child(invocation: &ChildInvocation) -> Result<i32> {
    let profile = AgentCatalog::new().resolve(&invocation.agent_name);
    let (program, args) = profile.command_line(&invocation.prompt, invocation.model.as_deref());
    tracing::info!(
        task_id = %invocation.task_id,
        agent = %invocation.agent_name,
        program = %program,
        "running agent task"
    );

    let status = std::process::Command::new(&program)
        .args(&args)
        .status()
        .with_context(|| format!("failed to run {}", program))?;
    Ok(warden::process::exit_code_of(status))
}
