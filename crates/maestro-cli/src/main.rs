//! `maestro` command-line entry point: validate and run workflow files.

use clap::{Parser, Subcommand};
use maestro_orchestrator::{
    check_workflow, ExecutionStatus, LoopbackConnector, Orchestrator, OrchestratorConfig, Payload,
    WorkflowDefinition,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro: multi-agent task and workflow orchestrator")]
struct Cli {
    /// Path to config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file without running it
    Validate {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },
    /// Run a workflow against in-process loopback agents
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Input data as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// List the agents declared in the config
    Agents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };

    match cli.command {
        Commands::Validate { workflow } => {
            let def = WorkflowDefinition::load(&workflow).map_err(|e| {
                anyhow::anyhow!("Failed to load workflow '{}': {e}", workflow.display())
            })?;
            let errors = check_workflow(&def);
            if errors.is_empty() {
                println!(
                    "Workflow '{}' is valid: {} nodes, {} connections, entry nodes {:?}",
                    def.id,
                    def.node_count(),
                    def.connections().len(),
                    def.entry_nodes()
                );
            } else {
                println!("Workflow '{}' is invalid:", def.id);
                for error in &errors {
                    println!("  - {error}");
                }
                anyhow::bail!("{} validation error(s)", errors.len());
            }
        }
        Commands::Run {
            workflow,
            input,
            timeout_secs,
        } => {
            let def = WorkflowDefinition::load(&workflow).map_err(|e| {
                anyhow::anyhow!("Failed to load workflow '{}': {e}", workflow.display())
            })?;
            let input: Payload = serde_json::from_str(&input)
                .map_err(|e| anyhow::anyhow!("--input must be a JSON object: {e}"))?;

            let orchestrator =
                Orchestrator::new(config, Arc::new(LoopbackConnector::new())).await?;
            orchestrator.start();

            let workflows = orchestrator.workflows();
            let workflow_id = def.id.clone();
            workflows.register_workflow(def)?;
            let execution_id = workflows.execute_workflow(&workflow_id, input)?;
            info!(execution_id = %execution_id, workflow = %workflow_id, "Execution launched");

            let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            let status = loop {
                ticker.tick().await;
                let Some(progress) = workflows.get_execution_progress(execution_id) else {
                    anyhow::bail!("execution {execution_id} disappeared");
                };
                println!("{}", serde_json::to_string(&progress)?);
                if progress.status.is_terminal() {
                    break progress.status;
                }
                if tokio::time::Instant::now() >= deadline {
                    workflows.cancel_execution(execution_id)?;
                    break ExecutionStatus::Cancelled;
                }
            };

            if let Some(execution) = workflows.get_execution(execution_id) {
                println!("{}", serde_json::to_string_pretty(&execution.snapshot())?);
            }
            orchestrator.stop().await;

            if status != ExecutionStatus::Completed {
                anyhow::bail!("execution {execution_id} ended {status}");
            }
        }
        Commands::Agents => {
            if config.agents.is_empty() {
                println!("No agents configured.");
                println!("Declare agents in the config under [[agents]]");
            } else {
                println!("Configured agents:");
                for agent in &config.agents {
                    println!("  {}: {}", agent.id, agent.capabilities.join(", "));
                }
            }
        }
    }

    Ok(())
}
