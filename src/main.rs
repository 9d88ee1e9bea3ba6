use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::config::ConductorConfig;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Durable workflow orchestrator with convergent review loops")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit log events as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also append JSON logs to <state dir>/logs/conductor.log
    #[arg(long, global = true)]
    pub log_file: bool,

    /// Override review.max_iterations from conductor.toml
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Override review.max_stalls from conductor.toml
    #[arg(long, global = true)]
    pub max_stalls: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new workflow in the project directory
    Init {
        /// Workflow type recorded on the document
        #[arg(long, default_value = "feature")]
        workflow_type: String,
        /// Task descriptor as JSON
        #[arg(long)]
        task: Option<String>,
        /// Where the task came from
        #[arg(long)]
        task_source: Option<String>,
        #[arg(long)]
        auto_merge: bool,
    },
    /// Show workflow status and where a resumed run would start
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Start a phase
    Start { phase: String },
    /// Complete the in-progress phase
    Complete {
        /// Phase result as JSON
        #[arg(long)]
        result: Option<String>,
    },
    /// Fail the in-progress phase
    Fail {
        reason: String,
        /// Resume context as JSON
        #[arg(long)]
        context: Option<String>,
    },
    /// Skip forward to a phase
    Skip {
        target: String,
        #[arg(long, default_value = "skipped by operator")]
        reason: String,
    },
    /// Abort the workflow
    Abort { reason: String },
    /// Mark the workflow completed
    Finish,
    /// Merge a JSON payload into an agent record
    Agent { name: String, payload: String },
    /// Move a finished workflow into the archive
    Archive,
    /// Run the review loop over the given files
    Review {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Print the convergence report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or reopen the persisted review queue
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// Show the queue and its open findings
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Clear a blocked queue so the next review continues it
    Reopen,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default conductor.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = ConductorConfig::with_cli_args(
        project_dir,
        cli.verbose,
        cli.max_iterations,
        cli.max_stalls,
    )?;
    let log_dir = cli.log_file.then(|| config.log_dir());
    let _log_guard = conductor::logging::init(cli.verbose, cli.log_json, log_dir.as_deref());

    match &cli.command {
        Commands::Init {
            workflow_type,
            task,
            task_source,
            auto_merge,
        } => cmd::cmd_init(
            &config,
            workflow_type,
            task.as_deref(),
            task_source.clone(),
            *auto_merge,
        )?,
        Commands::Status { json } => cmd::cmd_status(&config, *json)?,
        Commands::Start { phase } => cmd::cmd_start(&config, phase)?,
        Commands::Complete { result } => cmd::cmd_complete(&config, result.as_deref())?,
        Commands::Fail { reason, context } => cmd::cmd_fail(&config, reason, context.as_deref())?,
        Commands::Skip { target, reason } => cmd::cmd_skip(&config, target, reason)?,
        Commands::Abort { reason } => cmd::cmd_abort(&config, reason)?,
        Commands::Finish => cmd::cmd_finish(&config)?,
        Commands::Agent { name, payload } => cmd::cmd_agent(&config, name, payload)?,
        Commands::Archive => cmd::cmd_archive(&config)?,
        Commands::Review { files, json } => cmd::cmd_review(&config, files, *json).await?,
        Commands::Queue { command } => cmd::cmd_queue(&config, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
