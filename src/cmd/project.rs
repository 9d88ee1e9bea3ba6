//! Workflow creation, status, and archive commands.

use anyhow::{Context, Result};
use conductor::config::ConductorConfig;
use conductor::errors::PhaseError;
use conductor::state::{Policy, WorkflowStatus};
use serde_json::{Value, json};

use super::{machine, parse_json};

pub fn cmd_init(
    config: &ConductorConfig,
    workflow_type: &str,
    task: Option<&str>,
    task_source: Option<String>,
    auto_merge: bool,
) -> Result<()> {
    let task = parse_json(task, "--task")?.unwrap_or(Value::Null);
    let policy = Policy {
        task_source,
        auto_merge,
        ..Policy::default()
    };

    let state = machine(config)
        .create_workflow(workflow_type, policy, task)
        .context("Failed to create workflow")?;

    println!(
        "Created {} workflow {}",
        state.workflow.workflow_type,
        console::style(&state.workflow.id).bold()
    );
    println!("Next: conductor start {}", state.phases.current);
    Ok(())
}

fn styled_status(status: WorkflowStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        WorkflowStatus::Completed => console::style(text).green(),
        WorkflowStatus::Failed | WorkflowStatus::Aborted => console::style(text).red(),
        WorkflowStatus::InProgress => console::style(text).cyan(),
        WorkflowStatus::Pending => console::style(text).dim(),
    }
}

pub fn cmd_status(config: &ConductorConfig, json_output: bool) -> Result<()> {
    let machine = machine(config);
    let snapshot = match machine.status() {
        Ok(snapshot) => snapshot,
        Err(PhaseError::NoWorkflow(_)) => {
            if json_output {
                println!("null");
            } else {
                println!("No workflow found. Run 'conductor init' to create one.");
            }
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to read workflow state"),
    };
    let resume = machine.resume_point()?;

    if json_output {
        let out = json!({ "workflow": snapshot, "resume": resume });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("Workflow {} ({})", console::style(&snapshot.id).bold(), snapshot.workflow_type);
    println!("  Status:    {}", styled_status(snapshot.status));
    println!("  Current:   {}", snapshot.current);
    if let Some(phase) = snapshot.in_progress {
        println!("  Running:   {} (attempt {})", phase, snapshot.iteration);
    }
    println!(
        "  Phases:    {} completed, {} failed, {} skipped",
        snapshot.phases_completed, snapshot.phases_failed, snapshot.phases_skipped
    );
    if let Some(ms) = snapshot.total_duration {
        println!("  Duration:  {:.1}s", ms as f64 / 1000.0);
    }
    match resume {
        Some(point) => {
            println!("  Resume at: {}", point.phase);
            if let Some(context) = point.context {
                println!("  Context:   {}", context);
            }
        }
        None => println!("  Resume at: -"),
    }
    println!();
    Ok(())
}

pub fn cmd_archive(config: &ConductorConfig) -> Result<()> {
    match machine(config).archive()? {
        Some(path) => println!("Archived workflow to {}", path.display()),
        None => println!("No workflow to archive."),
    }
    Ok(())
}
