//! Phase transition commands.

use anyhow::{Context, Result};
use conductor::config::ConductorConfig;
use conductor::phase::Phase;

use super::{machine, parse_json};

pub fn cmd_start(config: &ConductorConfig, phase: &str) -> Result<()> {
    let state = machine(config).start(phase)?;
    println!(
        "Started {} (attempt {})",
        console::style(state.phases.current).bold(),
        state.phases.iteration
    );
    Ok(())
}

pub fn cmd_complete(config: &ConductorConfig, result: Option<&str>) -> Result<()> {
    let result = parse_json(result, "--result")?;
    let state = machine(config).complete(result)?;
    if let Some(entry) = state.phases.history.last() {
        println!("Completed {}", console::style(entry.phase).green());
    }
    println!("Next: {}", state.phases.current);
    Ok(())
}

pub fn cmd_fail(config: &ConductorConfig, reason: &str, context: Option<&str>) -> Result<()> {
    let context = parse_json(context, "--context")?;
    let state = machine(config).fail(reason, context)?;
    println!(
        "Failed {}: {}",
        console::style(state.phases.current).red(),
        reason
    );
    Ok(())
}

pub fn cmd_skip(config: &ConductorConfig, target: &str, reason: &str) -> Result<()> {
    let target: Phase = target.parse()?;
    let before = machine(config).load()?.phases.current;
    let state = machine(config)
        .skip_to(target, reason)
        .with_context(|| format!("Failed to skip to '{}'", target))?;
    println!(
        "Skipped {} phase(s): {} -> {}",
        target.index().saturating_sub(before.index()),
        before,
        state.phases.current
    );
    Ok(())
}

pub fn cmd_abort(config: &ConductorConfig, reason: &str) -> Result<()> {
    let state = machine(config).abort_workflow(reason)?;
    println!(
        "Aborted workflow {}: {}",
        console::style(&state.workflow.id).bold(),
        reason
    );
    Ok(())
}

pub fn cmd_finish(config: &ConductorConfig) -> Result<()> {
    let state = machine(config).complete_workflow()?;
    println!(
        "Workflow {} {}",
        state.workflow.id,
        console::style("completed").green()
    );
    Ok(())
}

pub fn cmd_agent(config: &ConductorConfig, name: &str, payload: &str) -> Result<()> {
    let payload = parse_json(Some(payload), "payload")?.unwrap_or_default();
    machine(config).record_agent(name, payload)?;
    println!("Recorded output for agent '{}'", name);
    Ok(())
}
