//! Review loop and review queue commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use conductor::config::ConductorConfig;
use conductor::orchestrator::ReviewDriver;
use conductor::review::{
    AbortSignal, AnalysisPass, CommandFixer, CommandPass, ConvergenceLoop, ConvergenceOutcome,
    FixApplier, GitCommitter, QueueStatus, QueueStore, ReviewScope,
};
use conductor::state::StateStore;

use super::super::QueueCommands;
use super::machine;

fn queue_store(config: &ConductorConfig) -> Result<QueueStore> {
    let paths = StateStore::from_config(config).paths(&config.project_dir)?;
    Ok(QueueStore::new(&paths))
}

fn build_loop(config: &ConductorConfig, abort: AbortSignal) -> Result<ConvergenceLoop> {
    let review = config.review();
    if review.passes.is_empty() {
        bail!("No analysis passes configured. Add [[review.passes]] entries to conductor.toml.");
    }
    let Some(fixer_cmd) = &review.fixer else {
        bail!("No fixer configured. Set review.fixer in conductor.toml.");
    };

    let passes = review
        .passes
        .iter()
        .map(|p| {
            CommandPass::new(&p.id, &p.command, &config.project_dir)
                .map(|pass| Arc::new(pass) as Arc<dyn AnalysisPass>)
        })
        .collect::<Result<Vec<_>>>()?;
    let fixer: Arc<dyn FixApplier> = Arc::new(CommandFixer::new(fixer_cmd, &config.project_dir)?);

    let mut convergence = ConvergenceLoop::from_config(review, passes, fixer, queue_store(config)?)
        .context("Invalid [review] settings in conductor.toml")?
        .with_abort_signal(abort);
    if review.git_commit {
        convergence = convergence.with_committer(Arc::new(GitCommitter::new(&config.project_dir)));
    }
    Ok(convergence)
}

pub async fn cmd_review(config: &ConductorConfig, files: &[PathBuf], json_output: bool) -> Result<()> {
    let machine = machine(config);
    let abort = AbortSignal::new().with_workflow(machine.clone());
    let convergence = build_loop(config, abort.clone())?;

    let on_interrupt = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; stopping after the current iteration...");
            on_interrupt.raise();
        }
    });

    let report = ReviewDriver::new(machine, convergence)
        .run(ReviewScope::new(files.iter().cloned()))
        .await
        .context("Review failed")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for it in &report.iterations {
            println!(
                "Iteration {}: {} open -> {} open ({} fixed, {} failed{})",
                it.iteration,
                it.open_before,
                it.open_after,
                it.fixes_applied,
                it.fixes_failed,
                if it.failed_passes.is_empty() {
                    String::new()
                } else {
                    format!(", passes failed: {}", it.failed_passes.join(", "))
                }
            );
        }
    }

    match report.outcome {
        ConvergenceOutcome::Resolved { iterations } => {
            if !json_output {
                println!(
                    "{} after {} iteration(s)",
                    console::style("Review resolved").green().bold(),
                    iterations
                );
            }
            Ok(())
        }
        ConvergenceOutcome::Blocked {
            reason, remaining, ..
        } => {
            if !json_output {
                println!("{} ({})", console::style("Review blocked").red().bold(), reason);
                println!("  Remaining: {}", remaining);
                println!("  Run 'conductor queue reopen' to continue with new limits.");
            }
            bail!("review blocked: {}", reason)
        }
        ConvergenceOutcome::Aborted { iterations } => {
            if !json_output {
                println!(
                    "{} after {} iteration(s); the queue is saved",
                    console::style("Review aborted").yellow().bold(),
                    iterations
                );
            }
            Ok(())
        }
    }
}

pub fn cmd_queue(config: &ConductorConfig, command: Option<QueueCommands>) -> Result<()> {
    let store = queue_store(config)?;
    let Some(mut queue) = store.load()? else {
        println!("No review queue at {}", store.path().display());
        return Ok(());
    };

    match command.unwrap_or(QueueCommands::Show { json: false }) {
        QueueCommands::Show { json: true } => {
            println!("{}", serde_json::to_string_pretty(&queue)?);
        }
        QueueCommands::Show { json: false } => {
            println!();
            println!(
                "Review queue: {:?} (iteration {}, stall count {})",
                queue.status, queue.iteration, queue.stall_count
            );
            if let Some(reason) = queue.blocked_reason {
                println!("  Blocked:   {}", reason);
            }
            println!("  Remaining: {}", queue.remaining);
            println!("  Scope:     {} file(s)", queue.scope.files.len());
            println!();
            for finding in queue.open_items() {
                println!("  {}", finding);
            }
            println!();
        }
        QueueCommands::Reopen => {
            if queue.status != QueueStatus::Blocked {
                println!("Review queue is not blocked.");
                return Ok(());
            }
            queue.reopen();
            store.save(&mut queue)?;
            println!("Reopened review queue at iteration {}", queue.iteration);
        }
    }
    Ok(())
}
