//! Integration between the phase machine and the review loop.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use conductor::orchestrator::ReviewDriver;
//! use conductor::phase::PhaseMachine;
//! use conductor::review::{ConvergenceLoop, PassDispatcher, QueueStore, ReviewScope};
//! # use conductor::review::{AnalysisPass, FixApplier};
//! # use conductor::state::{StateCache, StateStore};
//!
//! # async fn example(
//! #     passes: Vec<Arc<dyn AnalysisPass>>,
//! #     fixer: Arc<dyn FixApplier>,
//! # ) -> anyhow::Result<()> {
//! let store = StateStore::new(Arc::new(StateCache::default()));
//! let machine = PhaseMachine::new(store.clone(), ".");
//! let queue = QueueStore::new(&store.paths(".".as_ref())?);
//! let convergence = ConvergenceLoop::new(PassDispatcher::new(passes), fixer, queue);
//!
//! let report = ReviewDriver::new(machine, convergence)
//!     .run(ReviewScope::new(["src/auth.rs"]))
//!     .await?;
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```

use serde_json::{Value, json};

use crate::errors::{PhaseError, ReviewError};
use crate::phase::{Phase, PhaseMachine};
use crate::review::{ConvergenceLoop, ConvergenceOutcome, ConvergenceReport, ReviewScope};
use crate::state::run_blocking;

/// Runs the `review-loop` phase to an outcome and records it on the workflow.
///
/// - resolved: the phase completes with a summary result
/// - blocked: the phase fails with the remaining findings as resume context
/// - aborted: no transition; the workflow is already terminal or the caller stopped
///
/// The review queue is bound to the workflow's id, so a queue left by an
/// earlier workflow is never resumed.
pub struct ReviewDriver {
    machine: PhaseMachine,
    convergence: ConvergenceLoop,
}

impl ReviewDriver {
    pub fn new(machine: PhaseMachine, convergence: ConvergenceLoop) -> Self {
        Self {
            machine,
            convergence,
        }
    }

    pub fn machine(&self) -> &PhaseMachine {
        &self.machine
    }

    /// Run a phase machine call on the blocking pool.
    async fn transition<T, F>(&self, f: F) -> Result<T, PhaseError>
    where
        F: FnOnce(&PhaseMachine) -> Result<T, PhaseError> + Send + 'static,
        T: Send + 'static,
    {
        let machine = self.machine.clone();
        run_blocking(move || f(&machine)).await
    }

    /// Make `review-loop` the in-progress phase, starting it if needed.
    /// Returns the workflow id.
    async fn enter_review(&self) -> Result<String, PhaseError> {
        self.transition(|machine| {
            let state = machine.load()?;
            match state.in_progress_index().map(|i| state.phases.history[i].phase) {
                Some(Phase::ReviewLoop) => {}
                Some(other) => {
                    return Err(PhaseError::Validation(format!(
                        "phase '{}' is still in progress",
                        other
                    )));
                }
                None => {
                    machine.start_phase(Phase::ReviewLoop)?;
                }
            }
            Ok(state.workflow.id)
        })
        .await
    }

    pub async fn run(&self, scope: ReviewScope) -> Result<ConvergenceReport, ReviewError> {
        let workflow_id = self.enter_review().await?;

        let report = match self.convergence.run_for_workflow(&workflow_id, scope).await {
            Ok(report) => report,
            Err(e) => {
                let reason = e.to_string();
                if let Err(fail_err) = self.transition(move |m| m.fail(&reason, None)).await {
                    tracing::warn!(error = %fail_err, "Could not record review failure");
                }
                return Err(e);
            }
        };

        match &report.outcome {
            ConvergenceOutcome::Resolved { iterations } => {
                let result = summary(&report, *iterations);
                self.transition(move |m| m.complete(Some(result))).await?;
            }
            ConvergenceOutcome::Blocked {
                reason,
                iterations,
                remaining,
            } => {
                let context = json!({
                    "blockedReason": reason,
                    "remaining": remaining,
                    "iterations": iterations,
                });
                let reason = format!("review blocked: {}", reason);
                self.transition(move |m| m.fail(&reason, Some(context))).await?;
            }
            ConvergenceOutcome::Aborted { iterations } => {
                tracing::info!(iterations, "Review aborted; leaving phase state unchanged");
            }
        }
        Ok(report)
    }
}

fn summary(report: &ConvergenceReport, iterations: u32) -> Value {
    let fixes: usize = report.iterations.iter().map(|r| r.fixes_applied).sum();
    let commits: Vec<&str> = report
        .iterations
        .iter()
        .filter_map(|r| r.commit.as_deref())
        .collect();
    json!({
        "outcome": "resolved",
        "iterations": iterations,
        "fixesApplied": fixes,
        "commits": commits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{
        AnalysisPass, FixApplier, FixOutcome, Finding, PassDispatcher, PassFinding, PassReport,
        QueueStore, Severity,
    };
    use crate::state::{PhaseStatus, Policy, StateCache, StateStore, WorkflowStatus};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    /// Reports `total` findings, one fewer per scan when `drains` is set.
    struct Countdown {
        scans: AtomicUsize,
        total: usize,
        drains: bool,
    }

    #[async_trait]
    impl AnalysisPass for Countdown {
        fn id(&self) -> &str {
            "lint"
        }

        async fn scan(&self, _: &ReviewScope) -> Result<PassReport> {
            let scanned = self.scans.fetch_add(1, Ordering::SeqCst);
            let n = if self.drains { scanned } else { 0 };
            let mut report = PassReport::new("lint");
            for i in n.min(self.total)..self.total {
                report = report.with_finding(PassFinding::new(
                    Severity::Medium,
                    "src/lib.rs",
                    format!("issue {i}"),
                ));
            }
            Ok(report)
        }
    }

    struct Fixer(bool);

    #[async_trait]
    impl FixApplier for Fixer {
        async fn apply(&self, finding: &Finding) -> Result<FixOutcome> {
            Ok(if self.0 {
                FixOutcome::Applied {
                    files: vec![PathBuf::from(&finding.file)],
                }
            } else {
                FixOutcome::Failed {
                    reason: "manual fix required".to_string(),
                }
            })
        }
    }

    fn driver(total: usize, fixes: bool) -> (TempDir, ReviewDriver) {
        let dir = tempdir().unwrap();
        let store = StateStore::new(Arc::new(StateCache::default()));
        let machine = PhaseMachine::new(store.clone(), dir.path());
        machine
            .create_workflow("feature", Policy::default(), json!({"id": "T-7"}))
            .unwrap();

        let pass: Arc<dyn AnalysisPass> = Arc::new(Countdown {
            scans: AtomicUsize::new(0),
            total,
            drains: fixes,
        });
        let queue = QueueStore::new(&store.paths(dir.path()).unwrap());
        let convergence = ConvergenceLoop::new(PassDispatcher::new(vec![pass]), Arc::new(Fixer(fixes)), queue);
        (dir, ReviewDriver::new(machine, convergence))
    }

    #[tokio::test]
    async fn test_resolved_review_completes_phase() {
        let (_dir, driver) = driver(2, true);
        driver.machine().skip_to(Phase::ReviewLoop, "pre-built").unwrap();

        let report = driver.run(ReviewScope::new(["src/lib.rs"])).await.unwrap();
        assert_eq!(report.outcome, ConvergenceOutcome::Resolved { iterations: 2 });

        let state = driver.machine().load().unwrap();
        assert_eq!(state.phases.current, Phase::DeliveryValidation);
        let entry = state.phases.history.last().unwrap();
        assert_eq!(entry.phase, Phase::ReviewLoop);
        assert_eq!(entry.status, PhaseStatus::Completed);
        let result = entry.result.as_ref().unwrap();
        assert_eq!(result["iterations"], 2);
        assert_eq!(result["fixesApplied"], 3);
    }

    #[tokio::test]
    async fn test_blocked_review_fails_phase_with_context() {
        let (_dir, driver) = driver(1, false);

        let report = driver.run(ReviewScope::new(["src/lib.rs"])).await.unwrap();
        assert!(matches!(report.outcome, ConvergenceOutcome::Blocked { .. }));

        let state = driver.machine().load().unwrap();
        assert_eq!(state.workflow.status, WorkflowStatus::Failed);
        assert_eq!(state.phases.current, Phase::ReviewLoop);

        let resume = driver.machine().resume_point().unwrap().unwrap();
        assert_eq!(resume.phase, Phase::ReviewLoop);
        let context = resume.context.unwrap();
        assert_eq!(context["blockedReason"], "stall-detected");
        assert_eq!(context["remaining"]["medium"], 1);
    }

    #[tokio::test]
    async fn test_new_workflow_does_not_inherit_blocked_queue() {
        let (_dir, driver) = driver(1, false);
        let queue_store = driver.convergence.queue_store().clone();

        let first = driver.run(ReviewScope::new(["old.rs"])).await.unwrap();
        assert!(matches!(first.outcome, ConvergenceOutcome::Blocked { .. }));
        let mut stale = queue_store.load().unwrap().unwrap();

        let old = driver.machine().abort_workflow("replaced").unwrap();
        assert!(queue_store.load().unwrap().is_none());
        let new = driver
            .machine()
            .create_workflow("feature", Policy::default(), json!({"id": "T-8"}))
            .unwrap();

        // A loop still running for the old workflow saves its queue late.
        queue_store.save(&mut stale).unwrap();
        assert!(stale.belongs_to(&old.workflow.id));

        let report = driver.run(ReviewScope::new(["new.rs"])).await.unwrap();
        assert_eq!(report.iterations.len(), 2);

        let queue = queue_store.load().unwrap().unwrap();
        assert_eq!(queue.scope, ReviewScope::new(["new.rs"]));
        assert!(queue.belongs_to(&new.workflow.id));
    }

    #[tokio::test]
    async fn test_other_phase_in_progress_is_rejected() {
        let (_dir, driver) = driver(0, true);
        driver.machine().start("planning").unwrap();

        let err = driver.run(ReviewScope::new(["src/lib.rs"])).await.unwrap_err();
        assert!(matches!(err, ReviewError::Phase(PhaseError::Validation(_))));
        let state = driver.machine().load().unwrap();
        assert_eq!(state.phases.current, Phase::Planning);
    }

    #[tokio::test]
    async fn test_existing_review_phase_is_reused() {
        let (_dir, driver) = driver(0, true);
        driver.machine().start("review-loop").unwrap();

        driver.run(ReviewScope::new(["src/lib.rs"])).await.unwrap();
        let state = driver.machine().load().unwrap();
        let review_entries = state
            .phases
            .history
            .iter()
            .filter(|e| e.phase == Phase::ReviewLoop)
            .count();
        assert_eq!(review_entries, 1);
    }
}
