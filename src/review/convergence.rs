//! The review convergence loop.
//!
//! One iteration applies fixes for every open finding (most severe first),
//! commits them once, optionally runs a cleanup pass over the touched files,
//! and re-scans the whole scope. The loop ends when nothing is open
//! (`resolved`), when the open set stops changing for `max_stalls`
//! iterations or `max_iterations` is reached (`blocked`), or when the abort
//! signal is raised. The queue is persisted after every iteration, so a
//! later run resumes at the next iteration.

use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::collaborators::{AnalysisPass, ChangeCommitter, FixApplier, FixOutcome, NoopCommitter};
use super::digest::{DigestMode, open_set_digest};
use super::dispatcher::{PassDispatcher, ScanRound, run_pass};
use super::findings::{Finding, PassReport, SeverityCounts};
use super::queue::{BlockReason, QueueStatus, QueueStore, ReviewQueue, ReviewScope};
use crate::config::ReviewSection;
use crate::errors::ReviewError;
use crate::phase::PhaseMachine;
use crate::state::run_blocking;

/// Bounds and tuning for one loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub max_stalls: u32,
    pub fix_timeout: Duration,
    pub min_confidence: f64,
    pub digest: DigestMode,
}

impl LoopSettings {
    /// Reject bounds the loop cannot run with.
    pub fn validate(&self) -> Result<(), ReviewError> {
        if self.max_iterations == 0 {
            return Err(ReviewError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_stalls == 0 {
            return Err(ReviewError::Config("max_stalls must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ReviewError::Config(format!(
                "min_confidence {} is outside 0.0..=1.0",
                self.min_confidence
            )));
        }
        Ok(())
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&ReviewSection::default())
    }
}

impl From<&ReviewSection> for LoopSettings {
    fn from(section: &ReviewSection) -> Self {
        Self {
            max_iterations: section.max_iterations,
            max_stalls: section.max_stalls,
            fix_timeout: section.fix_timeout(),
            min_confidence: section.min_confidence,
            digest: section.digest,
        }
    }
}

/// Cooperative cancellation, checked before every iteration.
///
/// Raised either in-process through [`AbortSignal::raise`] or by aborting the
/// workflow the signal is bound to.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    workflow: Option<PhaseMachine>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treat an `aborted` workflow status as an abort request.
    pub fn with_workflow(mut self, machine: PhaseMachine) -> Self {
        self.workflow = Some(machine);
        self
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub async fn is_raised(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        let Some(machine) = self.workflow.clone() else {
            return false;
        };
        match run_blocking(move || machine.is_aborted()).await {
            Ok(aborted) => aborted,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read workflow status for abort check");
                false
            }
        }
    }
}

/// How a loop run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ConvergenceOutcome {
    Resolved {
        iterations: u32,
    },
    Blocked {
        reason: BlockReason,
        iterations: u32,
        remaining: SeverityCounts,
    },
    Aborted {
        iterations: u32,
    },
}

impl ConvergenceOutcome {
    pub fn iterations(&self) -> u32 {
        match self {
            Self::Resolved { iterations }
            | Self::Blocked { iterations, .. }
            | Self::Aborted { iterations } => *iterations,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

/// What happened in one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationReport {
    pub iteration: u32,
    pub open_before: usize,
    pub open_after: usize,
    pub fixes_applied: usize,
    pub fixes_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub failed_passes: Vec<String>,
    pub stall_count: u32,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergenceReport {
    pub outcome: ConvergenceOutcome,
    pub iterations: Vec<IterationReport>,
}

#[derive(Debug, Default)]
struct FixSummary {
    applied: usize,
    failed: usize,
    touched: BTreeSet<PathBuf>,
}

pub struct ConvergenceLoop {
    dispatcher: PassDispatcher,
    cleanup: Option<Arc<dyn AnalysisPass>>,
    fixer: Arc<dyn FixApplier>,
    committer: Arc<dyn ChangeCommitter>,
    queue_store: QueueStore,
    settings: LoopSettings,
    abort: AbortSignal,
}

impl ConvergenceLoop {
    pub fn new(dispatcher: PassDispatcher, fixer: Arc<dyn FixApplier>, queue_store: QueueStore) -> Self {
        Self {
            dispatcher,
            cleanup: None,
            fixer,
            committer: Arc::new(NoopCommitter),
            queue_store,
            settings: LoopSettings::default(),
            abort: AbortSignal::default(),
        }
    }

    /// Build a loop from configuration, taking the pass named by
    /// `cleanup_pass` out of `passes` to serve as the cleanup pass.
    ///
    /// Fails with [`ReviewError::Config`] on unusable bounds or duplicate pass ids.
    pub fn from_config(
        section: &ReviewSection,
        passes: Vec<Arc<dyn AnalysisPass>>,
        fixer: Arc<dyn FixApplier>,
        queue_store: QueueStore,
    ) -> Result<Self, ReviewError> {
        check_unique(passes.iter().map(|p| p.id()))?;
        let (cleanup, scanners): (Vec<_>, Vec<_>) = passes
            .into_iter()
            .partition(|p| section.cleanup_pass.as_deref() == Some(p.id()));
        if let Some(name) = &section.cleanup_pass
            && cleanup.is_empty()
        {
            tracing::warn!(pass = %name, "Configured cleanup pass not found; running without it");
        }

        let dispatcher = PassDispatcher::new(scanners).with_pass_timeout(section.pass_timeout());
        let mut this = Self::new(dispatcher, fixer, queue_store).with_settings(LoopSettings::from(section));
        this.cleanup = cleanup.into_iter().next();
        this.validate()?;
        Ok(this)
    }

    pub fn with_committer(mut self, committer: Arc<dyn ChangeCommitter>) -> Self {
        self.committer = committer;
        self
    }

    pub fn with_cleanup_pass(mut self, pass: Arc<dyn AnalysisPass>) -> Self {
        self.cleanup = Some(pass);
        self
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn queue_store(&self) -> &QueueStore {
        &self.queue_store
    }

    fn pass_ids(&self) -> Vec<String> {
        let mut ids = self.dispatcher.pass_ids();
        if let Some(cleanup) = &self.cleanup {
            ids.push(cleanup.id().to_string());
        }
        ids
    }

    fn validate(&self) -> Result<(), ReviewError> {
        self.settings.validate()?;
        check_unique(self.pass_ids().iter().map(String::as_str))
    }

    fn findings(&self, reports: Vec<PassReport>) -> Vec<Finding> {
        reports
            .into_iter()
            .flat_map(|r| r.into_findings(self.settings.min_confidence))
            .collect()
    }

    /// Load the persisted queue, or create one from an initial scan.
    ///
    /// A persisted blocked queue is returned as is. When `workflow_id` is
    /// given, a queue recorded for any other workflow is deleted first.
    async fn open_queue(
        &self,
        scope: ReviewScope,
        workflow_id: Option<&str>,
    ) -> Result<ReviewQueue, ReviewError> {
        let persisted = match (self.queue_store.load_async().await?, workflow_id) {
            (Some(queue), Some(id)) if !queue.belongs_to(id) => {
                tracing::warn!(
                    queue_workflow = queue.workflow_id.as_deref().unwrap_or("none"),
                    workflow = id,
                    "Discarding review queue left by another workflow"
                );
                self.queue_store.delete_async().await?;
                None
            }
            (queue, _) => queue,
        };

        match persisted {
            Some(queue) if queue.status != QueueStatus::Resolved => {
                if queue.scope != scope {
                    tracing::warn!(
                        persisted = queue.scope.files.len(),
                        requested = scope.files.len(),
                        "Resuming review with its persisted scope"
                    );
                }
                tracing::info!(
                    iteration = queue.iteration,
                    stall_count = queue.stall_count,
                    open = queue.open_count(),
                    "Resuming review queue"
                );
                Ok(queue)
            }
            _ => {
                let round = self.dispatcher.dispatch(&scope).await;
                if let Some(failure) = round.failures.first() {
                    return Err(ReviewError::PassFailed {
                        pass: failure.pass.clone(),
                        message: failure.message.clone(),
                    });
                }

                let mut queue = ReviewQueue::new(scope, self.pass_ids());
                queue.workflow_id = workflow_id.map(str::to_string);
                queue.replace_items(Vec::new(), self.findings(round.reports));
                self.queue_store.save_async(&mut queue).await?;
                tracing::info!(
                    open = queue.open_count(),
                    total = queue.items.len(),
                    "Initial review scan complete"
                );
                Ok(queue)
            }
        }
    }

    /// Drive the review of `scope` to a terminal outcome.
    pub async fn run(&self, scope: ReviewScope) -> Result<ConvergenceReport, ReviewError> {
        self.drive(scope, None).await
    }

    /// Like [`run`](Self::run), but the queue is bound to `workflow_id`: only
    /// a queue recorded for that workflow is resumed.
    pub async fn run_for_workflow(
        &self,
        workflow_id: &str,
        scope: ReviewScope,
    ) -> Result<ConvergenceReport, ReviewError> {
        self.drive(scope, Some(workflow_id)).await
    }

    async fn drive(
        &self,
        scope: ReviewScope,
        workflow_id: Option<&str>,
    ) -> Result<ConvergenceReport, ReviewError> {
        if self.dispatcher.is_empty() {
            return Err(ReviewError::NoPasses);
        }
        self.validate()?;

        let mut queue = self.open_queue(scope, workflow_id).await?;
        let mut history = Vec::new();

        if queue.status == QueueStatus::Blocked {
            let reason = queue.blocked_reason.unwrap_or(BlockReason::IterationLimit);
            tracing::warn!(reason = %reason, "Review queue is blocked; reopen it to continue");
            return Ok(ConvergenceReport {
                outcome: ConvergenceOutcome::Blocked {
                    reason,
                    iterations: queue.iteration,
                    remaining: queue.remaining,
                },
                iterations: history,
            });
        }

        loop {
            if self.abort.is_raised().await {
                self.queue_store.save_async(&mut queue).await?;
                tracing::warn!(iteration = queue.iteration, "Review aborted");
                return Ok(ConvergenceReport {
                    outcome: ConvergenceOutcome::Aborted {
                        iterations: queue.iteration,
                    },
                    iterations: history,
                });
            }

            if queue.open_count() == 0 {
                return self.resolve(queue, history).await;
            }

            let report = self.iterate(&mut queue).await?;
            history.push(report);

            if queue.open_count() == 0 {
                return self.resolve(queue, history).await;
            }

            if let Some(reason) = self.check_bounds(&queue) {
                queue.mark_blocked(reason);
                self.queue_store.save_async(&mut queue).await?;
                tracing::warn!(
                    reason = %reason,
                    iteration = queue.iteration,
                    remaining = %queue.remaining,
                    "Review blocked"
                );
                return Ok(ConvergenceReport {
                    outcome: ConvergenceOutcome::Blocked {
                        reason,
                        iterations: queue.iteration,
                        remaining: queue.remaining,
                    },
                    iterations: history,
                });
            }

            self.queue_store.save_async(&mut queue).await?;
        }
    }

    /// The bound tripped by the current queue, stall first.
    fn check_bounds(&self, queue: &ReviewQueue) -> Option<BlockReason> {
        if queue.stall_count >= self.settings.max_stalls {
            Some(BlockReason::StallDetected)
        } else if queue.iteration >= self.settings.max_iterations {
            Some(BlockReason::IterationLimit)
        } else {
            None
        }
    }

    async fn resolve(
        &self,
        mut queue: ReviewQueue,
        history: Vec<IterationReport>,
    ) -> Result<ConvergenceReport, ReviewError> {
        queue.mark_resolved();
        self.queue_store.delete_async().await?;
        tracing::info!(iterations = queue.iteration, "Review resolved");
        Ok(ConvergenceReport {
            outcome: ConvergenceOutcome::Resolved {
                iterations: queue.iteration,
            },
            iterations: history,
        })
    }

    /// One fix, commit, cleanup and re-scan cycle.
    async fn iterate(&self, queue: &mut ReviewQueue) -> Result<IterationReport, ReviewError> {
        queue.iteration += 1;
        let iteration = queue.iteration;
        let open_before = queue.open_count();
        let before = open_set_digest(&queue.items, self.settings.digest);

        let fixes = self.apply_fixes(queue).await;

        let commit = if fixes.applied > 0 {
            let files: Vec<PathBuf> = fixes.touched.iter().cloned().collect();
            let message = format!(
                "review: iteration {} ({} fix{})",
                iteration,
                fixes.applied,
                if fixes.applied == 1 { "" } else { "es" }
            );
            self.committer
                .commit(iteration, &message, &files)
                .await
                .map_err(|e| ReviewError::CommitFailed {
                    iteration,
                    message: format!("{:#}", e),
                })?
        } else {
            None
        };

        let cleanup = self.run_cleanup(&fixes.touched).await;
        let round = self.dispatcher.dispatch(&queue.scope).await;
        let failed_passes = round.failed_passes();
        let carried = self.carried_items(queue, &round, cleanup.as_ref().map(|(files, _)| files));

        let mut reports = round.reports;
        if let Some((_, report)) = cleanup {
            reports.push(report);
        }
        queue.replace_items(carried, self.findings(reports));

        let after = open_set_digest(&queue.items, self.settings.digest);
        if after == before {
            queue.stall_count += 1;
        } else {
            queue.stall_count = 0;
        }

        let report = IterationReport {
            iteration,
            open_before,
            open_after: queue.open_count(),
            fixes_applied: fixes.applied,
            fixes_failed: fixes.failed,
            commit,
            failed_passes,
            stall_count: queue.stall_count,
            digest: after,
        };
        tracing::info!(
            iteration,
            open_before = report.open_before,
            open_after = report.open_after,
            fixed = report.fixes_applied,
            failed = report.fixes_failed,
            stall_count = report.stall_count,
            "Review iteration finished"
        );
        Ok(report)
    }

    /// Apply a fix for each open item, critical first, each under the fix timeout.
    async fn apply_fixes(&self, queue: &ReviewQueue) -> FixSummary {
        let mut open: Vec<Finding> = queue.open_items().cloned().collect();
        open.sort_by_key(|f| f.severity);

        let mut summary = FixSummary::default();
        for finding in &open {
            match tokio::time::timeout(self.settings.fix_timeout, self.fixer.apply(finding)).await {
                Ok(Ok(FixOutcome::Applied { files })) => {
                    summary.applied += 1;
                    summary.touched.extend(files);
                }
                Ok(Ok(FixOutcome::Failed { reason })) => {
                    summary.failed += 1;
                    tracing::debug!(finding = %finding, reason = %reason, "Fix not applied");
                }
                Ok(Err(e)) => {
                    summary.failed += 1;
                    tracing::warn!(finding = %finding, error = %e, "Fix applier errored");
                }
                Err(_) => {
                    summary.failed += 1;
                    tracing::warn!(
                        finding = %finding,
                        timeout_secs = self.settings.fix_timeout.as_secs_f64(),
                        "Fix timed out"
                    );
                }
            }
        }
        summary
    }

    /// Run the cleanup pass over `touched`. Returns the files it covered
    /// together with its report, or `None` if it did not run successfully.
    async fn run_cleanup(&self, touched: &BTreeSet<PathBuf>) -> Option<(HashSet<PathBuf>, PassReport)> {
        let cleanup = self.cleanup.as_ref()?;
        if touched.is_empty() {
            return None;
        }

        let scope = ReviewScope::new(touched.iter().cloned());
        match run_pass(cleanup.as_ref(), &scope, self.dispatcher.pass_timeout()).await {
            Ok(report) => {
                let files = touched.iter().map(|p| normalize_path(p)).collect();
                Some((files, report))
            }
            Err(failure) => {
                tracing::warn!(pass = %failure.pass, error = %failure.message, "Cleanup pass failed");
                None
            }
        }
    }

    /// Earlier items whose pass did not report fresh results this iteration.
    ///
    /// Items from a failed pass are kept, as are cleanup items for files the
    /// cleanup pass did not look at.
    fn carried_items(
        &self,
        queue: &ReviewQueue,
        round: &ScanRound,
        cleaned: Option<&HashSet<PathBuf>>,
    ) -> Vec<Finding> {
        let failed: HashSet<&str> = round.failures.iter().map(|f| f.pass.as_str()).collect();
        let cleanup_id = self.cleanup.as_ref().map(|p| p.id());

        queue
            .items
            .iter()
            .filter(|item| {
                if failed.contains(item.pass.as_str()) {
                    return true;
                }
                if cleanup_id == Some(item.pass.as_str()) {
                    return cleaned
                        .is_none_or(|files| !files.contains(&normalize_path(Path::new(&item.file))));
                }
                false
            })
            .cloned()
            .collect()
    }
}

fn check_unique<'a>(ids: impl IntoIterator<Item = &'a str>) -> Result<(), ReviewError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ReviewError::Config(format!("pass id '{}' is used more than once", id)));
        }
    }
    Ok(())
}

/// Drop `.` components so `./src/a.rs` and `src/a.rs` compare equal.
fn normalize_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::findings::{FindingStatus, PassFinding, Severity};
    use crate::state::{Policy, StateCache, StatePaths, StateStore};
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    /// Returns scripted rounds in order, repeating the last one forever.
    struct ScriptedPass {
        id: &'static str,
        rounds: Mutex<VecDeque<Result<Vec<PassFinding>, String>>>,
        last: Mutex<Vec<PassFinding>>,
        scans: Mutex<Vec<ReviewScope>>,
    }

    impl ScriptedPass {
        fn new(id: &'static str, rounds: Vec<Vec<PassFinding>>) -> Arc<Self> {
            Self::with_results(id, rounds.into_iter().map(Ok).collect())
        }

        fn with_results(id: &'static str, rounds: Vec<Result<Vec<PassFinding>, String>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                rounds: Mutex::new(rounds.into()),
                last: Mutex::new(Vec::new()),
                scans: Mutex::new(Vec::new()),
            })
        }

        fn scan_count(&self) -> usize {
            self.scans.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AnalysisPass for ScriptedPass {
        fn id(&self) -> &str {
            self.id
        }

        async fn scan(&self, scope: &ReviewScope) -> Result<PassReport> {
            self.scans.lock().unwrap().push(scope.clone());
            let next = self.rounds.lock().unwrap().pop_front();
            let findings = match next {
                Some(Ok(findings)) => {
                    *self.last.lock().unwrap() = findings.clone();
                    findings
                }
                Some(Err(message)) => bail!(message),
                None => self.last.lock().unwrap().clone(),
            };
            Ok(PassReport {
                pass: self.id.to_string(),
                findings,
            })
        }
    }

    /// Records every finding it is asked to fix.
    struct RecordingFixer {
        applied: Mutex<Vec<Finding>>,
        succeed: bool,
        delay: Option<Duration>,
    }

    impl RecordingFixer {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                succeed: true,
                delay: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                succeed: false,
                delay: None,
            })
        }

        fn descriptions(&self) -> Vec<String> {
            self.applied
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.description.clone())
                .collect()
        }
    }

    #[async_trait]
    impl FixApplier for RecordingFixer {
        async fn apply(&self, finding: &Finding) -> Result<FixOutcome> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.applied.lock().unwrap().push(finding.clone());
            if self.succeed {
                Ok(FixOutcome::Applied {
                    files: vec![PathBuf::from(&finding.file)],
                })
            } else {
                Ok(FixOutcome::Failed {
                    reason: "no automatic fix".to_string(),
                })
            }
        }
    }

    #[derive(Default)]
    struct CountingCommitter {
        calls: Mutex<Vec<(u32, Vec<PathBuf>)>>,
    }

    #[async_trait]
    impl ChangeCommitter for CountingCommitter {
        async fn commit(&self, iteration: u32, _: &str, files: &[PathBuf]) -> Result<Option<String>> {
            self.calls.lock().unwrap().push((iteration, files.to_vec()));
            Ok(Some(format!("commit-{iteration}")))
        }
    }

    fn finding(severity: Severity, description: &str) -> PassFinding {
        PassFinding::new(severity, "src/lib.rs", description).at_line(1)
    }

    fn settings(max_iterations: u32, max_stalls: u32) -> LoopSettings {
        LoopSettings {
            max_iterations,
            max_stalls,
            fix_timeout: Duration::from_secs(5),
            min_confidence: 0.0,
            digest: DigestMode::Full,
        }
    }

    fn queue_store() -> (TempDir, QueueStore) {
        let dir = tempdir().unwrap();
        let paths = StatePaths::resolve(dir.path(), ".conductor").unwrap();
        (dir, QueueStore::new(&paths))
    }

    fn scope() -> ReviewScope {
        ReviewScope::new(["src/lib.rs"])
    }

    fn build(
        passes: Vec<Arc<ScriptedPass>>,
        fixer: Arc<dyn FixApplier>,
        store: QueueStore,
        settings: LoopSettings,
    ) -> ConvergenceLoop {
        let passes = passes
            .into_iter()
            .map(|p| p as Arc<dyn AnalysisPass>)
            .collect();
        ConvergenceLoop::new(PassDispatcher::new(passes), fixer, store).with_settings(settings)
    }

    #[tokio::test]
    async fn test_stalled_input_blocks_after_max_stalls_iterations() {
        let (_dir, store) = queue_store();
        let pass = ScriptedPass::new("lint", vec![vec![finding(Severity::Medium, "stuck")]]);
        let looper = build(vec![pass], RecordingFixer::failing(), store.clone(), settings(10, 3));

        let report = looper.run(scope()).await.unwrap();
        match report.outcome {
            ConvergenceOutcome::Blocked {
                reason, iterations, ..
            } => {
                assert_eq!(reason, BlockReason::StallDetected);
                assert_eq!(iterations, 3);
            }
            other => panic!("Expected blocked, got {other:?}"),
        }
        assert_eq!(report.iterations.len(), 3);
        assert_eq!(report.iterations[2].stall_count, 3);

        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.status, QueueStatus::Blocked);
        assert_eq!(persisted.blocked_reason, Some(BlockReason::StallDetected));
        assert!(persisted.blocked_at.is_some());
    }

    #[tokio::test]
    async fn test_draining_input_resolves_after_n_iterations() {
        let (_dir, store) = queue_store();
        let n = 4;
        let rounds: Vec<Vec<PassFinding>> = (0..=n)
            .map(|k| {
                (k..n)
                    .map(|i| finding(Severity::Low, &format!("issue {i}")))
                    .collect()
            })
            .collect();
        let pass = ScriptedPass::new("lint", rounds);
        let committer = Arc::new(CountingCommitter::default());
        let looper = build(vec![pass.clone()], RecordingFixer::succeeding(), store.clone(), settings(10, 2))
            .with_committer(committer.clone());

        let report = looper.run(scope()).await.unwrap();
        assert_eq!(report.outcome, ConvergenceOutcome::Resolved { iterations: n as u32 });
        assert_eq!(report.iterations.last().unwrap().open_after, 0);
        assert!(report.iterations.iter().all(|r| r.stall_count == 0));
        assert_eq!(committer.calls.lock().unwrap().len(), n);
        assert_eq!(pass.scan_count(), n + 1);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abc_scenario_blocks_with_low_remaining() {
        let (_dir, store) = queue_store();
        let a = finding(Severity::Critical, "A");
        let b = finding(Severity::High, "B");
        let c = finding(Severity::Low, "C");
        let pass = ScriptedPass::new(
            "review",
            vec![vec![c.clone(), a, b], vec![c.clone()], vec![c.clone()], vec![c]],
        );
        let fixer = RecordingFixer::succeeding();
        let looper = build(vec![pass], fixer.clone(), store.clone(), settings(10, 2));

        let report = looper.run(scope()).await.unwrap();
        assert_eq!(
            report.outcome,
            ConvergenceOutcome::Blocked {
                reason: BlockReason::StallDetected,
                iterations: 3,
                remaining: SeverityCounts {
                    critical: 0,
                    high: 0,
                    medium: 0,
                    low: 1
                },
            }
        );
        // Iteration 1 fixes in severity order, then C alone twice.
        assert_eq!(fixer.descriptions(), vec!["A", "B", "C", "C", "C"]);
        let stalls: Vec<u32> = report.iterations.iter().map(|r| r.stall_count).collect();
        assert_eq!(stalls, vec![0, 1, 2]);

        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.remaining.low, 1);
        assert_eq!(persisted.iteration, 3);
    }

    #[tokio::test]
    async fn test_iteration_limit_when_findings_keep_changing() {
        let (_dir, store) = queue_store();
        let rounds = (0..10)
            .map(|i| vec![finding(Severity::Medium, &format!("variant {i}"))])
            .collect();
        let pass = ScriptedPass::new("lint", rounds);
        let looper = build(vec![pass], RecordingFixer::succeeding(), store, settings(3, 2));

        let report = looper.run(scope()).await.unwrap();
        match report.outcome {
            ConvergenceOutcome::Blocked {
                reason,
                iterations,
                remaining,
            } => {
                assert_eq!(reason, BlockReason::IterationLimit);
                assert_eq!(iterations, 3);
                assert_eq!(remaining.medium, 1);
            }
            other => panic!("Expected blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_initial_scan_resolves_without_iterating() {
        let (_dir, store) = queue_store();
        let pass = ScriptedPass::new(
            "lint",
            vec![vec![finding(Severity::High, "noise").with_confidence(0.1)]],
        );
        let fixer = RecordingFixer::succeeding();
        let mut settings = settings(10, 2);
        settings.min_confidence = 0.5;
        let looper = build(vec![pass], fixer.clone(), store, settings);

        let report = looper.run(scope()).await.unwrap();
        assert_eq!(report.outcome, ConvergenceOutcome::Resolved { iterations: 0 });
        assert!(fixer.descriptions().is_empty());
    }

    #[tokio::test]
    async fn test_abort_flag_stops_before_iterating() {
        let (_dir, store) = queue_store();
        let pass = ScriptedPass::new("lint", vec![vec![finding(Severity::Low, "x")]]);
        let abort = AbortSignal::new();
        abort.raise();
        let looper = build(vec![pass], RecordingFixer::succeeding(), store.clone(), settings(10, 2))
            .with_abort_signal(abort);

        let report = looper.run(scope()).await.unwrap();
        assert_eq!(report.outcome, ConvergenceOutcome::Aborted { iterations: 0 });
        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.status, QueueStatus::Open);
        assert_eq!(persisted.open_count(), 1);
    }

    #[tokio::test]
    async fn test_aborted_workflow_stops_loop() {
        let dir = tempdir().unwrap();
        let state = StateStore::new(Arc::new(StateCache::default()));
        let machine = PhaseMachine::new(state, dir.path());
        machine
            .create_workflow("feature", Policy::default(), serde_json::Value::Null)
            .unwrap();
        machine.abort_workflow("operator stop").unwrap();

        let paths = StatePaths::resolve(dir.path(), ".conductor").unwrap();
        let pass = ScriptedPass::new("lint", vec![vec![finding(Severity::Low, "x")]]);
        let looper = build(
            vec![pass],
            RecordingFixer::succeeding(),
            QueueStore::new(&paths),
            settings(10, 2),
        )
        .with_abort_signal(AbortSignal::new().with_workflow(machine));

        let report = looper.run(scope()).await.unwrap();
        assert!(matches!(report.outcome, ConvergenceOutcome::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_resume_continues_from_persisted_iteration() {
        let (_dir, store) = queue_store();
        let rounds = vec![
            vec![finding(Severity::Low, "1"), finding(Severity::Low, "2"), finding(Severity::Low, "3")],
            vec![finding(Severity::Low, "2"), finding(Severity::Low, "3")],
            vec![finding(Severity::Low, "3")],
            vec![],
        ];
        let pass = ScriptedPass::new("lint", rounds);

        let first = build(vec![pass.clone()], RecordingFixer::succeeding(), store.clone(), settings(1, 2));
        let report = first.run(scope()).await.unwrap();
        assert!(matches!(
            report.outcome,
            ConvergenceOutcome::Blocked {
                reason: BlockReason::IterationLimit,
                iterations: 1,
                ..
            }
        ));

        // A blocked queue is reported again without rescanning.
        let scans = pass.scan_count();
        let again = first.run(scope()).await.unwrap();
        assert!(matches!(again.outcome, ConvergenceOutcome::Blocked { .. }));
        assert_eq!(pass.scan_count(), scans);

        let mut queue = store.load().unwrap().unwrap();
        queue.reopen();
        store.save(&mut queue).unwrap();

        let second = build(vec![pass.clone()], RecordingFixer::succeeding(), store.clone(), settings(10, 2));
        let report = second.run(scope()).await.unwrap();
        assert_eq!(report.outcome, ConvergenceOutcome::Resolved { iterations: 3 });
        assert_eq!(report.iterations.first().unwrap().iteration, 2);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_pass_carries_items_forward() {
        let (_dir, store) = queue_store();
        let lint = ScriptedPass::new("lint", vec![vec![finding(Severity::Low, "x")]]);
        let flaky = ScriptedPass::with_results(
            "flaky",
            vec![
                Ok(vec![finding(Severity::High, "y")]),
                Err("scanner crashed".to_string()),
                Err("scanner crashed".to_string()),
            ],
        );
        let looper = build(
            vec![lint, flaky],
            RecordingFixer::failing(),
            store.clone(),
            settings(10, 2),
        );

        let report = looper.run(scope()).await.unwrap();
        assert_eq!(
            report.outcome,
            ConvergenceOutcome::Blocked {
                reason: BlockReason::StallDetected,
                iterations: 2,
                remaining: SeverityCounts {
                    critical: 0,
                    high: 1,
                    medium: 0,
                    low: 1
                },
            }
        );
        assert_eq!(report.iterations[0].failed_passes, vec!["flaky".to_string()]);

        let persisted = store.load().unwrap().unwrap();
        assert!(persisted.items.iter().any(|f| f.pass == "flaky" && f.description == "y"));
    }

    #[tokio::test]
    async fn test_initial_pass_failure_is_error() {
        let (_dir, store) = queue_store();
        let broken = ScriptedPass::with_results("broken", vec![Err("no binary".to_string())]);
        let looper = build(vec![broken], RecordingFixer::succeeding(), store.clone(), settings(10, 2));

        let err = looper.run(scope()).await.unwrap_err();
        assert!(matches!(err, ReviewError::PassFailed { pass, .. } if pass == "broken"));
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_passes_is_error() {
        let (_dir, store) = queue_store();
        let looper = build(Vec::new(), RecordingFixer::succeeding(), store, settings(10, 2));
        assert!(matches!(looper.run(scope()).await.unwrap_err(), ReviewError::NoPasses));
    }

    #[tokio::test]
    async fn test_fix_timeout_counts_as_failure() {
        let (_dir, store) = queue_store();
        let pass = ScriptedPass::new("lint", vec![vec![finding(Severity::Low, "slow")]]);
        let fixer = Arc::new(RecordingFixer {
            applied: Mutex::new(Vec::new()),
            succeed: true,
            delay: Some(Duration::from_secs(10)),
        });
        let mut settings = settings(10, 1);
        settings.fix_timeout = Duration::from_millis(20);
        let looper = build(vec![pass], fixer, store, settings);

        let report = looper.run(scope()).await.unwrap();
        assert_eq!(report.iterations[0].fixes_failed, 1);
        assert_eq!(report.iterations[0].fixes_applied, 0);
        assert!(report.iterations[0].commit.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_pass_scans_touched_files() {
        let (_dir, store) = queue_store();
        let main = ScriptedPass::new("lint", vec![vec![finding(Severity::High, "A")], vec![]]);
        let cleanup = ScriptedPass::new(
            "slop-cleanup",
            vec![
                vec![PassFinding::new(Severity::Low, "src/lib.rs", "leftover debug print")],
                vec![],
            ],
        );
        let looper = build(vec![main], RecordingFixer::succeeding(), store, settings(10, 2))
            .with_cleanup_pass(cleanup.clone());

        let report = looper.run(scope()).await.unwrap();
        assert_eq!(report.outcome, ConvergenceOutcome::Resolved { iterations: 2 });
        assert_eq!(report.iterations[0].open_after, 1);

        let scans = cleanup.scans.lock().unwrap();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].files, vec![PathBuf::from("src/lib.rs")]);
    }

    #[tokio::test]
    async fn test_from_config_splits_cleanup_pass() {
        let (_dir, store) = queue_store();
        let section = ReviewSection {
            cleanup_pass: Some("slop-cleanup".to_string()),
            max_stalls: 5,
            ..ReviewSection::default()
        };
        let passes = vec![
            ScriptedPass::new("lint", vec![vec![]]) as Arc<dyn AnalysisPass>,
            ScriptedPass::new("slop-cleanup", vec![vec![]]),
        ];
        let looper =
            ConvergenceLoop::from_config(&section, passes, RecordingFixer::succeeding(), store).unwrap();

        assert_eq!(looper.dispatcher.pass_ids(), vec!["lint"]);
        assert_eq!(looper.pass_ids(), vec!["lint", "slop-cleanup"]);
        assert_eq!(looper.settings().max_stalls, 5);
    }

    fn from_section(section: ReviewSection, ids: &[&'static str]) -> Result<ConvergenceLoop, ReviewError> {
        let (_dir, store) = queue_store();
        let passes = ids
            .iter()
            .map(|&id| ScriptedPass::new(id, vec![vec![]]) as Arc<dyn AnalysisPass>)
            .collect();
        ConvergenceLoop::from_config(&section, passes, RecordingFixer::succeeding(), store)
    }

    #[test]
    fn test_from_config_rejects_zero_stalls() {
        let section = ReviewSection {
            max_stalls: 0,
            ..ReviewSection::default()
        };
        let err = from_section(section, &["lint"]).err().unwrap();
        assert!(matches!(&err, ReviewError::Config(msg) if msg.contains("max_stalls")));
    }

    #[test]
    fn test_from_config_rejects_zero_iterations() {
        let section = ReviewSection {
            max_iterations: 0,
            ..ReviewSection::default()
        };
        let err = from_section(section, &["lint"]).err().unwrap();
        assert!(matches!(&err, ReviewError::Config(msg) if msg.contains("max_iterations")));
    }

    #[test]
    fn test_from_config_rejects_out_of_range_confidence() {
        for min_confidence in [1.5, -0.1, f64::NAN] {
            let section = ReviewSection {
                min_confidence,
                ..ReviewSection::default()
            };
            let err = from_section(section, &["lint"]).err().unwrap();
            assert!(matches!(&err, ReviewError::Config(msg) if msg.contains("min_confidence")));
        }
    }

    #[test]
    fn test_from_config_rejects_duplicate_pass_ids() {
        let err = from_section(ReviewSection::default(), &["lint", "security", "lint"])
            .err()
            .unwrap();
        assert!(matches!(&err, ReviewError::Config(msg) if msg.contains("'lint'")));

        // The cleanup pass shares the id namespace.
        let section = ReviewSection {
            cleanup_pass: Some("lint".to_string()),
            ..ReviewSection::default()
        };
        assert!(from_section(section, &["lint", "lint"]).is_err());
    }

    #[tokio::test]
    async fn test_zero_stall_bound_is_rejected_before_scanning() {
        let (_dir, store) = queue_store();
        let pass = ScriptedPass::new("lint", vec![vec![finding(Severity::Low, "x")]]);
        let looper = build(vec![pass.clone()], RecordingFixer::succeeding(), store.clone(), settings(10, 0));

        let err = looper.run(scope()).await.unwrap_err();
        assert!(matches!(err, ReviewError::Config(_)));
        assert_eq!(pass.scan_count(), 0);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_from_another_workflow_is_discarded() {
        let (_dir, store) = queue_store();
        let mut stale = ReviewQueue::new(ReviewScope::new(["old.rs"]), vec!["lint".into()])
            .with_workflow("wf-old");
        stale.ingest(vec![Finding::new("lint", Severity::High, "old.rs", "stale")]);
        stale.mark_blocked(BlockReason::StallDetected);
        store.save(&mut stale).unwrap();

        let pass = ScriptedPass::new("lint", vec![vec![]]);
        let looper = build(vec![pass.clone()], RecordingFixer::succeeding(), store.clone(), settings(10, 2));

        let report = looper.run_for_workflow("wf-new", scope()).await.unwrap();
        assert_eq!(report.outcome, ConvergenceOutcome::Resolved { iterations: 0 });
        assert_eq!(pass.scans.lock().unwrap().as_slice(), &[scope()]);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_of_same_workflow_is_resumed() {
        let (_dir, store) = queue_store();
        let pass = ScriptedPass::new("lint", vec![vec![finding(Severity::Medium, "stuck")]]);
        let looper = build(vec![pass.clone()], RecordingFixer::failing(), store.clone(), settings(10, 1));

        let first = looper.run_for_workflow("wf-1", scope()).await.unwrap();
        assert!(matches!(first.outcome, ConvergenceOutcome::Blocked { .. }));
        let persisted = store.load().unwrap().unwrap();
        assert!(persisted.belongs_to("wf-1"));

        let scans = pass.scan_count();
        let again = looper.run_for_workflow("wf-1", ReviewScope::new(["other.rs"])).await.unwrap();
        assert!(matches!(again.outcome, ConvergenceOutcome::Blocked { .. }));
        assert_eq!(pass.scan_count(), scans);
    }

    /// Reports touched files with a leading `./`.
    struct DotSlashFixer;

    #[async_trait]
    impl FixApplier for DotSlashFixer {
        async fn apply(&self, finding: &Finding) -> Result<FixOutcome> {
            Ok(FixOutcome::Applied {
                files: vec![PathBuf::from(format!("./{}", finding.file))],
            })
        }
    }

    #[tokio::test]
    async fn test_cleanup_matches_files_regardless_of_dot_prefix() {
        let (_dir, store) = queue_store();
        let main = ScriptedPass::new("lint", vec![vec![finding(Severity::High, "A")], vec![]]);
        let cleanup = ScriptedPass::new(
            "slop-cleanup",
            vec![
                vec![PassFinding::new(Severity::Low, "src/lib.rs", "leftover debug print")],
                vec![],
            ],
        );
        let looper = build(vec![main], Arc::new(DotSlashFixer), store, settings(10, 2))
            .with_cleanup_pass(cleanup);

        let report = looper.run(scope()).await.unwrap();
        assert_eq!(report.outcome, ConvergenceOutcome::Resolved { iterations: 2 });
    }

    #[test]
    fn test_normalize_path_drops_current_dir() {
        assert_eq!(normalize_path(Path::new("./src/x.rs")), PathBuf::from("src/x.rs"));
        assert_eq!(normalize_path(Path::new("src/./x.rs")), PathBuf::from("src/x.rs"));
        assert_eq!(normalize_path(Path::new("/abs/x.rs")), PathBuf::from("/abs/x.rs"));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ConvergenceOutcome::Blocked {
            reason: BlockReason::StallDetected,
            iterations: 3,
            remaining: SeverityCounts {
                low: 1,
                ..SeverityCounts::default()
            },
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "blocked");
        assert_eq!(value["reason"], "stall-detected");
        assert_eq!(value["remaining"]["low"], 1);
        assert_eq!(outcome.iterations(), 3);
        assert!(!outcome.is_resolved());
    }

    #[test]
    fn test_false_positive_status_survives_in_items() {
        let mut queue = ReviewQueue::new(scope(), vec!["lint".into()]);
        queue.replace_items(
            Vec::new(),
            PassReport {
                pass: "lint".into(),
                findings: vec![finding(Severity::Low, "x").with_confidence(0.1)],
            }
            .into_findings(0.5),
        );
        assert_eq!(queue.items[0].status, FindingStatus::FalsePositive);
        assert_eq!(queue.open_count(), 0);
    }
}
