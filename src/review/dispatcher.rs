//! Concurrent fan-out over the configured analysis passes.
//!
//! Every pass runs as its own future under a per-pass timeout; the round
//! completes when all of them have either reported or failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use super::collaborators::AnalysisPass;
use super::findings::PassReport;
use super::queue::ReviewScope;

/// Default timeout for a single analysis pass.
pub const DEFAULT_PASS_TIMEOUT_SECS: u64 = 300;

/// A pass that errored or ran out of time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassFailure {
    pub pass: String,
    pub message: String,
}

/// Everything one fan-out produced.
#[derive(Debug, Clone, Default)]
pub struct ScanRound {
    pub reports: Vec<PassReport>,
    pub failures: Vec<PassFailure>,
    pub duration: Duration,
}

impl ScanRound {
    pub fn failed_passes(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.pass.clone()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct PassDispatcher {
    passes: Vec<Arc<dyn AnalysisPass>>,
    pass_timeout: Duration,
}

impl PassDispatcher {
    pub fn new(passes: Vec<Arc<dyn AnalysisPass>>) -> Self {
        Self {
            passes,
            pass_timeout: Duration::from_secs(DEFAULT_PASS_TIMEOUT_SECS),
        }
    }

    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    pub fn pass_timeout(&self) -> Duration {
        self.pass_timeout
    }

    pub fn pass_ids(&self) -> Vec<String> {
        self.passes.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Run every pass over `scope` concurrently.
    pub async fn dispatch(&self, scope: &ReviewScope) -> ScanRound {
        let start = Instant::now();
        let futures: Vec<_> = self
            .passes
            .iter()
            .map(|pass| run_pass(pass.as_ref(), scope, self.pass_timeout))
            .collect();

        let mut round = ScanRound::default();
        for result in join_all(futures).await {
            match result {
                Ok(report) => round.reports.push(report),
                Err(failure) => {
                    tracing::warn!(pass = %failure.pass, error = %failure.message, "Analysis pass failed");
                    round.failures.push(failure);
                }
            }
        }
        round.duration = start.elapsed();

        tracing::debug!(
            passes = self.passes.len(),
            failed = round.failures.len(),
            duration_ms = round.duration.as_millis() as u64,
            "Scan round complete"
        );
        round
    }
}

/// Run one pass under `timeout`. Findings are attributed to the pass id.
pub async fn run_pass(
    pass: &dyn AnalysisPass,
    scope: &ReviewScope,
    timeout: Duration,
) -> Result<PassReport, PassFailure> {
    let id = pass.id().to_string();
    match tokio::time::timeout(timeout, pass.scan(scope)).await {
        Ok(Ok(mut report)) => {
            report.pass = id;
            Ok(report)
        }
        Ok(Err(e)) => Err(PassFailure {
            pass: id,
            message: format!("{:#}", e),
        }),
        Err(_) => Err(PassFailure {
            pass: id,
            message: format!("timed out after {}s", timeout.as_secs_f64()),
        }),
    }
}
