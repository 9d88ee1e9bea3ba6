//! Persisted phase transitions.
//!
//! Every transition is a compare-and-swap read-modify-write through
//! [`StateStore::modify`], so two drivers racing on one directory cannot
//! interleave half-applied transitions.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use super::Phase;
use crate::errors::PhaseError;
use crate::state::atomic::remove_if_exists;
use crate::state::document::millis_between;
use crate::state::merge::{RESERVED_KEYS, deep_merge};
use crate::state::{
    PhaseHistoryEntry, PhaseStatus, Policy, ReadOptions, StateStore, WorkflowState,
    WorkflowStatus,
};

/// Reason recorded on an entry left `in_progress` by a crashed run.
const INTERRUPTED: &str = "interrupted";

/// Where a resumed run should pick up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePoint {
    pub phase: Phase,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Read-only summary of a workflow for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub current: Phase,
    pub in_progress: Option<Phase>,
    pub iteration: u32,
    pub can_resume: bool,
    pub phases_completed: u32,
    pub phases_failed: u32,
    pub phases_skipped: u32,
    pub history_len: usize,
    pub revision: u64,
    pub total_duration: Option<u64>,
}

impl From<&WorkflowState> for WorkflowSnapshot {
    fn from(state: &WorkflowState) -> Self {
        Self {
            id: state.workflow.id.clone(),
            workflow_type: state.workflow.workflow_type.clone(),
            status: state.workflow.status,
            current: state.phases.current,
            in_progress: state
                .in_progress_index()
                .map(|i| state.phases.history[i].phase),
            iteration: state.phases.iteration,
            can_resume: state.checkpoints.can_resume,
            phases_completed: state.metrics.phases_completed,
            phases_failed: state.metrics.phases_failed,
            phases_skipped: state.metrics.phases_skipped,
            history_len: state.phases.history.len(),
            revision: state.revision,
            total_duration: state.metrics.total_duration,
        }
    }
}

/// Drives the phase sequence of the workflow stored under one base directory.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    store: StateStore,
    base_dir: PathBuf,
}

impl PhaseMachine {
    pub fn new(store: StateStore, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Create a new pending workflow.
    ///
    /// Fails if a workflow that is neither completed nor aborted already
    /// exists. A finished workflow left in place is archived first, and any
    /// review queue left behind is dropped.
    pub fn create_workflow(
        &self,
        workflow_type: &str,
        policy: Policy,
        task: Value,
    ) -> Result<WorkflowState, PhaseError> {
        if workflow_type.trim().is_empty() {
            return Err(PhaseError::Validation(
                "workflow type must not be empty".to_string(),
            ));
        }

        if let Some(existing) = self.store.read(&self.base_dir, ReadOptions::fresh())? {
            if !existing.is_terminal() {
                return Err(PhaseError::Validation(format!(
                    "workflow {} is still {}",
                    existing.workflow.id, existing.workflow.status
                )));
            }
            self.store.archive(&self.base_dir)?;
        }
        self.discard_review_queue()?;

        let state = WorkflowState::new(workflow_type, policy, task);
        let state = self.store.write_if_revision(&state, &self.base_dir, 0)?;
        tracing::info!(
            workflow = %state.workflow.id,
            workflow_type = %state.workflow.workflow_type,
            "Created workflow"
        );
        Ok(state)
    }

    /// The stored workflow, or [`PhaseError::NoWorkflow`].
    pub fn load(&self) -> Result<WorkflowState, PhaseError> {
        self.store
            .read(&self.base_dir, ReadOptions::default())?
            .ok_or_else(|| PhaseError::NoWorkflow(self.base_dir.clone()))
    }

    pub fn status(&self) -> Result<WorkflowSnapshot, PhaseError> {
        Ok(WorkflowSnapshot::from(&self.load()?))
    }

    /// Where a resumed run re-enters, or `None` for a finished workflow.
    pub fn resume_point(&self) -> Result<Option<ResumePoint>, PhaseError> {
        let state = self.load()?;
        if state.is_terminal() || !state.checkpoints.can_resume {
            return Ok(None);
        }
        let phase = state
            .checkpoints
            .resume_from
            .unwrap_or(state.phases.current);
        if phase.is_terminal() {
            return Ok(None);
        }
        Ok(Some(ResumePoint {
            phase,
            attempt: state.phases.iteration,
            context: state.checkpoints.resume_context.clone(),
        }))
    }

    /// Whether the stored workflow has been aborted.
    pub fn is_aborted(&self) -> Result<bool, PhaseError> {
        Ok(self.load()?.workflow.status == WorkflowStatus::Aborted)
    }

    fn transition<T, F>(&self, f: F) -> Result<(WorkflowState, T), PhaseError>
    where
        F: FnMut(&mut WorkflowState) -> Result<T, PhaseError>,
    {
        self.store
            .modify(&self.base_dir, f)?
            .ok_or_else(|| PhaseError::NoWorkflow(self.base_dir.clone()))
    }

    /// Start the phase named `name`.
    pub fn start(&self, name: &str) -> Result<WorkflowState, PhaseError> {
        let phase: Phase = name.parse()?;
        self.start_phase(phase)
    }

    /// Open a new `in_progress` history entry for `phase` and make it current.
    ///
    /// Restarting the current phase counts a new attempt. Starting a phase
    /// before `current` is rejected. An entry still open from a crashed run
    /// is closed as failed first.
    pub fn start_phase(&self, phase: Phase) -> Result<WorkflowState, PhaseError> {
        if phase.is_terminal() {
            return Err(PhaseError::Validation(
                "the 'complete' sentinel cannot be started".to_string(),
            ));
        }

        let (state, ()) = self.transition(|state| {
            ensure_active(state)?;
            let current = state.phases.current;
            if phase < current {
                return Err(PhaseError::Validation(format!(
                    "cannot start '{}' after '{}'",
                    phase, current
                )));
            }

            let now = Utc::now();
            if let Some(i) = state.in_progress_index() {
                let entry = &mut state.phases.history[i];
                tracing::warn!(phase = %entry.phase, "Closing interrupted phase");
                entry.close(PhaseStatus::Failed, now);
                entry.reason = Some(INTERRUPTED.to_string());
                state.metrics.phases_failed += 1;
            }

            let attempted_before = state.phases.history.iter().any(|e| e.phase == phase);
            state.phases.iteration = if phase == current && attempted_before {
                state.phases.iteration + 1
            } else {
                1
            };
            state.phases.history.push(PhaseHistoryEntry::started(phase, now));
            state.phases.current = phase;
            state.checkpoints.resume_from = Some(phase);
            state.checkpoints.can_resume = true;
            state.workflow.status = WorkflowStatus::InProgress;
            Ok(())
        })?;

        tracing::info!(phase = %phase, attempt = state.phases.iteration, "Phase started");
        Ok(state)
    }

    /// Close the in-progress phase as completed and advance `current`.
    pub fn complete(&self, result: Option<Value>) -> Result<WorkflowState, PhaseError> {
        let (state, (phase, duration)) = self.transition(|state| {
            ensure_active(state)?;
            let i = state
                .in_progress_index()
                .ok_or_else(|| PhaseError::Validation("no phase is in progress".to_string()))?;

            let entry = &mut state.phases.history[i];
            entry.close(PhaseStatus::Completed, Utc::now());
            entry.result = result.clone();
            let phase = entry.phase;
            let duration = entry.duration;

            let next = phase.next();
            state.phases.current = next;
            state.phases.iteration = 0;
            state.checkpoints.resume_from = Some(next);
            state.checkpoints.resume_context = None;
            state.metrics.phases_completed += 1;
            Ok((phase, duration))
        })?;

        tracing::info!(
            phase = %phase,
            next = %state.phases.current,
            duration_ms = ?duration,
            "Phase completed"
        );
        Ok(state)
    }

    /// Close the in-progress phase as failed. `current` is left unchanged so
    /// the same phase is re-entered on resume with `context`.
    pub fn fail(&self, reason: &str, context: Option<Value>) -> Result<WorkflowState, PhaseError> {
        let (state, phase) = self.transition(|state| {
            ensure_active(state)?;
            let i = state
                .in_progress_index()
                .ok_or_else(|| PhaseError::Validation("no phase is in progress".to_string()))?;

            let entry = &mut state.phases.history[i];
            entry.close(PhaseStatus::Failed, Utc::now());
            entry.reason = Some(reason.to_string());
            let phase = entry.phase;

            state.checkpoints.resume_from = Some(state.phases.current);
            state.checkpoints.resume_context = context.clone();
            state.checkpoints.can_resume = true;
            state.workflow.status = WorkflowStatus::Failed;
            state.metrics.phases_failed += 1;
            Ok(phase)
        })?;

        tracing::warn!(phase = %phase, reason, "Phase failed");
        Ok(state)
    }

    /// Jump forward to `target`, recording one zero-duration `skipped` entry
    /// for every phase from `current` up to (not including) `target`.
    ///
    /// An in-progress entry for `current` is closed as skipped and counts as
    /// that phase's entry.
    pub fn skip_to(&self, target: Phase, reason: &str) -> Result<WorkflowState, PhaseError> {
        let (state, (from, skipped)) = self.transition(|state| {
            ensure_active(state)?;
            let from = state.phases.current;
            if target <= from {
                return Err(PhaseError::Validation(format!(
                    "cannot skip from '{}' to '{}'",
                    from, target
                )));
            }

            let now = Utc::now();
            let mut open_current = false;
            if let Some(i) = state.in_progress_index() {
                let entry = &mut state.phases.history[i];
                if entry.phase == from {
                    entry.close(PhaseStatus::Skipped, now);
                    entry.reason = Some(reason.to_string());
                    open_current = true;
                } else {
                    entry.close(PhaseStatus::Failed, now);
                    entry.reason = Some(INTERRUPTED.to_string());
                    state.metrics.phases_failed += 1;
                }
            }

            let skipped = &Phase::ALL[from.index()..target.index()];
            let synthesized = if open_current { &skipped[1..] } else { skipped };
            for &phase in synthesized {
                state.phases.history.push(PhaseHistoryEntry {
                    phase,
                    status: PhaseStatus::Skipped,
                    started_at: now,
                    completed_at: Some(now),
                    duration: Some(0),
                    result: None,
                    reason: Some(reason.to_string()),
                });
            }

            state.metrics.phases_skipped += skipped.len() as u32;
            state.phases.current = target;
            state.phases.iteration = 0;
            state.checkpoints.resume_from = Some(target);
            state.checkpoints.resume_context = None;
            Ok((from, skipped.len()))
        })?;

        tracing::info!(from = %from, to = %target, skipped, reason, "Skipped phases");
        Ok(state)
    }

    /// Mark the workflow completed.
    pub fn complete_workflow(&self) -> Result<WorkflowState, PhaseError> {
        let (state, ()) = self.transition(|state| {
            ensure_active(state)?;
            if let Some(i) = state.in_progress_index() {
                return Err(PhaseError::Validation(format!(
                    "phase '{}' is still in progress",
                    state.phases.history[i].phase
                )));
            }
            finish(state, WorkflowStatus::Completed);
            Ok(())
        })?;

        tracing::info!(
            workflow = %state.workflow.id,
            total_duration_ms = ?state.metrics.total_duration,
            "Workflow completed"
        );
        Ok(state)
    }

    /// Abort the workflow. An in-progress phase is closed as failed.
    pub fn abort_workflow(&self, reason: &str) -> Result<WorkflowState, PhaseError> {
        let (state, ()) = self.transition(|state| {
            ensure_active(state)?;
            if let Some(i) = state.in_progress_index() {
                let entry = &mut state.phases.history[i];
                entry.close(PhaseStatus::Failed, Utc::now());
                entry.reason = Some(format!("aborted: {}", reason));
                state.metrics.phases_failed += 1;
            }
            state.workflow.abort_reason = Some(reason.to_string());
            finish(state, WorkflowStatus::Aborted);
            Ok(())
        })?;
        self.discard_review_queue()?;

        tracing::warn!(workflow = %state.workflow.id, reason, "Workflow aborted");
        Ok(state)
    }

    /// Deep-merge `payload` into `agents.<name>`.
    pub fn record_agent(&self, name: &str, payload: Value) -> Result<WorkflowState, PhaseError> {
        if name.trim().is_empty() || RESERVED_KEYS.contains(&name) {
            return Err(PhaseError::Validation(format!(
                "invalid agent name '{}'",
                name
            )));
        }

        let (state, ()) = self.transition(|state| {
            let slot = state
                .agents
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            deep_merge(slot, payload.clone())?;
            Ok(())
        })?;

        tracing::debug!(agent = name, "Recorded agent output");
        Ok(state)
    }

    /// Move a finished workflow into the archive directory.
    pub fn archive(&self) -> Result<Option<PathBuf>, PhaseError> {
        let state = self.load()?;
        if !state.is_terminal() {
            return Err(PhaseError::Validation(format!(
                "workflow {} is still {}",
                state.workflow.id, state.workflow.status
            )));
        }
        let archived = self.store.archive(&self.base_dir)?;
        self.discard_review_queue()?;
        Ok(archived)
    }

    /// Remove `review-queue.json`; it belongs to the workflow being closed.
    fn discard_review_queue(&self) -> Result<(), PhaseError> {
        let queue = self.store.paths(&self.base_dir)?.queue_file();
        if remove_if_exists(&queue)? {
            tracing::debug!(path = %queue.display(), "Removed review queue");
        }
        Ok(())
    }
}

fn ensure_active(state: &WorkflowState) -> Result<(), PhaseError> {
    if state.is_terminal() {
        return Err(PhaseError::Validation(format!(
            "workflow {} is already {}",
            state.workflow.id, state.workflow.status
        )));
    }
    Ok(())
}

fn finish(state: &mut WorkflowState, status: WorkflowStatus) {
    let now = Utc::now();
    state.workflow.status = status;
    state.workflow.completed_at = Some(now);
    state.checkpoints.can_resume = false;
    state.metrics.total_duration = Some(millis_between(state.workflow.started_at, now));
}
