//! The persisted workflow document.
//!
//! Field names serialize in camelCase. Unknown keys, at the top level and
//! inside `policy`, are kept in `extra` maps so documents written by newer
//! tooling survive a round trip through this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::phase::Phase;

/// Schema version written into every new document.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    /// Completed and aborted workflows accept no further phase transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

/// Run policy chosen during `policy-selection`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_source: Option<String>,
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseHistoryEntry {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds between `started_at` and `completed_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PhaseHistoryEntry {
    pub fn started(phase: Phase, at: DateTime<Utc>) -> Self {
        Self {
            phase,
            status: PhaseStatus::InProgress,
            started_at: at,
            completed_at: None,
            duration: None,
            result: None,
            reason: None,
        }
    }

    /// Close an open entry with `status` at `at`.
    pub fn close(&mut self, status: PhaseStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
        self.duration = Some(millis_between(self.started_at, at));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phases {
    pub current: Phase,
    /// Attempts at `current`, counting the first start as 1.
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub history: Vec<PhaseHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoints {
    pub can_resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_context: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Milliseconds from workflow start to its terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default)]
    pub phases_completed: u32,
    #[serde(default)]
    pub phases_failed: u32,
    #[serde(default)]
    pub phases_skipped: u32,
}

/// The complete workflow document stored in `workflow-state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub version: u32,
    /// Write stamp, bumped by every successful persist.
    #[serde(default)]
    pub revision: u64,
    pub workflow: WorkflowInfo,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub task: Value,
    #[serde(default)]
    pub git: Value,
    #[serde(default)]
    pub pr: Value,
    #[serde(default)]
    pub agents: Map<String, Value>,
    pub phases: Phases,
    pub checkpoints: Checkpoints,
    #[serde(default)]
    pub metrics: Metrics,
    pub last_updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowState {
    /// A fresh pending workflow positioned at the first phase.
    pub fn new(workflow_type: impl Into<String>, policy: Policy, task: Value) -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION,
            revision: 0,
            workflow: WorkflowInfo {
                id: uuid::Uuid::new_v4().to_string(),
                workflow_type: workflow_type.into(),
                status: WorkflowStatus::Pending,
                started_at: now,
                completed_at: None,
                abort_reason: None,
            },
            policy,
            task,
            git: Value::Null,
            pr: Value::Null,
            agents: Map::new(),
            phases: Phases {
                current: Phase::first(),
                iteration: 0,
                history: Vec::new(),
            },
            checkpoints: Checkpoints {
                can_resume: true,
                resume_from: Some(Phase::first()),
                resume_context: None,
            },
            metrics: Metrics::default(),
            last_updated_at: now,
            extra: Map::new(),
        }
    }

    /// Index of the single open history entry, if any.
    pub fn in_progress_index(&self) -> Option<usize> {
        self.phases
            .history
            .iter()
            .rposition(|e| e.status == PhaseStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        self.workflow.status.is_terminal()
    }
}

pub(crate) fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
