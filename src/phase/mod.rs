//! The fixed, ordered phase set of a workflow run.
//!
//! This module provides:
//! - [`Phase`], the 18 phases in execution order, ending in the `complete` sentinel
//! - O(1) name and index lookups through a table built once on first use
//! - [`PhaseMachine`], the persisted transition engine over [`crate::state::StateStore`]

pub mod machine;

pub use machine::{PhaseMachine, ResumePoint, WorkflowSnapshot};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::errors::PhaseError;

/// A workflow phase. Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    PolicySelection,
    TaskDiscovery,
    WorktreeSetup,
    Exploration,
    Planning,
    UserApproval,
    Implementation,
    PreReviewGates,
    ReviewLoop,
    DeliveryValidation,
    DocsUpdate,
    ShipPrep,
    CreatePr,
    CiWait,
    CommentMonitoring,
    Merge,
    Cleanup,
    /// Terminal sentinel. Never started, only reached.
    Complete,
}

impl Phase {
    /// Every phase in execution order.
    pub const ALL: [Phase; 18] = [
        Phase::PolicySelection,
        Phase::TaskDiscovery,
        Phase::WorktreeSetup,
        Phase::Exploration,
        Phase::Planning,
        Phase::UserApproval,
        Phase::Implementation,
        Phase::PreReviewGates,
        Phase::ReviewLoop,
        Phase::DeliveryValidation,
        Phase::DocsUpdate,
        Phase::ShipPrep,
        Phase::CreatePr,
        Phase::CiWait,
        Phase::CommentMonitoring,
        Phase::Merge,
        Phase::Cleanup,
        Phase::Complete,
    ];

    pub fn first() -> Phase {
        Phase::ALL[0]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PolicySelection => "policy-selection",
            Phase::TaskDiscovery => "task-discovery",
            Phase::WorktreeSetup => "worktree-setup",
            Phase::Exploration => "exploration",
            Phase::Planning => "planning",
            Phase::UserApproval => "user-approval",
            Phase::Implementation => "implementation",
            Phase::PreReviewGates => "pre-review-gates",
            Phase::ReviewLoop => "review-loop",
            Phase::DeliveryValidation => "delivery-validation",
            Phase::DocsUpdate => "docs-update",
            Phase::ShipPrep => "ship-prep",
            Phase::CreatePr => "create-pr",
            Phase::CiWait => "ci-wait",
            Phase::CommentMonitoring => "comment-monitoring",
            Phase::Merge => "merge",
            Phase::Cleanup => "cleanup",
            Phase::Complete => "complete",
        }
    }

    /// Position in [`Phase::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(index: usize) -> Option<Phase> {
        Phase::ALL.get(index).copied()
    }

    /// The phase after this one; `complete` is its own successor.
    pub fn next(&self) -> Phase {
        Phase::from_index(self.index() + 1).unwrap_or(Phase::Complete)
    }

    pub fn is_terminal(&self) -> bool {
        *self == Phase::Complete
    }

    /// Look up a phase by its kebab-case name.
    pub fn lookup(name: &str) -> Option<Phase> {
        PHASE_INDEX.get(name).map(|&i| Phase::ALL[i])
    }
}

static PHASE_INDEX: LazyLock<HashMap<&'static str, usize>> = LazyLock::new(|| {
    Phase::ALL
        .iter()
        .enumerate()
        .map(|(i, phase)| (phase.as_str(), i))
        .collect()
});

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::lookup(s.trim()).ok_or_else(|| PhaseError::UnknownPhase(s.to_string()))
    }
}
