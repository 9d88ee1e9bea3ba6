//! Typed error hierarchy for the conductor core.
//!
//! Three top-level enums cover the three subsystems:
//! - `StateError`: persistence of the workflow and queue documents
//! - `PhaseError`: phase machine transitions
//! - `ReviewError`: the convergence loop and its collaborators
//!
//! Loop limits are not errors: a tripped iteration or stall bound comes back
//! as [`crate::review::ConvergenceOutcome::Blocked`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the state store and the files it manages.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Corrupted state at {path}: {message}")]
    Corrupted { path: PathBuf, message: String },

    #[error("I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Concurrent modification: expected revision {expected}, found {found}")]
    ConcurrencyConflict { expected: u64, found: u64 },

    #[error("Merge exceeded maximum nesting depth of {limit}")]
    MergeDepthExceeded { limit: usize },

    #[error("Failed to serialize document: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Blocking state task failed: {0}")]
    TaskFailed(String),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Errors from phase machine transitions.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("No workflow state exists in {0}")]
    NoWorkflow(PathBuf),

    #[error("Invalid transition: {0}")]
    Validation(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors from the convergence loop.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("No analysis passes configured")]
    NoPasses,

    #[error("Invalid review configuration: {0}")]
    Config(String),

    #[error("Analysis pass '{pass}' failed: {message}")]
    PassFailed { pass: String, message: String },

    #[error("Commit of iteration {iteration} failed: {message}")]
    CommitFailed { iteration: u32, message: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_io_carries_path() {
        let err = StateError::io(
            "/work/.conductor/workflow-state.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        match &err {
            StateError::Io { path, source } => {
                assert_eq!(path, &PathBuf::from("/work/.conductor/workflow-state.json"));
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io variant"),
        }
        assert!(err.to_string().contains("workflow-state.json"));
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(StateError::ConcurrencyConflict {
            expected: 3,
            found: 4
        }
        .is_retryable());
        assert!(!StateError::Validation("bad".into()).is_retryable());
        assert!(!StateError::MergeDepthExceeded { limit: 32 }.is_retryable());
        assert!(!StateError::TaskFailed("panicked".into()).is_retryable());
    }

    #[test]
    fn phase_error_converts_from_state_error() {
        let inner = StateError::Validation("null byte in path".to_string());
        let err: PhaseError = inner.into();
        match &err {
            PhaseError::State(StateError::Validation(msg)) => {
                assert_eq!(msg, "null byte in path");
            }
            _ => panic!("Expected PhaseError::State(Validation(...))"),
        }
    }

    #[test]
    fn review_error_wraps_phase_error() {
        let err: ReviewError = PhaseError::UnknownPhase("deploy".into()).into();
        assert!(matches!(err, ReviewError::Phase(PhaseError::UnknownPhase(_))));
        assert!(err.to_string().contains("deploy"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StateError::MergeDepthExceeded { limit: 1 });
        assert_std_error(&PhaseError::UnknownPhase("x".into()));
        assert_std_error(&ReviewError::NoPasses);
    }
}
