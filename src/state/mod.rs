//! Durable persistence of the workflow document.
//!
//! [`StateStore`] owns reads and writes of `workflow-state.json` under a base
//! directory: atomic replacement on write, a short TTL cache on read,
//! optimistic concurrency through the document `revision`, and a bounded,
//! reserved-key-safe merge for partial updates.

pub mod atomic;
pub mod cache;
pub mod document;
pub mod merge;
pub mod paths;
pub mod store;

pub use cache::{DEFAULT_CACHE_TTL, StateCache};
pub use document::{
    Checkpoints, Metrics, PhaseHistoryEntry, PhaseStatus, Phases, Policy, SCHEMA_VERSION,
    WorkflowInfo, WorkflowState, WorkflowStatus,
};
pub use merge::MAX_MERGE_DEPTH;
pub use paths::{StatePaths, resolve};
pub use store::{ReadOptions, StateStore, run_blocking};
