//! Review convergence for the `review-loop` phase.
//!
//! Analysis passes scan the changed files, a fix applier addresses what they
//! report, and the loop repeats until nothing is open or it stops making
//! progress. State survives restarts through `review-queue.json`.
//!
//! ## Components
//!
//! - [`findings`]: finding, severity and pass report types
//! - [`digest`]: the open-set fingerprint used for stall detection
//! - [`queue`]: the persisted review queue
//! - [`collaborators`]: pass, fixer and committer seams with command and git backends
//! - [`dispatcher`]: concurrent pass fan-out with per-pass timeouts
//! - [`convergence`]: the fix, commit, re-scan loop
//!
//! ## Example
//!
//! ```
//! use conductor::review::{Finding, ReviewQueue, ReviewScope, Severity};
//!
//! let mut queue = ReviewQueue::new(ReviewScope::new(["src/auth.rs"]), vec!["security".into()]);
//! queue.ingest(vec![
//!     Finding::new("security", Severity::High, "src/auth.rs", "Token logged").with_line(42),
//!     Finding::new("security", Severity::Low, "src/auth.rs", "Token logged").with_line(42),
//! ]);
//!
//! assert_eq!(queue.items.len(), 1);
//! assert_eq!(queue.items[0].severity, Severity::High);
//! ```

pub mod collaborators;
pub mod convergence;
pub mod digest;
pub mod dispatcher;
pub mod findings;
pub mod queue;

pub use collaborators::{
    AnalysisPass, ChangeCommitter, CommandFixer, CommandPass, FixApplier, FixOutcome,
    GitCommitter, NoopCommitter,
};
pub use convergence::{
    AbortSignal, ConvergenceLoop, ConvergenceOutcome, ConvergenceReport, IterationReport,
    LoopSettings,
};
pub use digest::{DigestMode, open_set_digest};
pub use dispatcher::{PassDispatcher, PassFailure, ScanRound};
pub use findings::{
    Finding, FindingKey, FindingStatus, PassFinding, PassReport, Severity, SeverityCounts,
};
pub use queue::{BlockReason, QueueStatus, QueueStore, ReviewQueue, ReviewScope};
