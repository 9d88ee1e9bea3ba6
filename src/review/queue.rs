//! The persisted review queue and its on-disk store.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::findings::{Finding, FindingKey, SeverityCounts};
use crate::errors::StateError;
use crate::state::{StatePaths, run_blocking};
use crate::state::atomic::{read_json, remove_if_exists, write_json_atomic};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[default]
    Open,
    Resolved,
    Blocked,
}

/// Why a queue stopped without resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    IterationLimit,
    StallDetected,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::IterationLimit => write!(f, "iteration-limit"),
            BlockReason::StallDetected => write!(f, "stall-detected"),
        }
    }
}

/// The files a review covers, in the order they were given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewScope {
    pub files: Vec<PathBuf>,
}

impl ReviewScope {
    pub fn new(files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewQueue {
    /// The workflow this review belongs to; other workflows do not resume it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub status: QueueStatus,
    pub scope: ReviewScope,
    #[serde(default)]
    pub passes: Vec<String>,
    #[serde(default)]
    pub items: Vec<Finding>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub stall_count: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remaining: SeverityCounts,
}

impl ReviewQueue {
    pub fn new(scope: ReviewScope, passes: Vec<String>) -> Self {
        Self {
            workflow_id: None,
            status: QueueStatus::Open,
            scope,
            passes,
            items: Vec::new(),
            iteration: 0,
            stall_count: 0,
            updated_at: Utc::now(),
            blocked_reason: None,
            blocked_at: None,
            remaining: SeverityCounts::default(),
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Whether a run for `workflow_id` may pick this queue up.
    pub fn belongs_to(&self, workflow_id: &str) -> bool {
        self.workflow_id.as_deref() == Some(workflow_id)
    }

    pub fn open_items(&self) -> impl Iterator<Item = &Finding> {
        self.items.iter().filter(|f| f.is_open())
    }

    pub fn open_count(&self) -> usize {
        self.open_items().count()
    }

    /// Add findings, folding duplicates into the item already holding the key.
    pub fn ingest(&mut self, findings: impl IntoIterator<Item = Finding>) {
        let mut index: HashMap<FindingKey, usize> = self
            .items
            .iter()
            .enumerate()
            .map(|(i, f)| (f.key(), i))
            .collect();

        for finding in findings {
            let key = finding.key();
            if let Some(&i) = index.get(&key) {
                self.items[i].merge(finding);
            } else {
                index.insert(key, self.items.len());
                self.items.push(finding);
            }
        }
    }

    /// Replace the item set with the result of a fresh scan.
    ///
    /// `carried` are earlier items kept because the pass that reported them
    /// could not re-run; they are ingested ahead of the new findings.
    pub fn replace_items(&mut self, carried: Vec<Finding>, scanned: Vec<Finding>) {
        self.items.clear();
        self.ingest(carried);
        self.ingest(scanned);
        self.refresh_remaining();
    }

    pub fn refresh_remaining(&mut self) {
        self.remaining = SeverityCounts::from_open(&self.items);
    }

    pub fn mark_resolved(&mut self) {
        self.status = QueueStatus::Resolved;
        self.blocked_reason = None;
        self.blocked_at = None;
        self.refresh_remaining();
    }

    pub fn mark_blocked(&mut self, reason: BlockReason) {
        self.status = QueueStatus::Blocked;
        self.blocked_reason = Some(reason);
        self.blocked_at = Some(Utc::now());
        self.refresh_remaining();
    }

    /// Clear a block so the loop can continue, typically with raised limits.
    ///
    /// The stall counter restarts; the iteration count is kept.
    pub fn reopen(&mut self) {
        self.status = QueueStatus::Open;
        self.blocked_reason = None;
        self.blocked_at = None;
        self.stall_count = 0;
    }
}

/// Reads and writes `review-queue.json` next to the workflow document.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            path: paths.queue_file(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<ReviewQueue>, StateError> {
        read_json(&self.path)
    }

    /// Stamp `updatedAt` and persist atomically.
    pub fn save(&self, queue: &mut ReviewQueue) -> Result<(), StateError> {
        queue.updated_at = Utc::now();
        write_json_atomic(&self.path, queue)
    }

    pub fn delete(&self) -> Result<bool, StateError> {
        remove_if_exists(&self.path)
    }

    pub async fn load_async(&self) -> Result<Option<ReviewQueue>, StateError> {
        let store = self.clone();
        run_blocking(move || store.load()).await
    }

    /// [`save`](Self::save) on the blocking pool.
    pub async fn save_async(&self, queue: &mut ReviewQueue) -> Result<(), StateError> {
        let store = self.clone();
        let mut snapshot = queue.clone();
        queue.updated_at = run_blocking(move || {
            store.save(&mut snapshot)?;
            Ok::<_, StateError>(snapshot.updated_at)
        })
        .await?;
        Ok(())
    }

    pub async fn delete_async(&self) -> Result<bool, StateError> {
        let store = self.clone();
        run_blocking(move || store.delete()).await
    }
}
