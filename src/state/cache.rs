//! Short-lived read cache for workflow documents.
//!
//! The cache is an explicit object owned by (or shared between) [`StateStore`]
//! instances, so tests and independent stores never see each other's entries
//! unless they are handed the same `Arc<StateCache>`.
//!
//! [`StateStore`]: super::StateStore

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::document::WorkflowState;

/// Default time-to-live for a cached read.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct CacheEntry {
    state: WorkflowState,
    stored_at: Instant,
}

/// TTL cache keyed by the canonical state file path.
#[derive(Debug)]
pub struct StateCache {
    ttl: Duration,
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl StateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // A panic while holding the lock cannot leave an entry half-written,
    // so a poisoned map is still usable.
    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return an independent copy of the cached document if it is still fresh.
    pub fn get(&self, key: &Path) -> Option<WorkflowState> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.state.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &Path, state: &WorkflowState) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries().insert(
            key.to_path_buf(),
            CacheEntry {
                state: state.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &Path) {
        self.entries().remove(key);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Number of entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
