use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use serde::Deserialize;
use serde_json::Value;

use super::atomic::{read_json, remove_if_exists, write_json_atomic};
use super::cache::StateCache;
use super::document::{SCHEMA_VERSION, WorkflowState};
use super::merge::merge_patch;
use super::paths::{DEFAULT_STATE_DIR, StatePaths};
use crate::config::ConductorConfig;
use crate::errors::StateError;

/// Default number of compare-and-swap retries for [`StateStore::update`].
pub const DEFAULT_UPDATE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Bypass the cache and read the file.
    pub skip_cache: bool,
}

impl ReadOptions {
    pub fn fresh() -> Self {
        Self { skip_cache: true }
    }
}

/// Run synchronous store work on tokio's blocking thread pool.
///
/// Store calls may wait on the file lock and sleep between retries; async
/// callers go through here instead of calling the store directly.
pub async fn run_blocking<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StateError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| E::from(StateError::TaskFailed(e.to_string())))?
}

#[derive(Deserialize)]
struct RevisionProbe {
    #[serde(default)]
    revision: u64,
}

/// Durable, cached persistence of the workflow document for any base directory.
///
/// Every operation takes the base directory explicitly; one store serves many
/// directories. Writes are atomic renames, and a write that names an expected
/// revision is checked against the on-disk document under an exclusive lock.
#[derive(Debug, Clone)]
pub struct StateStore {
    cache: Arc<StateCache>,
    state_dir_name: String,
    update_retries: u32,
    retry_backoff: Duration,
}

impl StateStore {
    pub fn new(cache: Arc<StateCache>) -> Self {
        Self {
            cache,
            state_dir_name: DEFAULT_STATE_DIR.to_string(),
            update_retries: DEFAULT_UPDATE_RETRIES,
            retry_backoff: Duration::from_millis(10),
        }
    }

    pub fn from_config(config: &ConductorConfig) -> Self {
        Self::new(Arc::new(StateCache::new(config.cache_ttl())))
            .with_state_dir(config.settings.state.state_dir.clone())
            .with_update_retries(config.settings.state.update_retries)
    }

    pub fn with_state_dir(mut self, name: impl Into<String>) -> Self {
        self.state_dir_name = name.into();
        self
    }

    pub fn with_update_retries(mut self, retries: u32) -> Self {
        self.update_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    /// Resolve and validate every path used for `base_dir`.
    pub fn paths(&self, base_dir: &Path) -> Result<StatePaths, StateError> {
        StatePaths::resolve(base_dir, &self.state_dir_name)
    }

    pub fn exists(&self, base_dir: &Path) -> Result<bool, StateError> {
        Ok(self.paths(base_dir)?.state_file().is_file())
    }

    /// Load the document, or `None` when no workflow has been created.
    pub fn read(
        &self,
        base_dir: &Path,
        opts: ReadOptions,
    ) -> Result<Option<WorkflowState>, StateError> {
        let paths = self.paths(base_dir)?;
        self.read_at(&paths, opts)
    }

    fn read_at(
        &self,
        paths: &StatePaths,
        opts: ReadOptions,
    ) -> Result<Option<WorkflowState>, StateError> {
        let file = paths.state_file();
        if !opts.skip_cache
            && let Some(state) = self.cache.get(&file)
        {
            return Ok(Some(state));
        }

        let loaded = match read_json::<WorkflowState>(&file) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.cache.invalidate(&file);
                return Err(e);
            }
        };
        let Some(state) = loaded else {
            self.cache.invalidate(&file);
            return Ok(None);
        };
        if state.version > SCHEMA_VERSION {
            return Err(StateError::Corrupted {
                path: file,
                message: format!(
                    "schema version {} is newer than supported version {}",
                    state.version, SCHEMA_VERSION
                ),
            });
        }

        self.cache.put(&file, &state);
        Ok(Some(state))
    }

    /// Persist `state` unconditionally and return the stamped document.
    pub fn write(&self, state: &WorkflowState, base_dir: &Path) -> Result<WorkflowState, StateError> {
        let paths = self.paths(base_dir)?;
        self.persist(state, &paths, None)
    }

    /// Persist `state` only if the on-disk revision still equals `expected`.
    pub fn write_if_revision(
        &self,
        state: &WorkflowState,
        base_dir: &Path,
        expected: u64,
    ) -> Result<WorkflowState, StateError> {
        let paths = self.paths(base_dir)?;
        self.persist(state, &paths, Some(expected))
    }

    fn persist(
        &self,
        state: &WorkflowState,
        paths: &StatePaths,
        expected: Option<u64>,
    ) -> Result<WorkflowState, StateError> {
        let file = paths.state_file();
        let result = self.persist_locked(state, paths, expected);
        match &result {
            Ok(stamped) => self.cache.put(&file, stamped),
            Err(_) => self.cache.invalidate(&file),
        }
        result
    }

    fn persist_locked(
        &self,
        state: &WorkflowState,
        paths: &StatePaths,
        expected: Option<u64>,
    ) -> Result<WorkflowState, StateError> {
        let _lock = self.lock(paths)?;
        let file = paths.state_file();

        let found = match read_json::<RevisionProbe>(&file) {
            Ok(probe) => probe.map(|p| p.revision).unwrap_or(0),
            Err(StateError::Corrupted { .. }) if expected.is_none() => {
                tracing::warn!(path = %file.display(), "Overwriting unreadable state document");
                0
            }
            Err(e) => return Err(e),
        };
        if let Some(expected) = expected
            && expected != found
        {
            return Err(StateError::ConcurrencyConflict { expected, found });
        }

        let mut stamped = state.clone();
        stamped.revision = found + 1;
        stamped.last_updated_at = Utc::now();
        write_json_atomic(&file, &stamped)?;

        tracing::debug!(
            path = %file.display(),
            revision = stamped.revision,
            "Persisted workflow state"
        );
        Ok(stamped)
    }

    fn lock(&self, paths: &StatePaths) -> Result<File, StateError> {
        let dir = paths.state_dir();
        std::fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))?;
        let lock_path = paths.lock_file();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StateError::io(&lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| StateError::io(&lock_path, e))?;
        Ok(file)
    }

    /// Merge a JSON object patch into the stored document.
    ///
    /// A patch without nested objects is merged shallowly; otherwise the merge
    /// is recursive. The write is a compare-and-swap against the revision that
    /// was read, retried with linear backoff on conflict.
    pub fn update(&self, base_dir: &Path, partial: Value) -> Result<WorkflowState, StateError> {
        let Value::Object(patch) = partial else {
            return Err(StateError::Validation(
                "state patch must be a JSON object".to_string(),
            ));
        };

        let result = self.modify(base_dir, |state| {
            let mut document = serde_json::to_value(&*state).map_err(StateError::Serialize)?;
            merge_patch(&mut document, patch.clone())?;
            let revision = state.revision;
            *state = serde_json::from_value(document).map_err(|e| {
                StateError::Validation(format!("patch produces an invalid document: {}", e))
            })?;
            state.revision = revision;
            Ok::<_, StateError>(())
        })?;

        match result {
            Some((state, ())) => Ok(state),
            None => Err(StateError::Validation(format!(
                "no workflow state exists in {}",
                base_dir.display()
            ))),
        }
    }

    /// Typed read-modify-write with optimistic concurrency.
    ///
    /// `f` runs against a fresh copy of the stored document and may run more
    /// than once if another writer gets in first. Returns `None` when no
    /// document exists; `f` is not called in that case.
    ///
    /// Blocks the calling thread on the lock and between retries; use
    /// [`run_blocking`] from async code.
    pub fn modify<T, E, F>(
        &self,
        base_dir: &Path,
        mut f: F,
    ) -> Result<Option<(WorkflowState, T)>, E>
    where
        F: FnMut(&mut WorkflowState) -> Result<T, E>,
        E: From<StateError>,
    {
        let paths = self.paths(base_dir)?;
        let mut attempt = 0;
        loop {
            let Some(current) = self.read_at(&paths, ReadOptions::fresh())? else {
                return Ok(None);
            };
            let mut next = current.clone();
            let value = f(&mut next)?;

            match self.persist(&next, &paths, Some(current.revision)) {
                Ok(stamped) => return Ok(Some((stamped, value))),
                Err(e) if e.is_retryable() && attempt < self.update_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max = self.update_retries,
                        error = %e,
                        "State write conflicted, retrying"
                    );
                    std::thread::sleep(self.retry_backoff * attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the document. Returns whether a file was removed.
    pub fn delete(&self, base_dir: &Path) -> Result<bool, StateError> {
        let paths = self.paths(base_dir)?;
        if !paths.state_dir().is_dir() {
            return Ok(false);
        }
        let _lock = self.lock(&paths)?;
        let file = paths.state_file();
        self.cache.invalidate(&file);
        remove_if_exists(&file)
    }

    /// Move the document to `archive/<id>-<timestamp>.json`.
    ///
    /// Returns the archive path, or `None` if there was nothing to archive.
    pub fn archive(&self, base_dir: &Path) -> Result<Option<PathBuf>, StateError> {
        let paths = self.paths(base_dir)?;
        if !paths.state_dir().is_dir() {
            return Ok(None);
        }
        let _lock = self.lock(&paths)?;
        let Some(state) = self.read_at(&paths, ReadOptions::fresh())? else {
            return Ok(None);
        };

        let archive_dir = paths.archive_dir();
        std::fs::create_dir_all(&archive_dir).map_err(|e| StateError::io(&archive_dir, e))?;
        let dest = archive_dir.join(format!(
            "{}-{}.json",
            state.workflow.id,
            Utc::now().format("%Y%m%dT%H%M%S%3fZ")
        ));

        let file = paths.state_file();
        self.cache.invalidate(&file);
        std::fs::rename(&file, &dest).map_err(|e| StateError::io(&file, e))?;
        tracing::info!(workflow = %state.workflow.id, path = %dest.display(), "Archived workflow state");
        Ok(Some(dest))
    }
}
