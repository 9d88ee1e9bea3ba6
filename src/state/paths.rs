//! Path resolution for the per-directory state files.

use std::path::{Component, Path, PathBuf};

use crate::errors::StateError;

/// Default directory (under the base dir) that holds all state files.
pub const DEFAULT_STATE_DIR: &str = ".conductor";
pub const STATE_FILE: &str = "workflow-state.json";
pub const QUEUE_FILE: &str = "review-queue.json";
pub const LOCK_FILE: &str = "workflow-state.lock";
pub const ARCHIVE_DIR: &str = "archive";

/// Canonicalize `base_dir` into an absolute path that is safe to store state under.
///
/// Rejects empty paths and embedded NUL bytes. A missing `base_dir` is accepted
/// only when its parent exists; nothing is created here.
pub fn resolve(base_dir: &Path) -> Result<PathBuf, StateError> {
    let raw = base_dir.as_os_str();
    if raw.is_empty() {
        return Err(StateError::Validation("base directory is empty".to_string()));
    }
    if raw.as_encoded_bytes().contains(&0) {
        return Err(StateError::Validation(
            "base directory contains a null byte".to_string(),
        ));
    }

    let absolute = if base_dir.is_absolute() {
        base_dir.to_path_buf()
    } else {
        let cwd = std::env::current_dir().map_err(|e| StateError::io(base_dir, e))?;
        cwd.join(base_dir)
    };

    if absolute.exists() {
        if !absolute.is_dir() {
            return Err(StateError::Validation(format!(
                "{} is not a directory",
                absolute.display()
            )));
        }
        return absolute
            .canonicalize()
            .map_err(|e| StateError::io(&absolute, e));
    }

    let name = match absolute.components().next_back() {
        Some(Component::Normal(name)) => name.to_os_string(),
        _ => {
            return Err(StateError::Validation(format!(
                "{} does not name a directory",
                absolute.display()
            )));
        }
    };
    let parent = absolute.parent().ok_or_else(|| {
        StateError::Validation(format!("{} has no parent directory", absolute.display()))
    })?;
    if !parent.is_dir() {
        return Err(StateError::Validation(format!(
            "neither {} nor its parent directory exists",
            absolute.display()
        )));
    }
    let parent = parent
        .canonicalize()
        .map_err(|e| StateError::io(parent, e))?;
    Ok(parent.join(name))
}

/// Resolved locations of every file the engine manages for one base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    base: PathBuf,
    state_dir: PathBuf,
}

impl StatePaths {
    /// Resolve `base_dir` and place the state directory `state_dir_name` inside it.
    ///
    /// `state_dir_name` must be a single plain directory name, and if it already
    /// exists it must not lead (e.g. through a symlink) outside `base_dir`.
    pub fn resolve(base_dir: &Path, state_dir_name: &str) -> Result<Self, StateError> {
        let base = resolve(base_dir)?;

        let name = Path::new(state_dir_name);
        let mut components = name.components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain || state_dir_name.contains('\0') {
            return Err(StateError::Validation(format!(
                "state directory '{}' must be a single directory name",
                state_dir_name
            )));
        }

        let state_dir = base.join(name);
        let contained = if state_dir.exists() {
            state_dir
                .canonicalize()
                .map_err(|e| StateError::io(&state_dir, e))?
                .starts_with(&base)
        } else {
            state_dir.starts_with(&base)
        };
        if !contained {
            return Err(StateError::Validation(format!(
                "{} escapes {}",
                state_dir.display(),
                base.display()
            )));
        }

        Ok(Self { base, state_dir })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn queue_file(&self) -> PathBuf {
        self.state_dir.join(QUEUE_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.state_dir.join(ARCHIVE_DIR)
    }
}
