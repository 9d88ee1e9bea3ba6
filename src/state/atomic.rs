//! Crash-safe file primitives shared by the workflow and queue documents.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::StateError;

/// Serialize `value` as pretty JSON and replace `path` atomically.
///
/// The payload goes to a temp file in the same directory, is fsynced, then
/// renamed over `path`, so readers see either the old or the new document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let payload = serde_json::to_vec_pretty(value).map_err(StateError::Serialize)?;
    write_bytes_atomic(path, &payload)
}

pub fn write_bytes_atomic(path: &Path, payload: &[u8]) -> Result<(), StateError> {
    let parent = path.parent().ok_or_else(|| {
        StateError::Validation(format!("{} has no parent directory", path.display()))
    })?;
    std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StateError::io(parent, e))?;
    temp.write_all(payload).map_err(|e| StateError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StateError::io(temp.path(), e))?;
    temp.persist(path).map_err(|e| StateError::io(path, e.error))?;
    Ok(())
}

/// Read and parse a JSON document, returning `None` if the file is absent.
///
/// Malformed content is reported as [`StateError::Corrupted`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StateError::Corrupted {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Remove `path`, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> Result<bool, StateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StateError::io(path, e)),
    }
}
