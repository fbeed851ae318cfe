//! Scratch directory management.

use std::fs;
use std::io;
use std::path::Path;

use log;

use crate::sort::SortError;

/// What to do with the scratch directory when sorting fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Remove scratch data on success and on failure.
    Always,
    /// Remove scratch data on success only, keeping it for diagnosis otherwise.
    KeepOnFailure,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        CleanupPolicy::Always
    }
}

/// Creates an empty scratch root at `root`, removing stale contents left by a previous run.
pub fn prepare(root: &Path) -> Result<(), SortError> {
    remove_all(root)?;
    fs::create_dir_all(root).map_err(|err| SortError::io(root, err))?;

    log::debug!("scratch directory {} prepared", root.display());
    return Ok(());
}

/// Recursively removes `root`.
///
/// Entries that disappear while being removed are not an error, entries that exist but can't be
/// removed are reported with [`SortError::Cleanup`].
pub fn remove_all(root: &Path) -> Result<(), SortError> {
    let metadata = match fs::symlink_metadata(root) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(SortError::cleanup(root, err)),
    };

    if !metadata.is_dir() {
        return ignore_missing(root, fs::remove_file(root));
    }

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(SortError::cleanup(root, err)),
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(SortError::cleanup(root, err)),
        };
        remove_all(&entry.path())?;
    }

    ignore_missing(root, fs::remove_dir(root))
}

fn ignore_missing(path: &Path, result: io::Result<()>) -> Result<(), SortError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SortError::cleanup(path, err)),
    }
}
