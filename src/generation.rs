//! Run generations.

use std::fs;
use std::path::{Path, PathBuf};

use crate::chunk::Run;
use crate::sort::SortError;
use crate::storage;

/// Set of runs produced by one merge round, stored in their own directory under the scratch root.
///
/// Generation 0 holds the initially sorted chunks, generation `g + 1` is built from generation `g`
/// only. A run may live outside of the generation directory: the final run is the target file.
#[derive(Debug)]
pub struct Generation {
    index: usize,
    dir: PathBuf,
    runs: Vec<Run>,
}

impl Generation {
    /// Creates an empty generation directory `gen-<index>` under `root`.
    /// Stale contents of the directory are removed.
    pub fn create(root: &Path, index: usize) -> Result<Self, SortError> {
        let dir = root.join(format!("gen-{}", index));
        storage::remove_all(&dir)?;
        fs::create_dir_all(&dir).map_err(|err| SortError::io(&dir, err))?;

        return Ok(Generation {
            index,
            dir,
            runs: Vec::new(),
        });
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Number of runs in the generation.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Total number of lines stored in all the runs.
    pub fn total_lines(&self) -> usize {
        self.runs.iter().map(Run::lines).sum()
    }

    /// Path for the next run to be added, unique within the generation.
    pub fn next_run_path(&self) -> PathBuf {
        self.dir.join(format!("{}.txt", self.runs.len() + 1))
    }

    /// Path of the file the two first runs are merged into when the run count is odd.
    pub fn side_file_path(&self) -> PathBuf {
        self.dir.join("merge.txt")
    }

    pub fn push(&mut self, run: Run) {
        self.runs.push(run);
    }

    /// Takes the runs out of the generation leaving it empty.
    pub fn take_runs(&mut self) -> Vec<Run> {
        std::mem::take(&mut self.runs)
    }

    /// Removes the generation directory with everything left in it.
    pub fn remove(self) -> Result<(), SortError> {
        storage::remove_all(&self.dir)
    }
}
