//! Merge scheduler.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log;

use crate::chunk::{Line, Run};
use crate::generation::Generation;
use crate::merger::{MergeStats, TwoWayMerger};
use crate::sort::SortError;

/// Merge rounds statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStats {
    /// Number of executed merge rounds.
    pub rounds: usize,
    /// Number of executed two-way merges.
    pub merges: usize,
    /// Largest number of lines held by merge input queues.
    pub peak_buffered: usize,
}

impl ScheduleStats {
    fn record(&mut self, merge: &MergeStats) {
        self.merges += 1;
        self.peak_buffered = self.peak_buffered.max(merge.peak_buffered);
    }
}

/// Reduces a generation of sorted runs to a single sorted run by successive rounds of pairwise merges.
///
/// Only two generation directories exist at a time: the one being consumed and the one being built.
pub struct MergeScheduler<'a, F> {
    root: &'a Path,
    merger: TwoWayMerger<F>,
    rw_buf_size: Option<usize>,
}

impl<'a, F> MergeScheduler<'a, F>
where
    F: Fn(&Line, &Line) -> Ordering + Copy,
{
    /// Creates a scheduler building generation directories under `root`.
    pub fn new(root: &'a Path, merger: TwoWayMerger<F>, rw_buf_size: Option<usize>) -> Self {
        MergeScheduler {
            root,
            merger,
            rw_buf_size,
        }
    }

    /// Merges all the runs of `generation` into `target`.
    ///
    /// If the sort fails once `target` has been opened for writing, the incomplete `target` is removed.
    pub fn run(&self, generation: Generation, target: &Path) -> Result<(Run, ScheduleStats), SortError> {
        let mut target_touched = false;
        let result = self.reduce(generation, target, &mut target_touched);

        if result.is_err() && target_touched {
            discard_target(target);
        }

        return result;
    }

    fn reduce(
        &self,
        mut generation: Generation,
        target: &Path,
        target_touched: &mut bool,
    ) -> Result<(Run, ScheduleStats), SortError> {
        let mut stats = ScheduleStats::default();

        while generation.len() > 1 {
            generation = self.round(generation, target, target_touched, &mut stats)?;
        }

        let run = match generation.take_runs().pop() {
            Some(run) if run.path() == target => run,
            Some(run) => {
                log::debug!("single run left, moving it to {}", target.display());
                *target_touched = true;
                run.persist(target)?
            }
            None => {
                log::debug!("no runs to merge, creating empty {}", target.display());
                *target_touched = true;
                Run::write(target, Vec::<Line>::new(), self.rw_buf_size)?
            }
        };
        generation.remove()?;

        return Ok((run, stats));
    }

    fn round(
        &self,
        mut current: Generation,
        target: &Path,
        target_touched: &mut bool,
        stats: &mut ScheduleStats,
    ) -> Result<Generation, SortError> {
        let mut runs = current.take_runs();
        log::debug!("merge round {}: {} runs", current.index() + 1, runs.len());

        match runs.len() % 2 {
            0 => {}
            _ => {
                // merge the two first runs in place so the rest can be paired up
                let left = runs.remove(0);
                let right = runs.remove(0);
                let merged = self.merge(left, right, current.side_file_path(), stats)?;
                runs.insert(0, merged);
            }
        }

        let mut next = Generation::create(self.root, current.index() + 1)?;
        let last_round = runs.len() == 2;

        let mut runs = runs.into_iter();
        while let Some(left) = runs.next() {
            let right = match runs.next() {
                Some(right) => right,
                None => {
                    next.push(left.persist(&next.next_run_path())?);
                    continue;
                }
            };

            let path = if last_round {
                *target_touched = true;
                target.to_path_buf()
            } else {
                next.next_run_path()
            };
            let merged = self.merge(left, right, path, stats)?;
            next.push(merged);
        }

        current.remove()?;
        stats.rounds += 1;

        return Ok(next);
    }

    fn merge(&self, left: Run, right: Run, path: PathBuf, stats: &mut ScheduleStats) -> Result<Run, SortError> {
        let (merged, merge_stats) = self.merger.merge(&left, &right, &path)?;
        stats.record(&merge_stats);

        left.remove()?;
        right.remove()?;

        return Ok(merged);
    }
}

/// Removes an incomplete sort result.
pub(crate) fn discard_target(target: &Path) {
    match fs::remove_file(target) {
        Ok(()) => log::warn!("incomplete {} removed", target.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("incomplete {} can't be removed: {}", target.display(), err),
    }
}
