//! Bounded two-way merger.

use std::cmp::Ordering;
use std::path::Path;

use log;

use crate::buffer::{LimitedBuffer, LimitedBufferBuilder};
use crate::chunk::{Line, Run, RunReader, RunWriter};
use crate::sort::SortError;

/// Merge statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Number of lines written to the destination.
    pub lines: usize,
    /// Largest number of lines simultaneously held by both input queues.
    pub peak_buffered: usize,
}

impl MergeStats {
    fn observe(&mut self, buffered: usize) {
        self.peak_buffered = self.peak_buffered.max(buffered);
    }
}

/// Merges two sorted runs into a single sorted run using a fixed amount of memory.
///
/// Each input is read through a queue of at most `capacity` lines and merged lines are
/// collected in an output buffer of `2 * capacity` lines that is appended to the destination
/// each time it fills up. Memory usage therefore doesn't depend on run sizes.
/// On equal lines the left one is emitted first; both are kept.
pub struct TwoWayMerger<F> {
    capacity: usize,
    rw_buf_size: Option<usize>,
    compare: F,
}

impl<F> TwoWayMerger<F>
where
    F: Fn(&Line, &Line) -> Ordering + Copy,
{
    /// Creates a merger.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of lines buffered per input side
    /// * `rw_buf_size` - Run files read/write buffer size
    /// * `compare` - Function to be used to compare lines
    pub fn new(capacity: usize, rw_buf_size: Option<usize>, compare: F) -> Self {
        TwoWayMerger {
            capacity: capacity.max(1),
            rw_buf_size,
            compare,
        }
    }

    /// Per side queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Merges `left` and `right` into a new run at `target`.
    /// Input runs are left untouched, removing them is up to the caller.
    pub fn merge(&self, left: &Run, right: &Run, target: &Path) -> Result<(Run, MergeStats), SortError> {
        log::debug!(
            "merging {} ({} lines) and {} ({} lines) into {}",
            left.path().display(),
            left.lines(),
            right.path().display(),
            right.lines(),
            target.display()
        );

        let mut left = left.open(self.capacity, self.rw_buf_size)?;
        let mut right = right.open(self.capacity, self.rw_buf_size)?;
        let mut writer = RunWriter::create(target, self.rw_buf_size)?;
        let mut output = LimitedBufferBuilder::new(self.capacity.saturating_mul(2), false).build();
        let mut stats = MergeStats::default();

        loop {
            let take_left = match (left.peek()?, right.peek()?) {
                (Some(l), Some(r)) => (self.compare)(l, r) != Ordering::Greater,
                _ => break,
            };
            stats.observe(left.buffered() + right.buffered());

            let line = if take_left { left.pop() } else { right.pop() };
            if let Some(line) = line {
                output.push(line);
            }

            if output.is_full() {
                Self::flush(&mut output, &mut writer)?;
            }
        }
        Self::flush(&mut output, &mut writer)?;

        // one of the sides is exhausted, the rest of the other one is already in order
        stats.observe(left.buffered() + right.buffered());
        Self::append(left, &mut writer, &mut stats)?;
        Self::append(right, &mut writer, &mut stats)?;

        let run = writer.finish()?;
        stats.lines = run.lines();

        return Ok((run, stats));
    }

    fn flush(output: &mut LimitedBuffer<Line>, writer: &mut RunWriter) -> Result<(), SortError> {
        for line in output.drain() {
            writer.write_line(&line)?;
        }

        return Ok(());
    }

    fn append(mut reader: RunReader, writer: &mut RunWriter, stats: &mut MergeStats) -> Result<(), SortError> {
        loop {
            if reader.peek()?.is_none() {
                break;
            }
            stats.observe(reader.buffered());

            if let Some(line) = reader.pop() {
                writer.write_line(&line)?;
            }
        }

        return Ok(());
    }
}
