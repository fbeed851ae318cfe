//! External sorter.

use log;
use rayon::slice::ParallelSliceMut;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::buffer::{LimitedBuffer, LimitedBufferBuilder};
use crate::chunk::{read_lines, Line, Run};
use crate::generation::Generation;
use crate::merger::TwoWayMerger;
use crate::scheduler::{discard_target, MergeScheduler};
use crate::storage::{self, CleanupPolicy};

/// Smallest row budget leaving room for at least one line per merge side.
pub const MIN_ROW_BUDGET: usize = 4;

/// Default row budget.
pub const DEFAULT_ROW_BUDGET: usize = 100_000;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Row budget is too small to make progress.
    InvalidRowBudget(usize),
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// I/O operation on a file or directory failed.
    IO { path: PathBuf, source: io::Error },
    /// Scratch file or directory exists but can't be removed.
    Cleanup { path: PathBuf, source: io::Error },
    /// Sorted output doesn't hold the same number of lines as the input.
    Inconsistent { expected: usize, actual: usize },
}

impl SortError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        SortError::IO {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn cleanup(path: &Path, source: io::Error) -> Self {
        SortError::Cleanup {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::InvalidRowBudget(_) => None,
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO { source, .. } => Some(source),
            SortError::Cleanup { source, .. } => Some(source),
            SortError::Inconsistent { .. } => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InvalidRowBudget(budget) => {
                write!(f, "row budget {} is too small, at least {} required", budget, MIN_ROW_BUDGET)
            }
            SortError::TempDir(err) => write!(f, "temporary directory not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO { path, source } => write!(f, "I/O operation on {} failed: {}", path.display(), source),
            SortError::Cleanup { path, source } => write!(f, "{} can't be removed: {}", path.display(), source),
            SortError::Inconsistent { expected, actual } => write!(
                f,
                "sorted output holds {} lines while {} lines were read",
                actual, expected
            ),
        }
    }
}

/// Summary of a finished sort.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SortSummary {
    /// Number of sorted lines.
    pub lines: usize,
    /// Number of initially sorted chunks.
    pub chunks: usize,
    /// Number of merge rounds.
    pub rounds: usize,
    /// Largest number of lines held by both merge input queues at once.
    pub peak_merge_buffered: usize,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder {
    /// Maximum number of lines held in memory.
    row_budget: usize,
    /// Number of threads to be used to sort a chunk.
    threads_number: Option<usize>,
    /// Directory a per-sort scratch directory is created in.
    tmp_dir: Option<Box<Path>>,
    /// Exact scratch directory.
    scratch_root: Option<Box<Path>>,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Scratch data handling on failure.
    cleanup: CleanupPolicy,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        let scratch = match (self.scratch_root, self.tmp_dir) {
            (Some(root), _) => Scratch::Root(root),
            (None, tmp_dir) => Scratch::TmpDir(tmp_dir),
        };

        ExternalSorter::new(
            self.row_budget,
            self.threads_number,
            scratch,
            self.rw_buf_size,
            self.cleanup,
        )
    }

    /// Sets maximum number of lines held in memory. It bounds chunk size and merge buffers.
    pub fn with_row_budget(mut self, row_budget: usize) -> ExternalSorterBuilder {
        self.row_budget = row_budget;
        return self;
    }

    /// Sets number of threads to be used to sort a chunk in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory a unique scratch directory is created in for every sort.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets exact scratch directory. Its contents are removed before every sort.
    /// Takes precedence over [`ExternalSorterBuilder::with_tmp_dir`].
    pub fn with_scratch_root(mut self, path: &Path) -> ExternalSorterBuilder {
        self.scratch_root = Some(path.into());
        return self;
    }

    /// Sets run file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets scratch data handling on failure.
    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> ExternalSorterBuilder {
        self.cleanup = cleanup;
        return self;
    }
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        ExternalSorterBuilder {
            row_budget: DEFAULT_ROW_BUDGET,
            threads_number: None,
            tmp_dir: None,
            scratch_root: None,
            rw_buf_size: None,
            cleanup: CleanupPolicy::default(),
        }
    }
}

/// Scratch directory location.
#[derive(Debug, Clone)]
enum Scratch {
    /// Unique directory created in the provided one or in the OS temporary directory.
    TmpDir(Option<Box<Path>>),
    /// Exact directory.
    Root(Box<Path>),
}

/// External sorter.
///
/// Splits the source into sorted chunks of at most `row_budget` lines and merges them pairwise,
/// keeping at most `row_budget / 4` lines per merge input in memory.
pub struct ExternalSorter {
    /// Maximum number of lines held in memory.
    row_budget: usize,
    /// Chunk sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Scratch directory location.
    scratch: Scratch,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Scratch data handling on failure.
    cleanup: CleanupPolicy,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `row_budget` - Maximum number of lines held in memory, at least [`MIN_ROW_BUDGET`].
    /// * `threads_number` - Number of threads to be used to sort a chunk. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `scratch` - Scratch directory location.
    /// * `rw_buf_size` - Run files read/write buffer size.
    /// * `cleanup` - Scratch data handling on failure.
    fn new(
        row_budget: usize,
        threads_number: Option<usize>,
        scratch: Scratch,
        rw_buf_size: Option<usize>,
        cleanup: CleanupPolicy,
    ) -> Result<Self, SortError> {
        if row_budget < MIN_ROW_BUDGET {
            return Err(SortError::InvalidRowBudget(row_budget));
        }

        return Ok(ExternalSorter {
            row_budget,
            thread_pool: Self::init_thread_pool(threads_number)?,
            scratch,
            rw_buf_size,
            cleanup,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_scratch_root(&self) -> Result<PathBuf, SortError> {
        let root = match &self.scratch {
            Scratch::Root(root) => {
                storage::prepare(root)?;
                root.to_path_buf()
            }
            Scratch::TmpDir(tmp_dir) => {
                let mut builder = tempfile::Builder::new();
                builder.prefix("ext-line-sort-");

                let tmp_dir = if let Some(tmp_dir) = tmp_dir {
                    builder.tempdir_in(tmp_dir)
                } else {
                    builder.tempdir()
                }
                .map_err(|err| SortError::TempDir(err))?;

                // removal is driven by the cleanup policy, not by the guard
                tmp_dir.keep()
            }
        };

        log::info!("using {} as a scratch directory", root.display());

        return Ok(root);
    }

    /// Maximum number of lines held in memory.
    pub fn row_budget(&self) -> usize {
        self.row_budget
    }

    /// Sorts lines of the `source` file in byte order and writes them to `target`.
    pub fn sort(&self, source: &Path, target: &Path) -> Result<SortSummary, SortError> {
        self.sort_by(source, target, |a: &Line, b: &Line| a.cmp(b))
    }

    /// Sorts lines of the `source` file using a custom compare function and writes them to `target`.
    ///
    /// On success the scratch directory is removed. On failure a partially written `target` is removed
    /// and the scratch directory is handled according to the [`CleanupPolicy`].
    ///
    /// # Arguments
    /// * `source` - File to be sorted
    /// * `target` - Result file
    /// * `compare` - Function be be used to compare lines
    pub fn sort_by<F>(&self, source: &Path, target: &Path, compare: F) -> Result<SortSummary, SortError>
    where
        F: Fn(&Line, &Line) -> Ordering + Sync + Send + Copy,
    {
        log::info!(
            "sorting {} into {} (row budget: {})",
            source.display(),
            target.display(),
            self.row_budget
        );
        let root = self.init_scratch_root()?;

        match self.sort_in(&root, source, target, compare) {
            Ok(summary) => {
                storage::remove_all(&root)?;
                log::info!(
                    "sorted {} lines ({} chunks, {} merge rounds)",
                    summary.lines,
                    summary.chunks,
                    summary.rounds
                );

                Ok(summary)
            }
            Err(err) => {
                match self.cleanup {
                    CleanupPolicy::Always => {
                        if let Err(cleanup_err) = storage::remove_all(&root) {
                            log::warn!("scratch directory cleanup failed: {}", cleanup_err);
                        }
                    }
                    CleanupPolicy::KeepOnFailure => {
                        log::warn!("scratch data kept in {}", root.display());
                    }
                }

                Err(err)
            }
        }
    }

    fn sort_in<F>(&self, root: &Path, source: &Path, target: &Path, compare: F) -> Result<SortSummary, SortError>
    where
        F: Fn(&Line, &Line) -> Ordering + Sync + Send + Copy,
    {
        let generation = self.split(root, source, compare)?;
        let lines = generation.total_lines();
        let chunks = generation.len();

        let merger = TwoWayMerger::new(self.row_budget / 4, self.rw_buf_size, compare);
        let scheduler = MergeScheduler::new(root, merger, self.rw_buf_size);

        let (run, stats) = scheduler.run(generation, target)?;
        if run.lines() != lines {
            discard_target(target);
            return Err(SortError::Inconsistent {
                expected: lines,
                actual: run.lines(),
            });
        }

        return Ok(SortSummary {
            lines,
            chunks,
            rounds: stats.rounds,
            peak_merge_buffered: stats.peak_buffered,
        });
    }

    fn split<F>(&self, root: &Path, source: &Path, compare: F) -> Result<Generation, SortError>
    where
        F: Fn(&Line, &Line) -> Ordering + Sync + Send + Copy,
    {
        let file = fs::File::open(source).map_err(|err| SortError::io(source, err))?;
        let reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        let mut generation = Generation::create(root, 0)?;
        let buffer_builder = LimitedBufferBuilder::new(self.row_budget, false);
        let mut chunk_buf = buffer_builder.build();

        for line in read_lines(reader) {
            chunk_buf.push(line.map_err(|err| SortError::io(source, err))?);

            if chunk_buf.is_full() {
                let run = self.create_chunk(generation.next_run_path(), chunk_buf, compare)?;
                generation.push(run);
                chunk_buf = buffer_builder.build();
            }
        }

        if !chunk_buf.is_empty() {
            let run = self.create_chunk(generation.next_run_path(), chunk_buf, compare)?;
            generation.push(run);
        }

        log::debug!(
            "external sort preparation done ({} lines, {} chunks)",
            generation.total_lines(),
            generation.len()
        );

        return Ok(generation);
    }

    fn create_chunk<F>(&self, path: PathBuf, mut buffer: LimitedBuffer<Line>, compare: F) -> Result<Run, SortError>
    where
        F: Fn(&Line, &Line) -> Ordering + Sync + Send,
    {
        log::debug!("sorting chunk data ({} lines) ...", buffer.len());
        self.thread_pool.install(|| {
            buffer.par_sort_by(compare);
        });

        log::debug!("saving chunk data to {}", path.display());
        return Run::write(&path, buffer, self.rw_buf_size);
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use rand::distributions::Alphanumeric;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, SortError};
    use crate::chunk::Line;
    use crate::storage::CleanupPolicy;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn build_sorter(scratch_root: &Path, row_budget: usize) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_row_budget(row_budget)
            .with_threads_number(2)
            .with_scratch_root(scratch_root)
            .build()
            .unwrap()
    }

    fn write_lines(path: &Path, lines: &[String]) {
        let mut content = lines.join("\n");
        if !lines.is_empty() {
            content.push('\n');
        }
        fs::write(path, content).unwrap();
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path).unwrap().lines().map(String::from).collect()
    }

    fn random_lines(count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let len = rng.gen_range(0..8);
                (&mut rng).sample_iter(&Alphanumeric).take(len).map(char::from).collect()
            })
            .collect()
    }

    fn counts(lines: &[String]) -> HashMap<&String, usize> {
        let mut counts = HashMap::new();
        for line in lines {
            *counts.entry(line).or_insert(0) += 1;
        }
        counts
    }

    #[rstest]
    #[case(0, 4)]
    #[case(1, 4)]
    #[case(4, 4)]
    #[case(7, 4)]
    #[case(100, 4)]
    #[case(1000, 16)]
    #[case(999, 10)]
    fn test_external_sorter(tmp_dir: tempfile::TempDir, #[case] count: usize, #[case] row_budget: usize) {
        let input = random_lines(count);
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        let scratch = tmp_dir.path().join("scratch");
        write_lines(&source, &input);

        let summary = build_sorter(&scratch, row_budget).sort(&source, &target).unwrap();
        let output = read_lines(&target);

        let mut expected = input.clone();
        expected.sort();

        assert_eq!(output, expected);
        assert_eq!(counts(&output), counts(&input));
        assert!(output.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(summary.lines, count);
        assert_eq!(summary.chunks, (count + row_budget - 1) / row_budget);
        assert!(summary.peak_merge_buffered <= 2 * (row_budget / 4));
        assert!(!scratch.exists());
    }

    #[rstest]
    fn test_example_scenario(tmp_dir: tempfile::TempDir) {
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        fs::write(&source, "d\nb\na\nc\nb\n").unwrap();

        // a budget of 2 is rejected, so the smallest accepted one is used
        let summary = build_sorter(&tmp_dir.path().join("scratch"), 4).sort(&source, &target).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "a\nb\nb\nc\nd\n");
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.rounds, 1);
    }

    #[rstest]
    fn test_odd_chunk_count(tmp_dir: tempfile::TempDir) {
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        let input: Vec<String> = ["k", "c", "i", "a", "f", "b", "l", "e", "j", "d", "g"]
            .iter()
            .map(|line| line.to_string())
            .collect();
        write_lines(&source, &input);

        let summary = build_sorter(&tmp_dir.path().join("scratch"), 4).sort(&source, &target).unwrap();

        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.rounds, 1);
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "a\nb\nc\nd\ne\nf\ng\ni\nj\nk\nl\n"
        );
    }

    #[rstest]
    fn test_single_chunk(tmp_dir: tempfile::TempDir) {
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        fs::write(&source, "c\na\nb").unwrap();

        let summary = build_sorter(&tmp_dir.path().join("scratch"), 8).sort(&source, &target).unwrap();

        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.rounds, 0);
        assert_eq!(fs::read_to_string(&target).unwrap(), "a\nb\nc\n");
    }

    #[rstest]
    fn test_sorted_input_is_unchanged(tmp_dir: tempfile::TempDir) {
        let mut input = random_lines(300);
        input.sort();
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        write_lines(&source, &input);

        build_sorter(&tmp_dir.path().join("scratch"), 12).sort(&source, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), fs::read(&source).unwrap());
    }

    #[rstest]
    fn test_duplicates_preserved(tmp_dir: tempfile::TempDir) {
        let mut input: Vec<String> = (0..60).map(|i| (i % 3).to_string()).collect();
        input.shuffle(&mut rand::thread_rng());
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        write_lines(&source, &input);

        build_sorter(&tmp_dir.path().join("scratch"), 5).sort(&source, &target).unwrap();

        let expected: String = ["0", "1", "2"].iter().map(|line| format!("{}\n", line).repeat(20)).collect();
        assert_eq!(fs::read_to_string(&target).unwrap(), expected);
    }

    #[rstest]
    fn test_custom_order(tmp_dir: tempfile::TempDir) {
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        let input: Vec<String> = (0..50).map(|i| format!("{:02}", i)).collect();
        write_lines(&source, &input);

        build_sorter(&tmp_dir.path().join("scratch"), 6)
            .sort_by(&source, &target, |a: &Line, b: &Line| a.cmp(b).reverse())
            .unwrap();

        let expected: Vec<String> = input.into_iter().rev().collect();
        assert_eq!(read_lines(&target), expected);
    }

    #[rstest]
    #[case(b"b\n\xff\xfe\na\n", b"a\nb\n\xff\xfe\n")]
    #[case(b"b\r\na\n\r\n", b"\r\na\nb\r\n")]
    #[case(b"\xc3\xa9\nz\n\x00\n", b"\x00\nz\n\xc3\xa9\n")]
    fn test_byte_lines(tmp_dir: tempfile::TempDir, #[case] input: &[u8], #[case] expected: &[u8]) {
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        fs::write(&source, input).unwrap();

        build_sorter(&tmp_dir.path().join("scratch"), 4).sort(&source, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), expected);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    fn test_invalid_row_budget(#[case] row_budget: usize) {
        let result = ExternalSorterBuilder::new().with_row_budget(row_budget).build();
        assert!(matches!(result, Err(SortError::InvalidRowBudget(budget)) if budget == row_budget));
    }

    #[rstest]
    #[case(CleanupPolicy::Always, false)]
    #[case(CleanupPolicy::KeepOnFailure, true)]
    fn test_missing_source(tmp_dir: tempfile::TempDir, #[case] cleanup: CleanupPolicy, #[case] kept: bool) {
        let scratch = tmp_dir.path().join("scratch");
        let target = tmp_dir.path().join("target.txt");
        let sorter = ExternalSorterBuilder::new()
            .with_row_budget(4)
            .with_scratch_root(&scratch)
            .with_cleanup(cleanup)
            .build()
            .unwrap();

        let result = sorter.sort(&tmp_dir.path().join("missing.txt"), &target);

        assert!(matches!(result, Err(SortError::IO { .. })));
        assert_eq!(scratch.exists(), kept);
        assert!(!target.exists());
    }

    #[rstest]
    fn test_stale_scratch_is_removed(tmp_dir: tempfile::TempDir) {
        let scratch = tmp_dir.path().join("scratch");
        fs::create_dir_all(scratch.join("gen-1")).unwrap();
        fs::write(scratch.join("gen-1").join("1.txt"), "zzz\n").unwrap();
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        fs::write(&source, "b\na\nd\nc\nf\ne\nh\ng\nj\ni\n").unwrap();

        build_sorter(&scratch, 4).sort(&source, &target).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "a\nb\nc\nd\ne\nf\ng\nh\ni\nj\n");
        assert!(!scratch.exists());
    }

    #[rstest]
    fn test_tmp_dir_is_cleaned(tmp_dir: tempfile::TempDir) {
        let tmp = tmp_dir.path().join("tmp");
        fs::create_dir_all(&tmp).unwrap();
        let source = tmp_dir.path().join("source.txt");
        let target = tmp_dir.path().join("target.txt");
        write_lines(&source, &random_lines(50));

        let sorter = ExternalSorterBuilder::new()
            .with_row_budget(8)
            .with_tmp_dir(&tmp)
            .with_rw_buf_size(128)
            .build()
            .unwrap();
        sorter.sort(&source, &target).unwrap();

        assert_eq!(read_lines(&target).len(), 50);
        assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);
    }
}
