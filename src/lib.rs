//! `ext-line-sort` sorts newline-delimited files that don't fit into memory.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! Memory usage is bounded by a single *row budget* `N`:
//!
//! * **Splitting:**
//!   the source file is read sequentially in chunks of at most `N` lines, every chunk is sorted in memory
//!   and saved as a run file.
//! * **Merging:**
//!   runs are merged pairwise, round after round, until a single run is left. Every two-way merge reads its
//!   inputs through queues of at most `N / 4` lines each, so merge memory doesn't depend on run sizes.
//! * **Scratch data:**
//!   runs live in per-round generation directories under a scratch directory that is removed once the sort
//!   is over.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use env_logger;
//! use log;
//!
//! use ext_line_sort::ExternalSorterBuilder;
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();
//!
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_row_budget(100_000)
//!         .with_tmp_dir(Path::new("./"))
//!         .build()
//!         .unwrap();
//!
//!     let summary = sorter.sort(Path::new("input.txt"), Path::new("output.txt")).unwrap();
//!     println!("{} lines sorted", summary.lines);
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod generation;
pub mod merger;
pub mod scheduler;
pub mod sort;
pub mod storage;

pub use buffer::{LimitedBuffer, LimitedBufferBuilder};
pub use chunk::{Line, Run, RunReader, RunWriter};
pub use generation::Generation;
pub use merger::{MergeStats, TwoWayMerger};
pub use scheduler::{MergeScheduler, ScheduleStats};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortSummary};
pub use storage::CleanupPolicy;
