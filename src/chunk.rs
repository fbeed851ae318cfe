//! Sorted runs stored on the file system.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use log;

use crate::sort::SortError;

/// A line without its `\n` terminator. Lines are opaque bytes and compare byte-wise,
/// a `\r` before the terminator is kept as part of the line.
pub type Line = Vec<u8>;

/// Reads `\n`-delimited lines from `reader`. The last line may lack the terminator.
pub fn read_lines<R: BufRead>(reader: R) -> io::Split<R> {
    reader.split(b'\n')
}

/// Handle of a sorted run persisted as a newline-delimited file.
///
/// A run is immutable once written. It is consumed by exactly one merge and removed
/// by the owner of the generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    path: PathBuf,
    lines: usize,
}

impl Run {
    /// Writes already sorted `lines` to a new run file at `path`.
    pub fn write<I>(path: &Path, lines: I, buf_size: Option<usize>) -> Result<Self, SortError>
    where
        I: IntoIterator,
        I::Item: Into<Line>,
    {
        let mut writer = RunWriter::create(path, buf_size)?;
        for line in lines.into_iter() {
            let line: Line = line.into();
            writer.write_line(&line)?;
        }

        return writer.finish();
    }

    /// Path of the run file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines stored in the run.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Opens the run for reading through a queue holding at most `capacity` lines.
    pub fn open(&self, capacity: usize, buf_size: Option<usize>) -> Result<RunReader, SortError> {
        RunReader::open(&self.path, capacity, buf_size)
    }

    /// Removes the run file. A file that is already gone is not an error.
    pub fn remove(self) -> Result<(), SortError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SortError::io(&self.path, err)),
        }
    }

    /// Moves the run to `target`. Falls back to copying when the file can't be renamed,
    /// for example when `target` is located on another file system.
    pub fn persist(self, target: &Path) -> Result<Run, SortError> {
        if let Err(err) = fs::rename(&self.path, target) {
            log::debug!(
                "renaming {} to {} failed ({}), copying instead",
                self.path.display(),
                target.display(),
                err
            );
            fs::copy(&self.path, target).map_err(|err| SortError::io(target, err))?;
            fs::remove_file(&self.path).map_err(|err| SortError::io(&self.path, err))?;
        }

        return Ok(Run {
            path: target.to_path_buf(),
            lines: self.lines,
        });
    }
}

/// Buffered run file writer.
pub struct RunWriter {
    path: PathBuf,
    writer: io::BufWriter<fs::File>,
    lines: usize,
}

impl RunWriter {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: &Path, buf_size: Option<usize>) -> Result<Self, SortError> {
        let file = fs::File::create(path).map_err(|err| SortError::io(path, err))?;
        let writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        return Ok(RunWriter {
            path: path.to_path_buf(),
            writer,
            lines: 0,
        });
    }

    /// Appends a line terminating it with `\n`.
    pub fn write_line(&mut self, line: &[u8]) -> Result<(), SortError> {
        self.writer
            .write_all(line)
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|err| SortError::io(&self.path, err))?;
        self.lines += 1;

        return Ok(());
    }

    /// Number of lines written so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Flushes the buffered data and returns the handle of the written run.
    pub fn finish(mut self) -> Result<Run, SortError> {
        self.writer.flush().map_err(|err| SortError::io(&self.path, err))?;

        return Ok(Run {
            path: self.path,
            lines: self.lines,
        });
    }
}

/// Run reader backed by a refillable queue of bounded capacity.
///
/// The queue is refilled from the file only when it has been drained completely, so no more
/// than `capacity` lines of the run are resident at any time.
pub struct RunReader {
    path: PathBuf,
    source: io::Split<io::BufReader<fs::File>>,
    queue: VecDeque<Line>,
    capacity: usize,
    exhausted: bool,
}

impl RunReader {
    pub fn open(path: &Path, capacity: usize, buf_size: Option<usize>) -> Result<Self, SortError> {
        let file = fs::File::open(path).map_err(|err| SortError::io(path, err))?;
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(RunReader {
            path: path.to_path_buf(),
            source: read_lines(reader),
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            exhausted: false,
        });
    }

    fn refill(&mut self) -> Result<(), SortError> {
        while self.queue.len() < self.capacity && !self.exhausted {
            match self.source.next() {
                Some(Ok(line)) => self.queue.push_back(line),
                Some(Err(err)) => return Err(SortError::io(&self.path, err)),
                None => self.exhausted = true,
            }
        }
        log::trace!("refilled {} lines from {}", self.queue.len(), self.path.display());

        return Ok(());
    }

    fn fill(&mut self) -> Result<(), SortError> {
        if self.queue.is_empty() && !self.exhausted {
            self.refill()?;
        }

        return Ok(());
    }

    /// Returns the current head line, refilling the queue if it is drained.
    /// `None` means the run is fully consumed.
    pub fn peek(&mut self) -> Result<Option<&Line>, SortError> {
        self.fill()?;

        return Ok(self.queue.front());
    }

    /// Removes the head line from the queue.
    pub fn pop(&mut self) -> Option<Line> {
        self.queue.pop_front()
    }

    /// Number of lines currently held in memory.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Checks that the file has no more lines to read and the queue is empty.
    pub fn is_done(&self) -> bool {
        self.exhausted && self.queue.is_empty()
    }
}

impl Iterator for RunReader {
    type Item = Result<Line, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.fill() {
            return Some(Err(err));
        }

        return self.pop().map(Ok);
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use std::fs;

    use super::{Line, Run, RunReader};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    #[rstest]
    fn test_run_write_and_read(tmp_dir: tempfile::TempDir) {
        let saved: Vec<String> = (0..100).map(|i| format!("{:03}", i)).collect();

        let run = Run::write(&tmp_dir.path().join("1.txt"), saved.clone(), None).unwrap();
        assert_eq!(run.lines(), 100);

        let restored: Result<Vec<Line>, _> = run.open(7, None).unwrap().collect();
        let saved: Vec<Line> = saved.into_iter().map(String::into_bytes).collect();
        assert_eq!(restored.unwrap(), saved);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(10)]
    fn test_reader_queue_is_bounded(tmp_dir: tempfile::TempDir, #[case] capacity: usize) {
        let saved: Vec<String> = (0..25).map(|i| i.to_string()).collect();
        let run = Run::write(&tmp_dir.path().join("run.txt"), saved, Some(16)).unwrap();

        let mut reader = run.open(capacity, Some(16)).unwrap();
        let mut count = 0;
        while reader.peek().unwrap().is_some() {
            assert!(reader.buffered() <= capacity);
            reader.pop();
            count += 1;
        }

        assert_eq!(count, 25);
        assert!(reader.is_done());
    }

    #[rstest]
    fn test_empty_run(tmp_dir: tempfile::TempDir) {
        let run = Run::write(&tmp_dir.path().join("empty.txt"), Vec::<Line>::new(), None).unwrap();
        let mut reader = run.open(4, None).unwrap();

        assert_eq!(reader.peek().unwrap(), None);
        assert!(reader.is_done());
    }

    #[rstest]
    fn test_reader_missing_file(tmp_dir: tempfile::TempDir) {
        let result = RunReader::open(&tmp_dir.path().join("missing.txt"), 4, None);
        assert!(result.is_err());
    }

    #[rstest]
    fn test_run_remove_is_idempotent(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("run.txt");
        let run = Run::write(&path, vec!["a"], None).unwrap();

        run.clone().remove().unwrap();
        assert!(!path.exists());
        run.remove().unwrap();
    }

    #[rstest]
    fn test_run_persist(tmp_dir: tempfile::TempDir) {
        let run = Run::write(&tmp_dir.path().join("run.txt"), vec!["a", "b"], None).unwrap();
        let target = tmp_dir.path().join("target.txt");

        let persisted = run.persist(&target).unwrap();

        assert_eq!(persisted.path(), target.as_path());
        assert_eq!(persisted.lines(), 2);
        assert!(!tmp_dir.path().join("run.txt").exists());
        assert_eq!(fs::read_to_string(&target).unwrap(), "a\nb\n");
    }

    #[rstest]
    fn test_lines_are_opaque_bytes(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("run.txt");
        fs::write(&path, b"\xff\xfe\nb\r\n\n\nlast").unwrap();

        let restored: Result<Vec<Line>, _> = RunReader::open(&path, 2, None).unwrap().collect();

        let expected: Vec<Line> = vec![
            b"\xff\xfe".to_vec(),
            b"b\r".to_vec(),
            Vec::new(),
            Vec::new(),
            b"last".to_vec(),
        ];
        assert_eq!(restored.unwrap(), expected);
    }

    #[rstest]
    fn test_write_keeps_bytes(tmp_dir: tempfile::TempDir) {
        let lines: Vec<Line> = vec![b"\xff\xfe".to_vec(), b"b\r".to_vec()];
        let run = Run::write(&tmp_dir.path().join("run.txt"), lines, None).unwrap();

        assert_eq!(fs::read(run.path()).unwrap(), b"\xff\xfe\nb\r\n".to_vec());
    }
}
