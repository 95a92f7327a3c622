//! Line-oriented per-thread log files.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// A log file that serializes concurrent writers.
///
/// Trace and error lines of one worker can be written from the worker itself and from pool threads
/// finishing its asynchronous operations. Every line is written under the handle's lock.
#[derive(Debug)]
pub struct LogHandle {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl LogHandle {
    /// Creates or truncates the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a single line.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        writeln!(self.writer.lock(), "{line}")
    }

    /// Appends several lines without interleaving with other writers.
    pub fn write_lines<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> io::Result<()> {
        let mut writer = self.writer.lock();
        for line in lines {
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }

    /// Flushes buffered lines to disk.
    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LogHandle::create(dir.path().join("thread-x.log")).unwrap();

        handle.write_line("first").unwrap();
        handle.write_lines(["second", "third"]).unwrap();
        handle.flush().unwrap();

        let contents = std::fs::read_to_string(handle.path()).unwrap();
        assert_eq!(contents, "first\nsecond\nthird\n");
    }
}
