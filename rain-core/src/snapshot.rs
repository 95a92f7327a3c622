//! Response-time snapshots streamed to a file while a run is in progress.
//!
//! The scoreboard aggregator pushes one [`ResponseTimeStat`] per successful interactive
//! steady-state operation into a [`SnapshotQueue`]. A [`SnapshotWriter`] thread swaps the queue
//! out at a fixed interval and appends the batch to the track's snapshot file, so the file can be
//! tailed before the final report is printed.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::logfile::LogHandle;
use crate::timer::StopSignal;

/// One observed response time, together with the running totals of the final scorecard.
///
/// Displayed as `[{interval}] {timestamp} {operation} {response} {total} {observations}`, with
/// times in microseconds.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseTimeStat {
    /// Milliseconds between the start of steady state and the end of the operation.
    pub timestamp: i128,
    /// Operation type name.
    pub operation: String,
    /// Name of the load profile interval the operation was generated in, or empty.
    pub interval: String,
    /// Response time of this operation.
    pub response_time: Duration,
    /// Summed response time of all successful operations so far.
    pub total_response_time: Duration,
    /// Successful operations so far.
    pub observations: u64,
}

impl fmt::Display for ResponseTimeStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {} {} {}",
            self.interval,
            self.timestamp,
            self.operation,
            self.response_time.as_micros(),
            self.total_response_time.as_micros(),
            self.observations
        )
    }
}

/// Stats waiting for the snapshot writer.
#[derive(Clone, Debug, Default)]
pub struct SnapshotQueue {
    stats: Arc<Mutex<Vec<ResponseTimeStat>>>,
}

impl SnapshotQueue {
    /// Moves all of `stats` to the back of the queue.
    pub fn append(&self, stats: &mut Vec<ResponseTimeStat>) {
        if !stats.is_empty() {
            self.stats.lock().append(stats);
        }
    }

    /// Number of queued stats.
    pub fn len(&self) -> usize {
        self.stats.lock().len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.stats.lock().is_empty()
    }

    fn swap(&self, todo: &mut Vec<ResponseTimeStat>) {
        std::mem::swap(&mut *self.stats.lock(), todo);
    }
}

/// Background thread appending queued stats to a snapshot file.
#[derive(Debug)]
pub struct SnapshotWriter {
    thread: JoinHandle<u64>,
    stop: StopSignal,
}

impl SnapshotWriter {
    /// Spawns a writer that flushes `queue` to `path` every `interval`.
    pub fn spawn(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        interval: Duration,
        queue: SnapshotQueue,
    ) -> Result<Self> {
        let name = name.into();
        let path = path.into();
        let stop = StopSignal::new();
        let signal = stop.clone();

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let write = || write_snapshots(&path, interval, &queue, &signal);
            catch_unwind(AssertUnwindSafe(write)).unwrap_or_else(|_| {
                tracing::error!(writer = %name, "snapshot writer panicked");
                0
            })
        })?;

        Ok(Self { thread, stop })
    }

    /// Writes everything still queued, stops the thread and returns the number of lines written.
    pub fn finish(self) -> u64 {
        self.stop.stop();
        self.thread.join().unwrap_or_default()
    }
}

fn write_snapshots(
    path: &Path,
    interval: Duration,
    queue: &SnapshotQueue,
    stop: &StopSignal,
) -> u64 {
    let handle = match LogHandle::create(path) {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(path = %path.display(), "could not create snapshot file: {err}");
            None
        }
    };

    let mut todo = Vec::new();
    let mut written = 0;
    loop {
        // Read the flag before swapping so nothing queued before the stop is lost.
        let finished = stop.is_stopped();
        queue.swap(&mut todo);

        if let Some(handle) = handle.as_ref().filter(|_| !todo.is_empty()) {
            let lines: Vec<String> = todo.iter().map(ToString::to_string).collect();
            match handle
                .write_lines(lines.iter().map(String::as_str))
                .and_then(|()| handle.flush())
            {
                Ok(()) => written += lines.len() as u64,
                Err(err) => {
                    tracing::warn!(path = %path.display(), "failed to write snapshots: {err}");
                }
            }
        }
        todo.clear();

        if finished {
            break;
        }
        stop.sleep(interval);
    }

    written
}
