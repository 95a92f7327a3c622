//! Mergeable snapshots of execution statistics.
//!
//! A [`Scorecard`] aggregates the steady-state results of one track, either for the whole run (the
//! *final* scorecard) or for one named load profile (an *interval* scorecard). Per operation type,
//! it keeps an [`OperationSummary`] with counters and a bounded latency sampler.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::Duration;

use yansi::Paint;

use crate::operation::OperationExecutionRecord;
use crate::sampler::ResponseTimeSampler;

/// Latencies are sampled in microseconds.
fn as_sample(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}

fn secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Mean of `count` durations summing to `total`.
pub(crate) fn mean(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(secs(total) / count as f64),
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

/// Statistics for one operation type.
#[derive(Clone, Debug)]
pub struct OperationSummary {
    /// Successful executions.
    pub succeeded: u64,
    /// Failed executions.
    pub failed: u64,
    /// Actions performed by successful executions.
    pub total_actions: u64,
    /// Successful asynchronous executions.
    pub async_invocations: u64,
    /// Successful synchronous executions.
    pub sync_invocations: u64,
    /// Summed response time of successful interactive executions.
    pub total_response_time: Duration,
    /// Fastest successful interactive execution.
    pub min_response_time: Option<Duration>,
    /// Slowest successful interactive execution.
    pub max_response_time: Option<Duration>,

    sampler: ResponseTimeSampler,
}

impl OperationSummary {
    /// Creates an empty summary that feeds latencies into `sampler`.
    pub fn new(sampler: ResponseTimeSampler) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            total_actions: 0,
            async_invocations: 0,
            sync_invocations: 0,
            total_response_time: Duration::ZERO,
            min_response_time: None,
            max_response_time: None,
            sampler,
        }
    }

    /// Accounts for a failed execution.
    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// Accounts for a successful execution.
    ///
    /// Latency is only tracked for interactive executions.
    pub fn record_success(&mut self, record: &OperationExecutionRecord) {
        self.succeeded += 1;
        self.total_actions += record.actions;
        if record.is_async {
            self.async_invocations += 1;
        } else {
            self.sync_invocations += 1;
        }

        if record.interactive {
            self.record_response_time(record.execution_time);
        }
    }

    fn record_response_time(&mut self, response_time: Duration) {
        self.sampler.accept(as_sample(response_time));
        self.total_response_time += response_time;
        self.min_response_time = Some(
            self.min_response_time
                .map_or(response_time, |min| min.min(response_time)),
        );
        self.max_response_time = Some(
            self.max_response_time
                .map_or(response_time, |max| max.max(response_time)),
        );
    }

    /// Mean response time over successful executions.
    pub fn average_response_time(&self) -> Duration {
        mean(self.total_response_time, self.succeeded)
    }

    /// Estimated `pct`th percentile response time.
    pub fn nth_percentile(&mut self, pct: f64) -> Duration {
        Duration::from_micros(self.sampler.nth_percentile(pct))
    }

    /// The latency sampler.
    pub fn sampler(&self) -> &ResponseTimeSampler {
        &self.sampler
    }

    /// Discards all retained latency samples.
    pub fn reset_samples(&mut self) {
        self.sampler.reset();
    }

    /// Adds the counters of `rhs` and offers its retained samples to this sampler.
    pub fn merge(&mut self, rhs: &OperationSummary) {
        self.succeeded += rhs.succeeded;
        self.failed += rhs.failed;
        self.total_actions += rhs.total_actions;
        self.async_invocations += rhs.async_invocations;
        self.sync_invocations += rhs.sync_invocations;
        self.total_response_time += rhs.total_response_time;
        self.min_response_time = match (self.min_response_time, rhs.min_response_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_response_time = match (self.max_response_time, rhs.max_response_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        for sample in rhs.sampler.raw_samples() {
            self.sampler.accept(*sample);
        }
    }
}

/// Aggregated statistics of a track over one measurement window.
#[derive(Clone, Debug)]
pub struct Scorecard {
    /// `final`, or the name of the load profile interval.
    pub name: String,
    /// Track the results belong to.
    pub track: String,

    /// Successful operations.
    pub total_ops_successful: u64,
    /// Failed operations.
    pub total_ops_failed: u64,
    /// Actions performed by successful operations.
    pub total_actions_successful: u64,
    /// Asynchronous operations.
    pub total_ops_async: u64,
    /// Synchronous operations.
    pub total_ops_sync: u64,
    /// Operations initiated within the window, including late ones.
    pub total_ops_initiated: u64,
    /// Operations that finished after their window.
    pub total_ops_late: u64,
    /// Summed response time of successful interactive operations.
    pub total_response_time: Duration,

    /// Length of the window.
    pub interval_duration: Duration,
    /// Users active during the window.
    pub number_of_users: f64,
    /// How many times the window was active.
    pub active_count: f64,

    /// Per-operation summaries, keyed by operation name.
    pub operations: BTreeMap<String, OperationSummary>,
}

impl Scorecard {
    /// Creates an empty scorecard.
    pub fn new(
        name: impl Into<String>,
        interval_duration: Duration,
        track: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            track: track.into(),
            total_ops_successful: 0,
            total_ops_failed: 0,
            total_actions_successful: 0,
            total_ops_async: 0,
            total_ops_sync: 0,
            total_ops_initiated: 0,
            total_ops_late: 0,
            total_response_time: Duration::ZERO,
            interval_duration,
            number_of_users: 0.0,
            active_count: 1.0,
            operations: BTreeMap::new(),
        }
    }

    /// Summary for `name`, created with a sampler from `sampler` on first use.
    pub fn operation_mut(
        &mut self,
        name: &str,
        sampler: impl FnOnce() -> ResponseTimeSampler,
    ) -> &mut OperationSummary {
        self.operations
            .entry(name.to_owned())
            .or_insert_with(|| OperationSummary::new(sampler()))
    }

    /// Accounts for a steady-state execution.
    ///
    /// Failures count towards the sync and async totals as well.
    pub fn record(
        &mut self,
        record: &OperationExecutionRecord,
        sampler: impl FnOnce() -> ResponseTimeSampler,
    ) {
        self.count_invocation(record);
        match record.failure {
            Some(_) => self.record_failure(record, sampler),
            None => self.record_success(record, sampler),
        }
    }

    /// Accounts for a steady-state execution generated during this interval.
    ///
    /// A success that finished after the interval ended is only counted as late. Sync and async
    /// totals only cover successes that finished in time.
    pub fn record_interval(
        &mut self,
        record: &OperationExecutionRecord,
        in_time: bool,
        sampler: impl FnOnce() -> ResponseTimeSampler,
    ) {
        if record.failure.is_some() {
            self.record_failure(record, sampler);
        } else if in_time {
            self.count_invocation(record);
            self.record_success(record, sampler);
        } else {
            self.total_ops_late += 1;
        }
    }

    fn count_invocation(&mut self, record: &OperationExecutionRecord) {
        if record.is_async {
            self.total_ops_async += 1;
        } else {
            self.total_ops_sync += 1;
        }
    }

    fn record_failure(
        &mut self,
        record: &OperationExecutionRecord,
        sampler: impl FnOnce() -> ResponseTimeSampler,
    ) {
        self.total_ops_failed += 1;
        self.operation_mut(&record.name, sampler).record_failure();
    }

    fn record_success(
        &mut self,
        record: &OperationExecutionRecord,
        sampler: impl FnOnce() -> ResponseTimeSampler,
    ) {
        self.total_ops_successful += 1;
        self.total_actions_successful += record.actions;
        if record.interactive {
            self.total_response_time += record.execution_time;
        }
        self.operation_mut(&record.name, sampler)
            .record_success(record);
    }

    /// Successful plus failed operations.
    pub fn total_operations(&self) -> u64 {
        self.total_ops_successful + self.total_ops_failed
    }

    fn per_activation(&self, count: u64) -> f64 {
        let duration = secs(self.interval_duration);
        if count == 0 || duration <= 0.0 {
            return 0.0;
        }
        let active = if self.active_count > 0.0 { self.active_count } else { 1.0 };
        count as f64 / duration / active
    }

    /// Initiated operations per second.
    pub fn offered_load(&self) -> f64 {
        if self.total_operations() == 0 {
            return 0.0;
        }
        self.per_activation(self.total_ops_initiated)
    }

    /// Successful operations per second.
    pub fn effective_load(&self) -> f64 {
        self.per_activation(self.total_ops_successful)
    }

    /// Successful actions per second.
    pub fn effective_request_load(&self) -> f64 {
        self.per_activation(self.total_actions_successful)
    }

    /// Mean response time over successful operations.
    pub fn average_response_time(&self) -> Duration {
        mean(self.total_response_time, self.total_ops_successful)
    }

    /// Clears all counters and summaries.
    pub fn reset(&mut self) {
        let name = std::mem::take(&mut self.name);
        let track = std::mem::take(&mut self.track);
        *self = Self::new(name, Duration::ZERO, track);
        self.active_count = 0.0;
    }

    /// Folds `rhs` into this scorecard.
    ///
    /// Counters are summed. Operations missing here start from a summary that keeps every sample,
    /// so the already thinned samples of `rhs` are not thinned again.
    pub fn merge(&mut self, rhs: &Scorecard) {
        self.active_count = 1.0;

        self.total_ops_successful += rhs.total_ops_successful;
        self.total_ops_failed += rhs.total_ops_failed;
        self.total_actions_successful += rhs.total_actions_successful;
        self.total_ops_async += rhs.total_ops_async;
        self.total_ops_sync += rhs.total_ops_sync;
        self.total_ops_initiated += rhs.total_ops_initiated;
        self.total_ops_late += rhs.total_ops_late;
        self.total_response_time += rhs.total_response_time;
        self.number_of_users += rhs.number_of_users;

        for (name, summary) in &rhs.operations {
            self.operation_mut(name, ResponseTimeSampler::null)
                .merge(summary);
        }
    }

    /// Prints the scorecard and its operation table.
    ///
    /// Retained latency samples are discarded afterwards.
    pub fn print_statistics(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let total = self.total_operations();

        writeln!(
            out,
            "{} {} (track: {})",
            "## Interval".bold(),
            self.name.bold().blue(),
            self.track
        )?;
        writeln!(out, "  Active users                       : {:.4}", self.number_of_users)?;
        writeln!(out, "  Activation count                   : {:.4}", self.active_count)?;
        writeln!(out, "  Offered load (ops/sec)             : {:.4}", self.offered_load())?;
        writeln!(out, "  Effective load (ops/sec)           : {:.4}", self.effective_load())?;
        writeln!(
            out,
            "  Effective load (requests/sec)      : {:.4}",
            self.effective_request_load()
        )?;
        writeln!(out, "  Operations initiated               : {}", self.total_ops_initiated)?;
        writeln!(out, "  Operations successfully completed  : {}", self.total_ops_successful)?;
        writeln!(
            out,
            "  Average operation response time (s): {:.4}",
            secs(self.average_response_time())
        )?;
        writeln!(out, "  Operations late                    : {}", self.total_ops_late)?;
        writeln!(out, "  Operations failed                  : {}", self.total_ops_failed)?;
        writeln!(
            out,
            "  Async Ops                          : {} {:.4}%",
            self.total_ops_async,
            ratio(self.total_ops_async, total)
        )?;
        writeln!(
            out,
            "  Sync Ops                           : {} {:.4}%",
            self.total_ops_sync,
            ratio(self.total_ops_sync, total)
        )?;

        self.print_operation_statistics(out, true)?;
        writeln!(out)
    }

    /// Prints one row per operation type.
    ///
    /// With `purge`, retained latency samples are discarded after printing.
    pub fn print_operation_statistics(
        &mut self,
        out: &mut dyn Write,
        purge: bool,
    ) -> io::Result<()> {
        let total = self.total_operations();

        writeln!(
            out,
            "|{:>20}|{:>10}|{:>10}|{:>10}|{:>12}|{:>12}|{:>12}|{:>10}|{:>10}|{:>10}|",
            "operation",
            "proportion",
            "successes",
            "failures",
            "avg (s)",
            "min (s)",
            "max (s)",
            "90th (s)",
            "99th (s)",
            "samples"
        )?;

        for (name, summary) in &mut self.operations {
            let p90 = summary.nth_percentile(90.0);
            let p99 = summary.nth_percentile(99.0);
            let average = summary.average_response_time();
            let sampler = summary.sampler();

            writeln!(
                out,
                concat!(
                    "|{:>20}|{:>9.4}%|{:>10}|{:>10}|{:>12.4}|{:>12.4}|{:>12.4}|{:>10.4}|{:>10.4}|{:>10}|",
                    " (mu: {:.4}, sd: {:.4}, t: {:.4})"
                ),
                name,
                ratio(summary.succeeded + summary.failed, total),
                summary.succeeded,
                summary.failed,
                secs(average),
                secs(summary.min_response_time.unwrap_or_default()),
                secs(summary.max_response_time.unwrap_or_default()),
                secs(p90),
                secs(p99),
                format!("{}/{}", sampler.samples_collected(), sampler.samples_seen()),
                sampler.sample_mean() / 1e6,
                sampler.sample_standard_deviation() / 1e6,
                sampler.t_value(as_sample(average) as f64),
            )?;

            if purge {
                summary.reset_samples();
            }
        }

        Ok(())
    }
}
