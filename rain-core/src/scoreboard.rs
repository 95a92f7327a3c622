//! Concurrent collection of execution results.
//!
//! Worker threads hand every finished operation to [`Scoreboard::drop_off`], which classifies the
//! record against the steady-state window, writes the log side channel, and appends the record to
//! a drop-off queue. A single aggregator thread swaps that queue with an empty one under the lock
//! and processes the batch without holding it, so producers only ever contend on a push.
//!
//! All statistics are owned by the aggregator thread. When the scoreboard is stopped, the
//! aggregator drains the remaining records and hands its state back for printing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use sketches_ddsketch::DDSketch;
use yansi::Paint;

use crate::config::{Config, TrackConfig};
use crate::error::Result;
use crate::logfile::LogHandle;
use crate::operation::{OperationExecutionRecord, TraceLabel};
use crate::profile::LoadProfile;
use crate::sampler::ResponseTimeSampler;
use crate::scorecard::{Scorecard, mean};
use crate::snapshot::{ResponseTimeStat, SnapshotQueue, SnapshotWriter};
use crate::timer::StopSignal;

/// How long the aggregator sleeps when there is nothing to process.
const AGGREGATION_INTERVAL: Duration = Duration::from_secs(1);

/// Settings a scoreboard takes from its track and the run.
#[derive(Clone, Debug)]
pub struct ScoreboardSettings {
    /// Name of the track.
    pub track: String,
    /// Host under test, shown in reports.
    pub target_host: String,
    /// Probability of writing a finished operation to the trace log.
    pub log_sampling_probability: f64,
    /// Mean interval of the response-time samplers.
    pub response_time_sampling_interval: f64,
    /// Sample cap of the response-time samplers.
    pub max_response_time_samples: usize,
    /// Open-loop probability, for the Little's Law estimate.
    pub open_loop_probability: f64,
    /// Mean think time, for the Little's Law estimate.
    pub mean_think_time: Duration,
    /// Mean cycle time, for the Little's Law estimate.
    pub mean_cycle_time: Duration,
    /// How long [`Scoreboard::stop`] waits for the aggregator to drain.
    pub worker_exit_timeout: Duration,
    /// File receiving response-time snapshots, if enabled.
    pub metric_snapshot_file: Option<PathBuf>,
    /// How often snapshots are flushed to the file.
    pub metric_snapshot_interval: Duration,
}

impl ScoreboardSettings {
    /// Collects the settings of `track` within `run`.
    pub fn new(track: &TrackConfig, run: &Config) -> Self {
        Self {
            track: track.name.clone(),
            target_host: format!("{}:{}", track.target_host, track.target_port),
            log_sampling_probability: track.log_sampling_probability,
            response_time_sampling_interval: track.response_time_sampling_interval,
            max_response_time_samples: track.max_response_time_samples,
            open_loop_probability: track.open_loop_probability,
            mean_think_time: track.mean_think_time,
            mean_cycle_time: track.mean_cycle_time,
            worker_exit_timeout: run.worker_exit_timeout,
            metric_snapshot_file: track.metric_snapshots.then(|| {
                let dir = run.log_dir.clone().unwrap_or_default();
                dir.join(format!("metrics-snapshots-{}.log", track.name))
            }),
            metric_snapshot_interval: track.metric_snapshot_interval,
        }
    }

    fn sampler(&self) -> ResponseTimeSampler {
        ResponseTimeSampler::poisson(
            self.response_time_sampling_interval,
            self.max_response_time_samples,
        )
    }
}

/// The steady-state measurement window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Window {
    /// First instant of steady state.
    pub start: Instant,
    /// Last instant of steady state.
    pub end: Instant,
}

impl Window {
    /// Classifies an execution by when it started and finished.
    pub fn classify(&self, started: Instant, finished: Instant) -> TraceLabel {
        if finished >= self.start && finished <= self.end {
            TraceLabel::SteadyState
        } else if started >= self.start && started <= self.end {
            TraceLabel::Late
        } else if started < self.start {
            TraceLabel::RampUp
        } else if started > self.end {
            TraceLabel::RampDown
        } else {
            TraceLabel::Unclassified
        }
    }

    /// Returns `true` if `time` lies within the window.
    pub fn contains(&self, time: Instant) -> bool {
        time >= self.start && time <= self.end
    }

    /// Length of the window.
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    fn offset_millis(&self, time: Instant) -> i128 {
        if time >= self.start {
            (time - self.start).as_millis() as i128
        } else {
            -((self.start - time).as_millis() as i128)
        }
    }
}

/// Statistics of pacing waits for one operation type.
#[derive(Clone, Debug)]
pub struct WaitTimeSummary {
    /// Number of recorded waits.
    pub count: u64,
    /// Summed wait time.
    pub total: Duration,
    /// Shortest wait.
    pub min: Option<Duration>,
    /// Longest wait.
    pub max: Option<Duration>,
    sampler: ResponseTimeSampler,
}

impl WaitTimeSummary {
    fn new(sampler: ResponseTimeSampler) -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: None,
            max: None,
            sampler,
        }
    }

    fn record(&mut self, wait: Duration) {
        self.count += 1;
        self.total += wait;
        self.min = Some(self.min.map_or(wait, |min| min.min(wait)));
        self.max = Some(self.max.map_or(wait, |max| max.max(wait)));
        self.sampler
            .accept(wait.as_micros().min(u64::MAX as u128) as u64);
    }

    /// Mean wait.
    pub fn average(&self) -> Duration {
        mean(self.total, self.count)
    }
}

/// Contention on the drop-off queue.
#[derive(Clone, Default)]
pub struct DropOffStats {
    /// Number of records dropped off.
    pub total: u64,
    /// Summed time spent waiting for the queue lock.
    pub total_wait: Duration,
    /// Longest wait for the queue lock.
    pub max_wait: Duration,
    /// Distribution of lock waits in seconds.
    pub waits: DDSketch,
}

impl DropOffStats {
    fn record(&mut self, wait: Duration) {
        self.total += 1;
        self.total_wait += wait;
        self.max_wait = self.max_wait.max(wait);
        self.waits.add(wait.as_secs_f64());
    }

    fn quantile(&self, q: f64) -> Duration {
        match self.waits.quantile(q) {
            Ok(Some(secs)) if secs > 0.0 => Duration::from_secs_f64(secs),
            _ => Duration::ZERO,
        }
    }
}

impl fmt::Debug for DropOffStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DropOffStats")
            .field("total", &self.total)
            .field("total_wait", &self.total_wait)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

/// Everything the aggregator thread owns.
#[derive(Debug)]
struct Aggregate {
    window: Option<Window>,
    final_card: Scorecard,
    intervals: BTreeMap<String, Scorecard>,
    interval_profiles: BTreeMap<String, Arc<LoadProfile>>,
    errors: BTreeMap<String, u64>,
    /// Snapshot stats not yet handed to the writer, when snapshots are enabled.
    snapshots: Option<Vec<ResponseTimeStat>>,
}

impl Aggregate {
    fn new(settings: &ScoreboardSettings, window: Option<Window>) -> Self {
        let duration = window.map(|w| w.duration()).unwrap_or_default();
        Self {
            window,
            final_card: Scorecard::new("final", duration, &settings.track),
            intervals: BTreeMap::new(),
            interval_profiles: BTreeMap::new(),
            errors: BTreeMap::new(),
            snapshots: settings.metric_snapshot_file.as_ref().map(|_| Vec::new()),
        }
    }

    fn process(&mut self, record: &OperationExecutionRecord, settings: &ScoreboardSettings) {
        match record.label {
            TraceLabel::SteadyState => {
                self.final_card.total_ops_initiated += 1;
                self.process_steady_state(record, settings);
            }
            TraceLabel::Late => {
                self.final_card.total_ops_initiated += 1;
                self.final_card.total_ops_late += 1;
            }
            _ => {}
        }
    }

    fn process_steady_state(
        &mut self,
        record: &OperationExecutionRecord,
        settings: &ScoreboardSettings,
    ) {
        let profile = &record.profile;
        if let Some(name) = profile.interval_name() {
            let card = self.intervals.entry(name.to_owned()).or_insert_with(|| {
                let mut card = Scorecard::new(name, profile.duration, &settings.track);
                card.number_of_users = profile.users as f64;
                card
            });
            card.active_count = card.active_count.max(profile.activation_count() as f64);
            card.total_ops_initiated += 1;

            let in_time = match profile.interval_end() {
                Some(end) => record.time_finished <= end,
                None => true,
            };
            card.record_interval(record, in_time, || settings.sampler());

            // Keep the latest activation for the end-of-window adjustment.
            let latest = self
                .interval_profiles
                .get(name)
                .is_none_or(|seen| seen.activation_count() < profile.activation_count());
            if latest && profile.activated_at().is_some() {
                self.interval_profiles
                    .insert(name.to_owned(), Arc::clone(profile));
            }
        }

        self.final_card.record(record, || settings.sampler());
        if let Some(failure) = &record.failure {
            *self.errors.entry(failure.summary_key()).or_default() += 1;
        }

        if let Some(snapshots) = &mut self.snapshots {
            if record.succeeded() && record.interactive {
                snapshots.push(ResponseTimeStat {
                    timestamp: self
                        .window
                        .map(|w| w.offset_millis(record.time_finished))
                        .unwrap_or_default(),
                    operation: record.name.clone(),
                    interval: profile.interval_name().unwrap_or_default().to_owned(),
                    response_time: record.execution_time,
                    total_response_time: self.final_card.total_response_time,
                    observations: self.final_card.total_ops_successful,
                });
            }
        }
    }
}

struct Shared {
    settings: ScoreboardSettings,
    window: RwLock<Option<Window>>,
    queue: Mutex<Vec<OperationExecutionRecord>>,
    wait_times: Mutex<BTreeMap<String, WaitTimeSummary>>,
    drop_offs: Mutex<DropOffStats>,
    logs: Mutex<HashMap<String, Arc<LogHandle>>>,
    error_logs: Mutex<HashMap<String, Arc<LogHandle>>>,
    snapshots: SnapshotQueue,
    stop: StopSignal,
    forced: AtomicBool,
}

impl Shared {
    fn run(&self) -> Aggregate {
        let window = *self.window.read();
        let mut aggregate = Aggregate::new(&self.settings, window);
        let mut processing = Vec::new();

        loop {
            std::mem::swap(&mut *self.queue.lock(), &mut processing);

            if processing.is_empty() {
                if self.stop.is_stopped() {
                    break;
                }
                self.stop.sleep(AGGREGATION_INTERVAL);
                continue;
            }

            for record in processing.drain(..) {
                if self.forced.load(Ordering::Relaxed) {
                    break;
                }
                aggregate.process(&record, &self.settings);
            }
            if let Some(stats) = &mut aggregate.snapshots {
                self.snapshots.append(stats);
            }

            if self.forced.load(Ordering::Relaxed) {
                tracing::warn!(track = %self.settings.track, "scoreboard aggregation interrupted");
                break;
            }
        }

        aggregate
    }

    fn write_logs(
        &self,
        record: &OperationExecutionRecord,
        trace: &[String],
        window: Option<Window>,
    ) {
        let sample = self.settings.log_sampling_probability;
        if sample >= 1.0 || rand::rng().random::<f64>() <= sample {
            let handle = self.logs.lock().get(&record.generated_by).cloned();
            if let Some(handle) = handle {
                let started = window
                    .map(|w| w.offset_millis(record.time_started))
                    .unwrap_or_default();
                let prefix = format!("{started} {} {}", record.name, record.index);
                let result = if trace.is_empty() {
                    handle.write_line(&prefix)
                } else {
                    let lines: Vec<String> =
                        trace.iter().map(|line| format!("{prefix} {line}")).collect();
                    handle.write_lines(lines.iter().map(String::as_str))
                };
                if let Err(err) = result {
                    tracing::warn!(
                        path = %handle.path().display(),
                        "failed to write trace log: {err}"
                    );
                }
            }
        }

        if let Some(failure) = &record.failure {
            let handle = self.error_logs.lock().get(&record.generated_by).cloned();
            if let Some(handle) = handle {
                let line = format!("[{}] {}", record.generated_by, failure.report);
                if let Err(err) = handle.write_line(&line) {
                    tracing::warn!(
                        path = %handle.path().display(),
                        "failed to write error log: {err}"
                    );
                }
            }
        }
    }
}

struct Aggregator {
    thread: JoinHandle<()>,
    results: Receiver<Aggregate>,
}

/// Collects and aggregates the execution results of one track.
pub struct Scoreboard {
    shared: Arc<Shared>,
    aggregator: Mutex<Option<Aggregator>>,
    snapshot_writer: Mutex<Option<SnapshotWriter>>,
    results: Mutex<Option<Aggregate>>,
}

impl Scoreboard {
    /// Creates a scoreboard. Call [`initialize`](Self::initialize) and [`start`](Self::start)
    /// before dropping off results.
    pub fn new(settings: ScoreboardSettings) -> Self {
        let shared = Shared {
            settings,
            window: RwLock::new(None),
            queue: Mutex::new(Vec::new()),
            wait_times: Mutex::new(BTreeMap::new()),
            drop_offs: Mutex::new(DropOffStats::default()),
            logs: Mutex::new(HashMap::new()),
            error_logs: Mutex::new(HashMap::new()),
            snapshots: SnapshotQueue::default(),
            stop: StopSignal::new(),
            forced: AtomicBool::new(false),
        };

        Self {
            shared: Arc::new(shared),
            aggregator: Mutex::new(None),
            snapshot_writer: Mutex::new(None),
            results: Mutex::new(None),
        }
    }

    /// Name of the track.
    pub fn track(&self) -> &str {
        &self.shared.settings.track
    }

    /// Sets the steady-state window.
    pub fn initialize(&self, start: Instant, end: Instant) {
        *self.shared.window.write() = Some(Window { start, end });
    }

    /// The steady-state window, once initialized.
    pub fn window(&self) -> Option<Window> {
        *self.shared.window.read()
    }

    /// Spawns the aggregator thread, and the snapshot writer if snapshots are enabled.
    pub fn start(&self) -> Result<()> {
        let mut aggregator = self.aggregator.lock();
        if aggregator.is_some() {
            return Ok(());
        }

        let (sender, results) = mpsc::sync_channel(1);
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("{}.scoreboard", self.track()))
            .spawn(move || match catch_unwind(AssertUnwindSafe(|| shared.run())) {
                Ok(aggregate) => {
                    sender.send(aggregate).ok();
                }
                Err(_) => {
                    let track = &shared.settings.track;
                    tracing::error!(%track, "scoreboard aggregator panicked");
                }
            })?;

        *aggregator = Some(Aggregator { thread, results });

        let settings = &self.shared.settings;
        if let Some(path) = &settings.metric_snapshot_file {
            let writer = SnapshotWriter::spawn(
                format!("{}.snapshots", self.track()),
                path,
                settings.metric_snapshot_interval,
                self.shared.snapshots.clone(),
            )?;
            *self.snapshot_writer.lock() = Some(writer);
        }
        Ok(())
    }

    /// Returns `true` once the scoreboard has been stopped.
    pub fn is_done(&self) -> bool {
        self.shared.stop.is_stopped()
    }

    /// Accepts a finished operation.
    ///
    /// The record is labelled with its window, logged, and queued for aggregation. Records
    /// arriving after [`stop`](Self::stop) are discarded.
    pub fn drop_off(&self, mut record: OperationExecutionRecord) {
        if self.is_done() {
            return;
        }

        let window = self.window();
        if let Some(window) = window {
            record.label = window.classify(record.time_started, record.time_finished);
        }

        let trace = std::mem::take(&mut record.trace);
        self.shared.write_logs(&record, &trace, window);

        let requested = Instant::now();
        let mut queue = self.shared.queue.lock();
        let waited = requested.elapsed();
        queue.push(record);
        drop(queue);

        self.shared.drop_offs.lock().record(waited);
    }

    /// Records how long a worker paced itself before or after `operation`.
    ///
    /// Only waits ending within the steady-state window are counted.
    pub fn drop_off_wait_time(&self, time: Instant, operation: &str, wait: Duration) {
        if self.is_done() {
            return;
        }
        match self.window() {
            Some(window) if window.contains(time) => {}
            _ => return,
        }

        self.shared
            .wait_times
            .lock()
            .entry(operation.to_owned())
            .or_insert_with(|| WaitTimeSummary::new(self.shared.settings.sampler()))
            .record(wait);
    }

    /// Registers the trace log of `owner`, replacing any previous one.
    pub fn register_log_handle(&self, owner: impl Into<String>, handle: Arc<LogHandle>) {
        self.shared.logs.lock().insert(owner.into(), handle);
    }

    /// Removes and flushes the trace log of `owner`.
    pub fn deregister_log_handle(&self, owner: &str) -> Option<Arc<LogHandle>> {
        let handle = self.shared.logs.lock().remove(owner)?;
        flush(&handle);
        Some(handle)
    }

    /// Registers the error log of `owner`, replacing any previous one.
    pub fn register_error_log_handle(&self, owner: impl Into<String>, handle: Arc<LogHandle>) {
        self.shared.error_logs.lock().insert(owner.into(), handle);
    }

    /// Removes and flushes the error log of `owner`.
    pub fn deregister_error_log_handle(&self, owner: &str) -> Option<Arc<LogHandle>> {
        let handle = self.shared.error_logs.lock().remove(owner)?;
        flush(&handle);
        Some(handle)
    }

    /// Stops accepting results and waits for the aggregator to drain.
    ///
    /// If draining takes longer than the configured timeout, aggregation is cut short.
    pub fn stop(&self) {
        self.shared.stop.stop();

        let Some(aggregator) = self.aggregator.lock().take() else {
            return;
        };

        let timeout = self.shared.settings.worker_exit_timeout;
        let aggregate = match aggregator.results.recv_timeout(timeout) {
            Ok(aggregate) => Some(aggregate),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    track = %self.track(),
                    ?timeout,
                    "scoreboard did not drain in time, interrupting"
                );
                self.shared.forced.store(true, Ordering::Relaxed);
                aggregator.results.recv().ok()
            }
            Err(RecvTimeoutError::Disconnected) => None,
        };

        if aggregator.thread.join().is_err() {
            tracing::error!(track = %self.track(), "scoreboard thread failed to join");
        }
        *self.results.lock() = aggregate;

        if let Some(writer) = self.snapshot_writer.lock().take() {
            let written = writer.finish();
            tracing::debug!(track = %self.track(), written, "snapshot writer finished");
        }
    }

    /// The run's final scorecard, available after [`stop`](Self::stop).
    pub fn final_scorecard(&self) -> Option<Scorecard> {
        self.results.lock().as_ref().map(|a| a.final_card.clone())
    }

    /// The per-interval scorecards, available after [`stop`](Self::stop).
    pub fn interval_scorecards(&self) -> Vec<Scorecard> {
        self.results
            .lock()
            .as_ref()
            .map(|a| a.intervals.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Steady-state failure counts keyed by `"{message} ({kind})"`.
    pub fn error_summary(&self) -> BTreeMap<String, u64> {
        self.results
            .lock()
            .as_ref()
            .map(|a| a.errors.clone())
            .unwrap_or_default()
    }

    /// Pacing wait statistics per operation.
    pub fn wait_time_summaries(&self) -> BTreeMap<String, WaitTimeSummary> {
        self.shared.wait_times.lock().clone()
    }

    /// Drop-off queue contention statistics.
    pub fn drop_off_stats(&self) -> DropOffStats {
        self.shared.drop_offs.lock().clone()
    }

    /// Prints interval and final statistics.
    ///
    /// Printing discards the retained latency samples.
    pub fn print_statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut results = self.results.lock();
        let Some(aggregate) = results.as_mut() else {
            return writeln!(out, "{} no results for track {}", "##".bold(), self.track());
        };
        let settings = &self.shared.settings;
        let window = self.window();

        let mut total_users = 0.0;
        let mut total_activations = 0.0;
        writeln!(out, "{} {}", "## Interval results, track".bold(), self.track().bold().blue())?;
        for (name, card) in &mut aggregate.intervals {
            if let (Some(profile), Some(window)) = (aggregate.interval_profiles.get(name), window) {
                adjust_activation_count(card, profile, window);
            }
            total_users += card.number_of_users * card.active_count;
            total_activations += card.active_count;
            card.print_statistics(out)?;
        }

        let card = &mut aggregate.final_card;
        let average_users = if total_activations > 0.0 {
            total_users / total_activations
        } else {
            0.0
        };
        card.number_of_users = average_users;

        let drop_offs = self.drop_off_stats();
        let total = card.total_operations();
        let average_response = card.average_response_time().as_secs_f64();
        let p = settings.open_loop_probability;
        let think_delta = (1.0 - p) * settings.mean_think_time.as_secs_f64()
            + p * settings.mean_cycle_time.as_secs_f64();

        writeln!(out, "{} {}", "## Final results, track".bold(), self.track().bold().blue())?;
        writeln!(out, "  Target host                        : {}", settings.target_host)?;
        writeln!(out, "  Total drop offs                    : {}", drop_offs.total)?;
        writeln!(
            out,
            "  Average drop off Q time (ms)       : {:.4}",
            mean(drop_offs.total_wait, drop_offs.total).as_secs_f64() * 1e3
        )?;
        writeln!(
            out,
            "  Max drop off Q time (ms)           : {:.4}",
            drop_offs.max_wait.as_secs_f64() * 1e3
        )?;
        writeln!(
            out,
            "  Drop off Q time p50/p99 (ms)       : {:.4}/{:.4}",
            drop_offs.quantile(0.5).as_secs_f64() * 1e3,
            drop_offs.quantile(0.99).as_secs_f64() * 1e3
        )?;
        writeln!(out, "  Total interval activations         : {total_activations:.4}")?;
        writeln!(out, "  Average number of users            : {average_users:.4}")?;
        writeln!(out, "  Offered load (ops/sec)             : {:.4}", card.offered_load())?;
        writeln!(out, "  Effective load (ops/sec)           : {:.4}", card.effective_load())?;
        if average_response > 0.0 {
            let estimate = average_users / (average_response + think_delta);
            let variation = ((card.effective_load() - estimate) / estimate).abs() * 100.0;
            writeln!(out, "  Little's Law Estimate (ops/sec)    : {estimate:.4}")?;
            writeln!(out, "  Variation from Little's Law (%)    : {variation:.4}")?;
        } else {
            writeln!(out, "  Little's Law Estimate (ops/sec)    : 0")?;
        }
        writeln!(
            out,
            "  Effective load (requests/sec)      : {:.4}",
            card.effective_request_load()
        )?;
        writeln!(out, "  Operations initiated               : {}", card.total_ops_initiated)?;
        writeln!(out, "  Operations successfully completed  : {}", card.total_ops_successful)?;
        writeln!(out, "  Average operation response time (s): {average_response:.4}")?;
        writeln!(out, "  Operations late                    : {}", card.total_ops_late)?;
        writeln!(out, "  Operations failed                  : {}", card.total_ops_failed)?;
        writeln!(
            out,
            "  Async Ops                          : {} {:.4}%",
            card.total_ops_async,
            percent(card.total_ops_async, total)
        )?;
        writeln!(
            out,
            "  Sync Ops                           : {} {:.4}%",
            card.total_ops_sync,
            percent(card.total_ops_sync, total)
        )?;
        writeln!(
            out,
            "  Mean response time sample interval : {} (using Poisson sampling)",
            settings.response_time_sampling_interval
        )?;
        card.print_operation_statistics(out, true)?;
        writeln!(out)?;

        writeln!(out, "{} {} type(s) of error", "## Error summary".bold(), aggregate.errors.len())?;
        for (key, count) in &aggregate.errors {
            writeln!(out, "  {key}: {count}")?;
        }
        writeln!(
            out,
            "  Total failures                     : {}",
            aggregate.errors.values().sum::<u64>()
        )?;
        writeln!(out)?;

        self.print_wait_time_statistics(out)
    }

    fn print_wait_time_statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut wait_times = self.shared.wait_times.lock();

        writeln!(out, "{}", "## Think/cycle times".bold())?;
        writeln!(
            out,
            "|{:>20}|{:>10}|{:>12}|{:>12}|{:>12}|{:>10}|{:>10}|{:>10}|",
            "operation", "count", "avg (s)", "min (s)", "max (s)", "90th (s)", "99th (s)", "samples"
        )?;
        for (name, summary) in wait_times.iter_mut() {
            let p90 = summary.sampler.nth_percentile(90.0) as f64 / 1e6;
            let p99 = summary.sampler.nth_percentile(99.0) as f64 / 1e6;
            writeln!(
                out,
                "|{:>20}|{:>10}|{:>12.4}|{:>12.4}|{:>12.4}|{:>10.4}|{:>10.4}|{:>10}|",
                name,
                summary.count,
                summary.average().as_secs_f64(),
                summary.min.unwrap_or_default().as_secs_f64(),
                summary.max.unwrap_or_default().as_secs_f64(),
                p90,
                p99,
                format!(
                    "{}/{}",
                    summary.sampler.samples_collected(),
                    summary.sampler.samples_seen()
                ),
            )?;
            summary.sampler.reset();
        }
        Ok(())
    }
}

/// Reduces the activation count of an interval cut short by the end of steady state.
fn adjust_activation_count(card: &mut Scorecard, profile: &LoadProfile, window: Window) {
    let (Some(activated), Some(transition_end)) = (profile.activated_at(), profile.transition_end())
    else {
        return;
    };

    if activated > window.end {
        card.active_count -= 1.0;
    } else if transition_end > window.end && !profile.duration.is_zero() {
        let spill = (transition_end - window.end).as_secs_f64();
        card.active_count -= spill / profile.duration.as_secs_f64();
    }
    card.active_count = card.active_count.max(0.0);
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

fn flush(handle: &LogHandle) {
    if let Err(err) = handle.flush() {
        tracing::warn!(path = %handle.path().display(), "failed to flush log: {err}");
    }
}

impl fmt::Debug for Scoreboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoreboard")
            .field("track", &self.track())
            .field("window", &self.window())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl Drop for Scoreboard {
    fn drop(&mut self) {
        self.shared.stop.stop();
        if let Some(writer) = self.snapshot_writer.get_mut().take() {
            writer.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::operation::Failure;

    use super::*;

    fn settings() -> ScoreboardSettings {
        let track = TrackConfig {
            name: "shop".to_owned(),
            response_time_sampling_interval: 1.0,
            ..Default::default()
        };
        let run = Config {
            worker_exit_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        ScoreboardSettings::new(&track, &run)
    }

    fn record(
        profile: &Arc<LoadProfile>,
        started: Instant,
        finished: Instant,
        failed: bool,
    ) -> OperationExecutionRecord {
        OperationExecutionRecord {
            name: "get".to_owned(),
            index: 0,
            generator_id: 1,
            generated_by: "shop.Generator-1".to_owned(),
            profile: Arc::clone(profile),
            time_queued: started,
            time_started: started,
            time_finished: finished,
            execution_time: finished - started,
            is_async: false,
            interactive: true,
            failure: failed.then(|| Failure {
                message: "timeout".to_owned(),
                kind: "error",
                report: "request: timeout".to_owned(),
            }),
            actions: 1,
            trace: vec!["GET /item".to_owned()],
            label: TraceLabel::Unclassified,
        }
    }

    #[test]
    fn classifies_by_window() {
        let start = Instant::now() + Duration::from_secs(100);
        let end = start + Duration::from_secs(100);
        let window = Window { start, end };
        let s = |secs: u64| start + Duration::from_secs(secs);

        assert_eq!(window.classify(s(10), s(20)), TraceLabel::SteadyState);
        assert_eq!(window.classify(start - Duration::from_secs(5), s(1)), TraceLabel::SteadyState);
        assert_eq!(window.classify(s(0), s(100)), TraceLabel::SteadyState);
        assert_eq!(window.classify(s(90), s(110)), TraceLabel::Late);
        assert_eq!(
            window.classify(start - Duration::from_secs(10), start - Duration::from_secs(5)),
            TraceLabel::RampUp
        );
        assert_eq!(window.classify(start - Duration::from_secs(10), s(110)), TraceLabel::RampUp);
        assert_eq!(window.classify(s(101), s(102)), TraceLabel::RampDown);
    }

    #[test]
    fn aggregates_steady_state_only() {
        let scoreboard = Scoreboard::new(settings());
        let start = Instant::now();
        let end = start + Duration::from_secs(60);
        scoreboard.initialize(start, end);
        scoreboard.start().unwrap();

        let profile = LoadProfile::new(Duration::from_secs(30), 2, "")
            .named("peak")
            .activate(start, 1);
        let at = |secs: u64| start + Duration::from_secs(secs);

        scoreboard.drop_off(record(&profile, at(1), at(2), false));
        scoreboard.drop_off(record(&profile, at(3), at(4), true));
        // Finishes after the interval but within steady state.
        scoreboard.drop_off(record(&profile, at(29), at(31), false));
        scoreboard.drop_off(record(&profile, at(59), at(61), false));
        scoreboard.drop_off(record(&profile, at(62), at(63), false));
        scoreboard.stop();

        let card = scoreboard.final_scorecard().unwrap();
        assert_eq!(card.total_ops_initiated, 4);
        assert_eq!(card.total_ops_successful, 2);
        assert_eq!(card.total_ops_failed, 1);
        assert_eq!(card.total_ops_late, 1);

        let intervals = scoreboard.interval_scorecards();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].name, "peak");
        assert_eq!(intervals[0].total_ops_successful, 1);
        assert_eq!(intervals[0].total_ops_late, 1);
        assert_eq!(intervals[0].number_of_users, 2.0);

        assert_eq!(
            scoreboard.error_summary(),
            BTreeMap::from([("timeout (error)".to_owned(), 1)])
        );
        assert_eq!(scoreboard.drop_off_stats().total, 5);

        // Stopped scoreboards ignore late arrivals.
        scoreboard.drop_off(record(&profile, at(1), at(2), false));
        assert_eq!(scoreboard.drop_off_stats().total, 5);
    }

    #[test]
    fn writes_trace_and_error_logs() {
        let dir = tempfile::tempdir().unwrap();
        let scoreboard = Scoreboard::new(settings());
        let start = Instant::now();
        scoreboard.initialize(start, start + Duration::from_secs(60));

        let trace = Arc::new(LogHandle::create(dir.path().join("thread.log")).unwrap());
        let errors = Arc::new(LogHandle::create(dir.path().join("error-thread.log")).unwrap());
        scoreboard.register_log_handle("shop.Generator-1", Arc::clone(&trace));
        scoreboard.register_error_log_handle("shop.Generator-1", Arc::clone(&errors));

        let profile = LoadProfile::new(Duration::from_secs(30), 1, "").activate(start, 1);
        scoreboard.drop_off(record(&profile, start, start + Duration::from_millis(5), true));

        assert!(scoreboard.deregister_log_handle("shop.Generator-1").is_some());
        assert!(scoreboard.deregister_error_log_handle("shop.Generator-1").is_some());
        assert!(scoreboard.deregister_log_handle("shop.Generator-1").is_none());

        let trace = std::fs::read_to_string(trace.path()).unwrap();
        assert_eq!(trace, "0 get 0 GET /item\n");
        let errors = std::fs::read_to_string(errors.path()).unwrap();
        assert_eq!(errors, "[shop.Generator-1] request: timeout\n");
    }

    #[test]
    fn wait_times_within_window() {
        let scoreboard = Scoreboard::new(settings());
        let start = Instant::now();
        scoreboard.initialize(start, start + Duration::from_secs(60));

        let at = |secs: u64| start + Duration::from_secs(secs);
        scoreboard.drop_off_wait_time(at(1), "get", Duration::from_millis(10));
        scoreboard.drop_off_wait_time(at(2), "get", Duration::from_millis(30));
        scoreboard.drop_off_wait_time(at(61), "get", Duration::from_secs(9));

        let summaries = scoreboard.wait_time_summaries();
        let get = &summaries["get"];
        assert_eq!(get.count, 2);
        assert_eq!(get.average(), Duration::from_millis(20));
        assert_eq!(get.max, Some(Duration::from_millis(30)));
    }

    #[test]
    fn snapshot_file_follows_log_dir() {
        let track = TrackConfig {
            name: "shop".to_owned(),
            metric_snapshots: true,
            ..Default::default()
        };
        let run = Config {
            log_dir: Some("/var/log/rain".into()),
            ..Default::default()
        };
        let settings = ScoreboardSettings::new(&track, &run);
        assert_eq!(
            settings.metric_snapshot_file,
            Some(PathBuf::from("/var/log/rain/metrics-snapshots-shop.log"))
        );

        let disabled = ScoreboardSettings::new(&TrackConfig::default(), &run);
        assert_eq!(disabled.metric_snapshot_file, None);
    }

    #[test]
    fn streams_response_time_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics-snapshots-shop.log");
        let mut settings = settings();
        settings.metric_snapshot_file = Some(path.clone());
        settings.metric_snapshot_interval = Duration::from_millis(10);

        let scoreboard = Scoreboard::new(settings);
        let start = Instant::now();
        scoreboard.initialize(start, start + Duration::from_secs(60));
        scoreboard.start().unwrap();

        let profile = LoadProfile::new(Duration::from_secs(30), 1, "")
            .named("peak")
            .activate(start, 1);
        let at = |millis: u64| start + Duration::from_millis(millis);
        scoreboard.drop_off(record(&profile, at(0), at(10), false));
        scoreboard.drop_off(record(&profile, at(20), at(50), true));
        scoreboard.drop_off(record(&profile, at(60), at(80), false));
        scoreboard.stop();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents.lines().collect::<Vec<_>>(),
            ["[peak] 10 get 10000 10000 1", "[peak] 80 get 20000 30000 2"]
        );
    }

    #[test]
    fn prints_statistics_after_stop() {
        let scoreboard = Scoreboard::new(settings());
        let start = Instant::now();
        scoreboard.initialize(start, start + Duration::from_secs(10));
        scoreboard.start().unwrap();

        let profile = LoadProfile::new(Duration::from_secs(10), 1, "")
            .named("only")
            .activate(start, 1);
        scoreboard.drop_off(record(&profile, start, start + Duration::from_millis(50), false));
        scoreboard.stop();

        let mut out = Vec::new();
        scoreboard.print_statistics(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Final results"));
        assert!(text.contains("Operations successfully completed  : 1"));
        assert!(text.contains("Little's Law Estimate"));
        assert!(text.contains("0 type(s) of error"));
    }
}
