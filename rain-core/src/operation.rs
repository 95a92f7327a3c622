//! Operations and their execution records.
//!
//! An [`Operation`] is the workload-specific unit of work a generator hands out. The harness
//! wraps it in an [`OperationTask`] that carries the bookkeeping (who generated it, under which
//! load profile, whether it runs asynchronously) and turns a finished run into an immutable
//! [`OperationExecutionRecord`] for the scoreboard.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::generator::GeneratorContext;
use crate::profile::LoadProfile;
use crate::scoreboard::Scoreboard;

/// A single request against the system under test.
pub trait Operation: Send + 'static {
    /// Name of the operation type, used as the key for statistics.
    fn name(&self) -> &str;

    /// Index of the operation type in the track's mix matrix.
    fn index(&self) -> usize;

    /// Called once before the operation is dispatched.
    fn prepare(&mut self, _context: &GeneratorContext) {}

    /// Performs the request.
    ///
    /// Sub-requests can be recorded into `trace`. Each recorded line counts as one action.
    fn execute(&mut self, trace: &mut OperationTrace) -> anyhow::Result<()>;

    /// Releases resources after the result has been recorded.
    fn cleanup(&mut self) {}
}

impl fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name())
            .field("index", &self.index())
            .finish()
    }
}

/// Ordered lines describing the sub-requests of one operation.
#[derive(Clone, Debug, Default)]
pub struct OperationTrace {
    lines: Vec<String>,
}

impl OperationTrace {
    /// Appends a line to the trace.
    pub fn record(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Number of recorded lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// The measurement window an execution record falls into.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TraceLabel {
    /// Not classified yet, or outside every window.
    #[default]
    Unclassified,
    /// Initiated before the steady-state window.
    RampUp,
    /// Completed within the steady-state window.
    SteadyState,
    /// Initiated within the window, completed after it.
    Late,
    /// Initiated after the steady-state window.
    RampDown,
}

/// Why an operation failed.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    /// The innermost cause.
    pub message: String,
    /// Either `error` for returned errors or `panic` for panics.
    pub kind: &'static str,
    /// The text written to the error log.
    pub report: String,
}

impl Failure {
    fn from_error(err: &anyhow::Error, verbose: bool) -> Self {
        Self {
            message: err.root_cause().to_string(),
            kind: "error",
            report: if verbose {
                format!("{err:?}")
            } else {
                format!("{err:#}")
            },
        }
    }

    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "operation panicked".to_owned());

        Self {
            report: format!("panic: {message}"),
            message,
            kind: "panic",
        }
    }

    /// Key under which the failure is counted in the error summary.
    pub fn summary_key(&self) -> String {
        format!("{} ({})", self.message, self.kind)
    }
}

/// Immutable snapshot of a finished operation.
///
/// Records order by start time, then by finish time.
#[derive(Clone, Debug)]
pub struct OperationExecutionRecord {
    /// Operation type name.
    pub name: String,
    /// Operation type index in the mix.
    pub index: usize,
    /// Id of the generator that produced the operation.
    pub generator_id: usize,
    /// Name of the worker thread that generated the operation.
    pub generated_by: String,
    /// The load profile snapshot active when the operation was generated.
    pub profile: Arc<LoadProfile>,
    /// When the operation was handed off for execution.
    pub time_queued: Instant,
    /// When execution started.
    pub time_started: Instant,
    /// When execution finished.
    pub time_finished: Instant,
    /// High-resolution execution time.
    pub execution_time: Duration,
    /// Whether the operation ran on the shared pool.
    pub is_async: bool,
    /// Whether the operation was a real request rather than a trace-only run.
    pub interactive: bool,
    /// Failure details, if the operation failed.
    pub failure: Option<Failure>,
    /// Number of actions, which is the trace length or 1 without a trace.
    pub actions: u64,
    /// The sub-request trace.
    pub trace: Vec<String>,
    /// Window classification, assigned by the scoreboard on drop-off.
    pub label: TraceLabel,
}

impl OperationExecutionRecord {
    /// Returns `true` if the operation completed without error.
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Wall-clock response time between start and finish.
    pub fn response_time(&self) -> Duration {
        self.time_finished.saturating_duration_since(self.time_started)
    }
}

impl PartialEq for OperationExecutionRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OperationExecutionRecord {}

impl PartialOrd for OperationExecutionRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OperationExecutionRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time_started
            .cmp(&other.time_started)
            .then(self.time_finished.cmp(&other.time_finished))
    }
}

/// An operation together with its dispatch metadata.
#[derive(Debug)]
pub struct OperationTask {
    operation: Box<dyn Operation>,
    generator_id: usize,
    generated_by: String,
    profile: Arc<LoadProfile>,
    is_async: bool,
    interactive: bool,
    verbose_errors: bool,
    time_queued: Instant,
}

impl OperationTask {
    /// Wraps an operation produced by generator `generator_id` on thread `generated_by` under
    /// `profile`.
    pub fn new(
        operation: Box<dyn Operation>,
        generator_id: usize,
        generated_by: impl Into<String>,
        profile: Arc<LoadProfile>,
    ) -> Self {
        Self {
            operation,
            generator_id,
            generated_by: generated_by.into(),
            profile,
            is_async: false,
            interactive: true,
            verbose_errors: false,
            time_queued: Instant::now(),
        }
    }

    /// Marks the task for asynchronous execution.
    pub fn set_async(&mut self, is_async: bool) {
        self.is_async = is_async;
    }

    /// Marks the task as a real request, or as a trace-only run.
    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive = interactive;
    }

    /// Writes full error reports instead of the error chain.
    pub fn set_verbose_errors(&mut self, verbose: bool) {
        self.verbose_errors = verbose;
    }

    /// Records when the task was handed off.
    pub fn mark_queued(&mut self) {
        self.time_queued = Instant::now();
    }

    /// The wrapped operation's type name.
    pub fn name(&self) -> &str {
        self.operation.name()
    }

    /// Executes the operation and returns its record.
    ///
    /// Errors and panics raised by the operation are captured as a failure. The operation is
    /// cleaned up afterwards.
    pub fn execute(mut self) -> OperationExecutionRecord {
        let mut trace = OperationTrace::default();

        let time_started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| self.operation.execute(&mut trace)));
        let execution_time = time_started.elapsed();
        let time_finished = Instant::now();

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(Failure::from_error(&err, self.verbose_errors)),
            Err(payload) => Some(Failure::from_panic(payload.as_ref())),
        };

        let actions = trace.len().max(1) as u64;
        let record = OperationExecutionRecord {
            name: self.operation.name().to_owned(),
            index: self.operation.index(),
            generator_id: self.generator_id,
            generated_by: self.generated_by,
            profile: self.profile,
            time_queued: self.time_queued,
            time_started,
            time_finished,
            execution_time,
            is_async: self.is_async,
            interactive: self.interactive,
            failure,
            actions,
            trace: trace.into_lines(),
            label: TraceLabel::Unclassified,
        };

        self.operation.cleanup();
        record
    }

    /// Executes the operation and drops the record off at `scoreboard`.
    pub fn run(self, scoreboard: &Scoreboard) {
        scoreboard.drop_off(self.execute());
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    struct Scripted {
        outcome: &'static str,
        cleaned_up: Arc<parking_lot::Mutex<bool>>,
    }

    impl Operation for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn index(&self) -> usize {
            3
        }

        fn execute(&mut self, trace: &mut OperationTrace) -> anyhow::Result<()> {
            match self.outcome {
                "trace" => {
                    trace.record("GET /a");
                    trace.record("GET /b");
                    Ok(())
                }
                "error" => Err(anyhow::anyhow!("connection refused")).context("fetching /a"),
                "panic" => panic!("boom"),
                _ => Ok(()),
            }
        }

        fn cleanup(&mut self) {
            *self.cleaned_up.lock() = true;
        }
    }

    fn task(outcome: &'static str) -> (OperationTask, Arc<parking_lot::Mutex<bool>>) {
        let cleaned_up = Arc::default();
        let operation = Scripted {
            outcome,
            cleaned_up: Arc::clone(&cleaned_up),
        };
        let profile = Arc::new(LoadProfile::new(Duration::from_secs(1), 1, "default"));
        (
            OperationTask::new(Box::new(operation), 1, "track.Generator-1", profile),
            cleaned_up,
        )
    }

    #[test]
    fn success_without_trace_counts_one_action() {
        let (task, cleaned_up) = task("ok");
        let record = task.execute();

        assert!(record.succeeded());
        assert_eq!(record.actions, 1);
        assert_eq!(record.name, "scripted");
        assert_eq!(record.index, 3);
        assert_eq!(record.generator_id, 1);
        assert_eq!(record.generated_by, "track.Generator-1");
        assert!(record.time_started <= record.time_finished);
        assert_eq!(record.label, TraceLabel::Unclassified);
        assert!(*cleaned_up.lock());
    }

    #[test]
    fn trace_lines_become_actions() {
        let (task, _) = task("trace");
        let record = task.execute();

        assert_eq!(record.actions, 2);
        assert_eq!(record.trace, vec!["GET /a", "GET /b"]);
    }

    #[test]
    fn errors_are_captured() {
        let (task, cleaned_up) = task("error");
        let record = task.execute();

        let failure = record.failure.unwrap();
        assert_eq!(failure.message, "connection refused");
        assert_eq!(failure.report, "fetching /a: connection refused");
        assert_eq!(failure.summary_key(), "connection refused (error)");
        assert!(*cleaned_up.lock());
    }

    #[test]
    fn panics_are_captured() {
        let (task, _) = task("panic");
        let record = task.execute();

        let failure = record.failure.unwrap();
        assert_eq!(failure.kind, "panic");
        assert_eq!(failure.message, "boom");
    }

    #[test]
    fn records_order_by_start_time() {
        let (first, _) = task("ok");
        let (second, _) = task("ok");
        let a = first.execute();
        let b = second.execute();

        let mut records = vec![b.clone(), a.clone()];
        records.sort();
        assert!(records[0].time_started <= records[1].time_started);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }
}
