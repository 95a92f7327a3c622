//! Load generation threads and the shared pool for asynchronous operations.
//!
//! Every simulated user is a dedicated OS thread running a [`WorkerThread`]. Per iteration it asks
//! its generator for the next operation and flips a coin against the track's open-loop
//! probability: closed-loop operations run inline and are followed by a think time, open-loop
//! operations are handed to the [`WorkPool`] and the worker sleeps for a cycle time instead.

use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::runtime::{Handle, Runtime};

use crate::config::Config;
use crate::error::Result;
use crate::generator::{Generator, GeneratorContext, GeneratorRegistry};
use crate::logfile::LogHandle;
use crate::operation::OperationTask;
use crate::profile::LoadProfile;
use crate::timer::StopSignal;
use crate::track::Track;

/// How long an inactive worker waits before checking the load profile again.
const INACTIVE_DURATION: Duration = Duration::from_secs(1);

/// Minimum pause when a generator has nothing to issue.
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// A bounded pool of threads that executes asynchronous operations.
///
/// The pool is backed by the blocking thread pool of a dedicated tokio runtime, which grows on
/// demand up to the configured maximum and queues submissions beyond that.
#[derive(Debug)]
pub struct WorkPool {
    runtime: Runtime,
}

impl WorkPool {
    /// Creates a pool with at most `max_threads` threads.
    pub fn new(max_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("rain-pool")
            .worker_threads(1)
            .max_blocking_threads(max_threads.max(1))
            .build()?;

        Ok(Self { runtime })
    }

    /// A cloneable handle for submitting work.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle(self.runtime.handle().clone())
    }

    /// Stops the pool, waiting up to `timeout` for running operations.
    ///
    /// Queued operations that have not started are discarded.
    pub fn shutdown(self, timeout: Duration) {
        tracing::debug!(?timeout, "shutting down work pool");
        self.runtime.shutdown_timeout(timeout);
    }
}

/// Submits work to a [`WorkPool`].
#[derive(Clone, Debug)]
pub struct PoolHandle(Handle);

impl PoolHandle {
    /// Runs `job` on a pool thread.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Completion is observed through the scoreboard.
        drop(self.0.spawn_blocking(job));
    }
}

/// Lifecycle of a worker thread.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WorkerState {
    /// Sleeping until the run starts.
    #[default]
    WaitingToStart,
    /// Issuing operations.
    Active,
    /// Parked because the current profile needs fewer users.
    Inactive,
    /// Done.
    Finished,
}

/// Landmarks of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunTiming {
    /// When workers start issuing operations.
    pub start: Instant,
    /// Start of steady state.
    pub steady_start: Instant,
    /// End of steady state.
    pub steady_end: Instant,
    /// When workers stop issuing operations.
    pub quit: Instant,
}

impl RunTiming {
    /// Lays out ramp-up, steady state and ramp-down of `config` after `start`.
    pub fn new(start: Instant, config: &Config) -> Self {
        let steady_start = start + config.ramp_up;
        let steady_end = steady_start + config.duration;
        Self {
            start,
            steady_start,
            steady_end,
            quit: steady_end + config.ramp_down,
        }
    }
}

/// Paces open-loop submissions to a profile's aggregate rate.
#[derive(Debug, Default)]
struct RateLimiter {
    send_next: Option<Instant>,
}

impl RateLimiter {
    /// Returns how long to hold back a submission made at `now` under `profile`.
    fn delay(&mut self, profile: &LoadProfile, now: Instant) -> Duration {
        if profile.open_loop_max_ops_per_sec == 0 {
            return Duration::ZERO;
        }

        if let Some(next) = self.send_next {
            if now < next {
                return next - now;
            }
        }

        let users = profile.users.max(1) as f64;
        let mut rate = profile.open_loop_max_ops_per_sec as f64 / users;
        if rate <= 0.0 {
            rate = 1000.0;
        }
        // Each user targets twice its share of the interval.
        let wait_millis = (1000.0 / rate * 2.0) as u64;
        self.send_next = Some(now + Duration::from_millis(wait_millis));
        Duration::ZERO
    }
}

/// Counters of a finished worker.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerSummary {
    /// Name of the worker thread.
    pub name: String,
    /// Operations executed inline.
    pub sync_operations: u64,
    /// Operations submitted to the pool.
    pub async_operations: u64,
}

/// A running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    state: Arc<Mutex<WorkerState>>,
    thread: JoinHandle<WorkerSummary>,
}

impl WorkerHandle {
    /// Name of the worker thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Waits for the worker to finish.
    pub fn join(self) -> Option<WorkerSummary> {
        match self.thread.join() {
            Ok(summary) => Some(summary),
            Err(_) => {
                tracing::error!(worker = %self.name, "worker thread failed to join");
                None
            }
        }
    }
}

/// Unregisters a worker's log files from the scoreboard and flushes them.
struct LogRegistration {
    track: Arc<Track>,
    owner: String,
}

impl Drop for LogRegistration {
    fn drop(&mut self) {
        let scoreboard = self.track.scoreboard();
        scoreboard.deregister_log_handle(&self.owner);
        scoreboard.deregister_error_log_handle(&self.owner);
    }
}

/// One simulated user.
pub struct WorkerThread {
    id: usize,
    name: String,
    track: Arc<Track>,
    generator: Box<dyn Generator>,
    context: GeneratorContext,
    pool: PoolHandle,
    timing: RunTiming,
    stop: StopSignal,
    log_dir: Option<PathBuf>,
    rng: SmallRng,
    limiter: RateLimiter,
    state: Arc<Mutex<WorkerState>>,
    summary: WorkerSummary,
}

impl WorkerThread {
    /// Creates worker `id` of `track`, building its generator from `registry`.
    ///
    /// Ids start at 1. A worker is active whenever its id does not exceed the user count of the
    /// current load profile.
    pub fn new(
        id: usize,
        track: Arc<Track>,
        registry: &GeneratorRegistry,
        pool: PoolHandle,
        timing: RunTiming,
        stop: StopSignal,
        log_dir: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let name = format!("{}.Generator-{id}", track.name());
        // The generator draws from its own stream, independent of the open-loop coin.
        let mut rng = SmallRng::seed_from_u64(rand::random());
        let context = GeneratorContext {
            track: Arc::clone(&track),
            id,
            name: name.clone(),
            seed: rng.random(),
        };
        let generator = registry.create(&track.config().generator, &context)?;

        Ok(Self {
            id,
            summary: WorkerSummary {
                name: name.clone(),
                ..Default::default()
            },
            name,
            track,
            generator,
            context,
            pool,
            timing,
            stop,
            log_dir: log_dir.map(Path::to_path_buf),
            rng,
            limiter: RateLimiter::default(),
            state: Arc::default(),
        })
    }

    /// Name of the worker thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the worker on its own named thread.
    pub fn spawn(self) -> Result<WorkerHandle> {
        let name = self.name.clone();
        let state = Arc::clone(&self.state);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())?;

        Ok(WorkerHandle {
            name,
            state,
            thread,
        })
    }

    /// Generates load until the run's quit time and returns the worker's counters.
    pub fn run(mut self) -> WorkerSummary {
        let _logs = self.register_logs();

        if self.stop.sleep_until(self.timing.start) {
            let result = catch_unwind(AssertUnwindSafe(|| self.generate()));
            if result.is_err() {
                tracing::error!(worker = %self.name, "load generation thread died by panic");
            }
        }

        self.set_state(WorkerState::Finished);
        self.generator.dispose();
        tracing::debug!(
            worker = %self.name,
            sync_ops = self.summary.sync_operations,
            async_ops = self.summary.async_operations,
            "worker finished"
        );
        self.summary
    }

    fn generate(&mut self) {
        let mut last_operation = None;

        while Instant::now() <= self.timing.quit && !self.stop.is_stopped() {
            let profile = self
                .track
                .schedule()
                .current_load_profile_at(Instant::now(), &mut self.rng);

            if self.id > profile.users {
                self.set_state(WorkerState::Inactive);
                let wake_up = (Instant::now() + INACTIVE_DURATION).min(self.timing.quit);
                self.stop.sleep_until(wake_up);
                continue;
            }
            self.set_state(WorkerState::Active);

            let Some(mut operation) = self.generator.next_request(last_operation, &profile) else {
                let wait = self.generator.think_time().max(IDLE_BACKOFF);
                self.stop.sleep(wait);
                continue;
            };
            last_operation = Some(operation.index());
            operation.prepare(&self.context);

            let mut task = OperationTask::new(operation, self.id, &self.name, Arc::clone(&profile));
            task.set_interactive(self.track.interactive());
            task.set_verbose_errors(self.track.verbose_errors());

            if self.rng.random::<f64>() <= self.track.open_loop_probability() {
                self.issue_async(task, &profile);
            } else {
                self.issue_sync(task);
            }
        }
    }

    fn issue_async(&mut self, mut task: OperationTask, profile: &LoadProfile) {
        self.summary.async_operations += 1;
        let operation = task.name().to_owned();
        let wake_up = Instant::now() + self.generator.cycle_time();

        let delay = self.limiter.delay(profile, Instant::now());
        if !delay.is_zero() && !self.stop.sleep(delay) {
            return;
        }

        task.set_async(true);
        task.mark_queued();
        let track = Arc::clone(&self.track);
        self.pool.submit(move || task.run(track.scoreboard()));

        self.pace_until(wake_up, &operation);
    }

    fn issue_sync(&mut self, mut task: OperationTask) {
        self.summary.sync_operations += 1;
        let operation = task.name().to_owned();

        task.set_async(false);
        task.mark_queued();
        task.run(self.track.scoreboard());

        let wake_up = Instant::now() + self.generator.think_time();
        self.pace_until(wake_up, &operation);
    }

    /// Sleeps until `deadline` and records the wait. Trace-only runs do not sleep.
    fn pace_until(&self, deadline: Instant, operation: &str) {
        if !self.track.interactive() {
            return;
        }

        let before = Instant::now();
        if deadline > before {
            self.stop.sleep_until(deadline);
        }
        let now = Instant::now();
        self.track
            .scoreboard()
            .drop_off_wait_time(now, operation, now - before);
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    fn register_logs(&self) -> Option<LogRegistration> {
        let dir = self.log_dir.as_deref()?;
        if let Err(err) = fs::create_dir_all(dir) {
            tracing::warn!(worker = %self.name, "could not create log directory: {err}");
            return None;
        }

        let scoreboard = self.track.scoreboard();
        match LogHandle::create(dir.join(format!("thread-{}.log", self.name))) {
            Ok(handle) => scoreboard.register_log_handle(&self.name, Arc::new(handle)),
            Err(err) => tracing::warn!(worker = %self.name, "could not create trace log: {err}"),
        }
        match LogHandle::create(dir.join(format!("error-thread-{}.log", self.name))) {
            Ok(handle) => scoreboard.register_error_log_handle(&self.name, Arc::new(handle)),
            Err(err) => tracing::warn!(worker = %self.name, "could not create error log: {err}"),
        }

        Some(LogRegistration {
            track: Arc::clone(&self.track),
            owner: self.name.clone(),
        })
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("timing", &self.timing)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::{LoadProfileConfig, TrackConfig};
    use crate::operation::{Operation, OperationTrace};

    use super::*;

    #[test]
    fn rate_limiter_spaces_submissions() {
        let profile = LoadProfile::new(Duration::from_secs(10), 4, "").with_max_ops_per_sec(8);
        let mut limiter = RateLimiter::default();
        let now = Instant::now();

        // 8 ops/s over 4 users is 2 ops/s per user, doubled to a 1s spacing.
        assert_eq!(limiter.delay(&profile, now), Duration::ZERO);
        assert_eq!(
            limiter.delay(&profile, now + Duration::from_millis(400)),
            Duration::from_millis(600)
        );
        assert_eq!(limiter.delay(&profile, now + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn rate_limiter_ignores_unlimited_profiles() {
        let profile = LoadProfile::new(Duration::from_secs(10), 4, "");
        let mut limiter = RateLimiter::default();
        let now = Instant::now();

        assert_eq!(limiter.delay(&profile, now), Duration::ZERO);
        assert_eq!(limiter.delay(&profile, now), Duration::ZERO);
    }

    #[test]
    fn rate_limiter_floors_tiny_rates() {
        // A quarter op per second per user, doubled to an 8s spacing.
        let profile = LoadProfile::new(Duration::from_secs(10), 4, "").with_max_ops_per_sec(1);
        let mut limiter = RateLimiter::default();
        let now = Instant::now();

        assert_eq!(limiter.delay(&profile, now), Duration::ZERO);
        assert_eq!(limiter.delay(&profile, now), Duration::from_millis(8000));
    }

    #[test]
    fn timing_lays_out_phases() {
        let config = Config {
            ramp_up: Duration::from_secs(1),
            duration: Duration::from_secs(2),
            ramp_down: Duration::from_secs(3),
            ..Default::default()
        };
        let start = Instant::now();
        let timing = RunTiming::new(start, &config);

        assert_eq!(timing.steady_start, start + Duration::from_secs(1));
        assert_eq!(timing.steady_end, start + Duration::from_secs(3));
        assert_eq!(timing.quit, start + Duration::from_secs(6));
    }

    #[test]
    fn pool_runs_submitted_jobs() {
        let pool = WorkPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.handle().submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown(Duration::from_secs(5));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    struct Ping;

    impl Operation for Ping {
        fn name(&self) -> &str {
            "ping"
        }

        fn index(&self) -> usize {
            0
        }

        fn execute(&mut self, _trace: &mut OperationTrace) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct PingGenerator;

    impl Generator for PingGenerator {
        fn next_request(
            &mut self,
            _last_operation: Option<usize>,
            _profile: &LoadProfile,
        ) -> Option<Box<dyn Operation>> {
            Some(Box::new(Ping))
        }

        fn think_time(&mut self) -> Duration {
            Duration::from_millis(5)
        }

        fn cycle_time(&mut self) -> Duration {
            Duration::from_millis(5)
        }
    }

    fn ping_track(users: usize, start: Instant, config: &Config) -> Arc<Track> {
        let track = TrackConfig {
            name: "ping".to_owned(),
            generator: "ping".to_owned(),
            max_users: 2,
            load_schedule: vec![LoadProfileConfig {
                name: None,
                duration: Duration::from_secs(60),
                users,
                mix: String::new(),
                transition: Duration::ZERO,
                open_loop_max_ops_per_sec: 0,
            }],
            ..Default::default()
        };
        Arc::new(Track::new(track, config, start).unwrap())
    }

    fn registry() -> GeneratorRegistry {
        let mut registry = GeneratorRegistry::new();
        registry.register("ping", |_| Ok(Box::new(PingGenerator) as Box<dyn Generator>));
        registry
    }

    #[test]
    fn active_worker_issues_operations() {
        let config = Config {
            ramp_up: Duration::ZERO,
            duration: Duration::from_millis(200),
            ramp_down: Duration::ZERO,
            ..Default::default()
        };
        let start = Instant::now();
        let track = ping_track(1, start, &config);
        let pool = WorkPool::new(1).unwrap();

        let worker = WorkerThread::new(
            1,
            Arc::clone(&track),
            &registry(),
            pool.handle(),
            RunTiming::new(start, &config),
            StopSignal::new(),
            None,
        )
        .unwrap();
        assert_eq!(worker.name(), "ping.Generator-1");

        let summary = worker.spawn().unwrap().join().unwrap();
        assert!(summary.sync_operations > 0);
        assert_eq!(summary.async_operations, 0);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn surplus_worker_stays_inactive() {
        let config = Config {
            ramp_up: Duration::ZERO,
            duration: Duration::from_millis(200),
            ramp_down: Duration::ZERO,
            ..Default::default()
        };
        let start = Instant::now();
        let track = ping_track(1, start, &config);
        let pool = WorkPool::new(1).unwrap();
        let stop = StopSignal::new();

        let worker = WorkerThread::new(
            2,
            track,
            &registry(),
            pool.handle(),
            RunTiming::new(start, &config),
            stop.clone(),
            None,
        )
        .unwrap();

        let handle = worker.spawn().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.state(), WorkerState::Inactive);

        stop.stop();
        let summary = handle.join().unwrap();
        assert_eq!(summary.sync_operations, 0);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn unknown_generator_fails() {
        let config = Config::default();
        let start = Instant::now();
        let track = ping_track(1, start, &config);
        let pool = WorkPool::new(1).unwrap();

        let err = WorkerThread::new(
            1,
            track,
            &GeneratorRegistry::new(),
            pool.handle(),
            RunTiming::new(start, &config),
            StopSignal::new(),
            None,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "unknown generator `ping`");
        pool.shutdown(Duration::from_secs(1));
    }
}
