//! Orchestration of a complete run.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use parking_lot::RwLock;
use yansi::Paint;

use crate::config::Config;
use crate::error::Error;
use crate::generator::GeneratorRegistry;
use crate::profile::LoadProfile;
use crate::schedule::ProfileStatus;
use crate::scorecard::Scorecard;
use crate::timer::StopSignal;
use crate::track::Track;
use crate::worker::{PoolHandle, RunTiming, WorkPool, WorkerHandle, WorkerSummary, WorkerThread};

/// Results of one track.
#[derive(Clone, Debug)]
pub struct TrackReport {
    /// Name of the track.
    pub name: String,
    /// Steady-state results across the whole run.
    pub final_scorecard: Option<Scorecard>,
    /// Steady-state results per named load profile.
    pub intervals: Vec<Scorecard>,
    /// Failure counts keyed by `"{message} ({kind})"`.
    pub errors: BTreeMap<String, u64>,
    /// Counters of the track's workers.
    pub workers: Vec<WorkerSummary>,
}

/// Results of a run.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    /// Per-track results, in configuration order.
    pub tracks: Vec<TrackReport>,
    /// Final results merged across tracks, if requested.
    pub aggregate: Option<Scorecard>,
}

impl RunReport {
    /// Results of the track named `name`.
    pub fn track(&self, name: &str) -> Option<&TrackReport> {
        self.tracks.iter().find(|track| track.name == name)
    }
}

/// Drives all configured tracks through ramp-up, steady state and ramp-down.
#[derive(Debug)]
pub struct Benchmark {
    config: Config,
    registry: GeneratorRegistry,
    tracks: RwLock<Vec<Arc<Track>>>,
}

impl Benchmark {
    /// Creates a benchmark that builds generators from `registry`.
    pub fn new(config: Config, registry: GeneratorRegistry) -> Self {
        Self {
            config,
            registry,
            tracks: RwLock::default(),
        }
    }

    /// The run configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Queues a load profile for `track` while a run is in progress.
    pub fn submit_dynamic_load_profile(&self, track: &str, profile: LoadProfile) -> ProfileStatus {
        let tracks = self.tracks.read();
        match tracks.iter().find(|t| t.name() == track) {
            Some(track) => track.submit_dynamic_load_profile(profile),
            None => {
                tracing::warn!(track, "dynamic load profile for unknown track");
                ProfileStatus::TrackNotFound
            }
        }
    }

    /// Runs the benchmark to completion and prints statistics to `out`.
    ///
    /// Blocks until every worker has passed the end of ramp-down.
    pub fn run(&self, out: &mut dyn Write) -> anyhow::Result<RunReport> {
        let start = Instant::now() + self.config.time_to_start;
        let timing = RunTiming::new(start, &self.config);

        let tracks = self.build_tracks(start)?;
        *self.tracks.write() = tracks.clone();

        let pool = WorkPool::new(self.config.max_pool_threads)?;
        let result = self.execute(&tracks, timing, pool.handle());
        *self.tracks.write() = Vec::new();
        pool.shutdown(self.config.pool_shutdown_timeout);

        let workers = result?;
        self.report(&tracks, workers, out)
    }

    fn build_tracks(&self, start: Instant) -> anyhow::Result<Vec<Arc<Track>>> {
        let mut tracks = Vec::with_capacity(self.config.tracks.len());
        for config in &self.config.tracks {
            if !self.registry.contains(&config.generator) {
                return Err(Error::UnknownGenerator(config.generator.clone()).into());
            }

            let track = match &config.load_schedule_creator {
                Some(creator) => {
                    let schedule = self.registry.create_schedule(creator, config)?;
                    Track::with_schedule(config.clone(), schedule, &self.config, start)?
                }
                None => Track::new(config.clone(), &self.config, start)?,
            };
            tracks.push(Arc::new(track));
        }
        Ok(tracks)
    }

    fn execute(
        &self,
        tracks: &[Arc<Track>],
        timing: RunTiming,
        pool: PoolHandle,
    ) -> anyhow::Result<Vec<Vec<WorkerSummary>>> {
        for track in tracks {
            let scoreboard = track.scoreboard();
            scoreboard.initialize(timing.steady_start, timing.steady_end);
            scoreboard.start()?;
            track.schedule().start()?;
        }

        tracing::info!(
            tracks = tracks.len(),
            time_to_start = ?self.config.time_to_start,
            ramp_up = ?self.config.ramp_up,
            duration = ?self.config.duration,
            ramp_down = ?self.config.ramp_down,
            "starting benchmark"
        );

        let stop = StopSignal::new();
        let spawned = self.spawn_workers(tracks, timing, &pool, &stop);
        if spawned.is_err() {
            stop.stop();
        }

        let (handles, error) = match spawned {
            Ok(handles) => (handles, None),
            Err((handles, error)) => (handles, Some(error)),
        };

        let mut summaries = vec![Vec::new(); tracks.len()];
        for (index, handle) in handles {
            if let Some(summary) = handle.join() {
                summaries[index].push(summary);
            }
        }
        tracing::info!("all workers finished");

        for track in tracks {
            track.scoreboard().stop();
            track.schedule().stop();
        }

        match error {
            Some(error) => Err(error),
            None => Ok(summaries),
        }
    }

    #[allow(clippy::type_complexity)]
    fn spawn_workers(
        &self,
        tracks: &[Arc<Track>],
        timing: RunTiming,
        pool: &PoolHandle,
        stop: &StopSignal,
    ) -> Result<Vec<(usize, WorkerHandle)>, (Vec<(usize, WorkerHandle)>, anyhow::Error)> {
        let mut handles = Vec::new();
        for (index, track) in tracks.iter().enumerate() {
            for id in 1..=track.max_users() {
                let worker = WorkerThread::new(
                    id,
                    Arc::clone(track),
                    &self.registry,
                    pool.clone(),
                    timing,
                    stop.clone(),
                    self.config.log_dir.as_deref(),
                )
                .and_then(|worker| Ok(worker.spawn()?))
                .with_context(|| {
                    format!("failed to start worker {id} of track `{}`", track.name())
                });

                match worker {
                    Ok(handle) => handles.push((index, handle)),
                    Err(error) => return Err((handles, error)),
                }
            }
            tracing::debug!(track = %track.name(), workers = track.max_users(), "spawned workers");
        }
        Ok(handles)
    }

    fn report(
        &self,
        tracks: &[Arc<Track>],
        workers: Vec<Vec<WorkerSummary>>,
        out: &mut dyn Write,
    ) -> anyhow::Result<RunReport> {
        let mut report = RunReport::default();

        for (track, workers) in tracks.iter().zip(workers) {
            let scoreboard = track.scoreboard();
            report.tracks.push(TrackReport {
                name: track.name().to_owned(),
                final_scorecard: scoreboard.final_scorecard(),
                intervals: scoreboard.interval_scorecards(),
                errors: scoreboard.error_summary(),
                workers,
            });

            writeln!(out)?;
            scoreboard.print_statistics(out)?;
        }

        if self.config.aggregate_stats {
            let mut aggregate = Scorecard::new("aggregate", self.config.duration, "all");
            for card in report.tracks.iter().filter_map(|t| t.final_scorecard.as_ref()) {
                aggregate.merge(card);
            }

            writeln!(out)?;
            writeln!(out, "{} ({} tracks)", "## Aggregate results".bold(), tracks.len())?;
            let mut printed = aggregate.clone();
            printed.print_statistics(out)?;
            report.aggregate = Some(aggregate);
        }

        out.flush()?;
        Ok(report)
    }
}
