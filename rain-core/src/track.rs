//! Tracks bundle everything one workload lane needs at runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, DEFAULT_MIX, TrackConfig};
use crate::error::{Error, Result};
use crate::mix::MixMatrix;
use crate::profile::LoadProfile;
use crate::schedule::{LoadScheduleManager, ProfileStatus, ProfileValidator};
use crate::scoreboard::{Scoreboard, ScoreboardSettings};

/// A configured track with its schedule and scoreboard.
pub struct Track {
    config: TrackConfig,
    mixes: BTreeMap<String, MixMatrix>,
    max_users: usize,
    verbose_errors: bool,
    schedule: LoadScheduleManager,
    scoreboard: Scoreboard,
}

impl Track {
    /// Builds a track whose schedule starts at `start` after the run's ramp-up.
    ///
    /// Fails if a mix matrix is malformed, the schedule is empty, or a scheduled profile names an
    /// unknown mix or has a zero duration.
    pub fn new(config: TrackConfig, run: &Config, start: Instant) -> Result<Self> {
        let schedule = config.load_schedule.iter().map(Into::into).collect();
        Self::with_schedule(config, schedule, run, start)
    }

    /// Builds a track that runs `schedule` instead of its configured load schedule.
    pub fn with_schedule(
        config: TrackConfig,
        schedule: Vec<LoadProfile>,
        run: &Config,
        start: Instant,
    ) -> Result<Self> {
        let mixes = config
            .mixes
            .iter()
            .map(|(name, weights)| {
                let mix = MixMatrix::new(name, weights.clone())?;
                Ok((name.clone(), mix))
            })
            .collect::<Result<BTreeMap<String, MixMatrix>>>()?;

        if let Some(profile) = schedule
            .iter()
            .find(|p| !p.mix.is_empty() && !mixes.contains_key(&p.mix))
        {
            return Err(Error::UnknownMix(profile.mix.clone()));
        }
        if let Some(profile) = schedule.iter().find(|p| p.duration.is_zero()) {
            return Err(Error::InvalidProfile(format!("{profile} has no duration")));
        }

        let max_users = match config.max_users {
            0 => schedule.iter().map(|p| p.users).max().unwrap_or(0),
            max => max,
        };

        let validator = ProfileValidator::new(mixes.keys().cloned(), max_users);
        let schedule =
            LoadScheduleManager::new(&config.name, schedule, validator, start, run.ramp_up)?;

        let scoreboard = Scoreboard::new(ScoreboardSettings::new(&config, run));

        Ok(Self {
            config,
            mixes,
            max_users,
            verbose_errors: run.verbose_errors,
            schedule,
            scoreboard,
        })
    }

    /// Name of the track.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration the track was built from.
    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    /// Number of worker threads for this track.
    pub fn max_users(&self) -> usize {
        self.max_users
    }

    /// Probability of issuing an operation asynchronously.
    pub fn open_loop_probability(&self) -> f64 {
        self.config.open_loop_probability
    }

    /// Whether operations are real requests.
    pub fn interactive(&self) -> bool {
        self.config.interactive
    }

    /// Whether error logs receive full reports.
    pub fn verbose_errors(&self) -> bool {
        self.verbose_errors
    }

    /// Mean cycle time configured for generators.
    pub fn mean_cycle_time(&self) -> Duration {
        self.config.mean_cycle_time
    }

    /// Mean think time configured for generators.
    pub fn mean_think_time(&self) -> Duration {
        self.config.mean_think_time
    }

    /// All mixes of the track.
    pub fn mixes(&self) -> &BTreeMap<String, MixMatrix> {
        &self.mixes
    }

    /// Looks up a mix by name.
    ///
    /// An empty name selects the `default` mix, or the only mix if there is just one.
    pub fn mix(&self, name: &str) -> Option<&MixMatrix> {
        if !name.is_empty() {
            return self.mixes.get(name);
        }
        self.mixes.get(DEFAULT_MIX).or_else(|| match self.mixes.len() {
            1 => self.mixes.values().next(),
            _ => None,
        })
    }

    /// The mix used by `profile`.
    pub fn mix_for(&self, profile: &LoadProfile) -> Option<&MixMatrix> {
        self.mix(&profile.mix)
    }

    /// The track's load schedule.
    pub fn schedule(&self) -> &LoadScheduleManager {
        &self.schedule
    }

    /// The track's scoreboard.
    pub fn scoreboard(&self) -> &Scoreboard {
        &self.scoreboard
    }

    /// The profile workers should follow right now.
    pub fn current_load_profile(&self) -> Arc<LoadProfile> {
        self.schedule.current_load_profile()
    }

    /// Validates and queues a profile for the next schedule advance.
    pub fn submit_dynamic_load_profile(&self, profile: LoadProfile) -> ProfileStatus {
        self.schedule.submit(profile)
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.config.name)
            .field("generator", &self.config.generator)
            .field("max_users", &self.max_users)
            .field("mixes", &self.mixes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
