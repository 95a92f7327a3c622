//! Generators produce the operations a simulated user issues.
//!
//! Workloads plug into the harness by registering a constructor in a [`GeneratorRegistry`] under
//! the name referenced by [`TrackConfig::generator`](crate::config::TrackConfig::generator). Each
//! worker thread builds its own generator from a [`GeneratorContext`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Exp};

use crate::config::TrackConfig;
use crate::error::Error;
use crate::operation::Operation;
use crate::profile::LoadProfile;
use crate::track::Track;

/// Produces operations for one simulated user.
pub trait Generator: Send {
    /// Returns the operation to issue after `last_operation` under `profile`.
    ///
    /// `None` skips this iteration.
    fn next_request(
        &mut self,
        last_operation: Option<usize>,
        profile: &LoadProfile,
    ) -> Option<Box<dyn Operation>>;

    /// Pause after a synchronous operation completes.
    fn think_time(&mut self) -> Duration;

    /// Interval between two asynchronous issues.
    fn cycle_time(&mut self) -> Duration;

    /// Called once when the owning worker finishes.
    fn dispose(&mut self) {}
}

/// Everything a generator gets to know about where it runs.
#[derive(Clone, Debug)]
pub struct GeneratorContext {
    /// The track the generator belongs to.
    pub track: Arc<Track>,
    /// Numeric id of the owning worker, starting at 1.
    pub id: usize,
    /// Name of the owning worker thread.
    pub name: String,
    /// Seed for the generator's random source.
    pub seed: u64,
}

type Factory = dyn Fn(&GeneratorContext) -> anyhow::Result<Box<dyn Generator>> + Send + Sync;

type ScheduleFactory = dyn Fn(&TrackConfig) -> anyhow::Result<Vec<LoadProfile>> + Send + Sync;

/// Maps configuration names to generator constructors and load schedule creators.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    factories: BTreeMap<String, Arc<Factory>>,
    schedules: BTreeMap<String, Arc<ScheduleFactory>>,
}

impl GeneratorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&GeneratorContext) -> anyhow::Result<Box<dyn Generator>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Returns `true` if a generator is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds the generator registered under `name`.
    pub fn create(
        &self,
        name: &str,
        context: &GeneratorContext,
    ) -> anyhow::Result<Box<dyn Generator>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownGenerator(name.to_owned()))?;
        factory(context)
    }

    /// Registers a load schedule creator under `name`.
    ///
    /// Tracks that set [`TrackConfig::load_schedule_creator`] get their schedule from the creator
    /// instead of their static `load_schedule`.
    pub fn register_schedule_creator<F>(
        &mut self,
        name: impl Into<String>,
        creator: F,
    ) -> &mut Self
    where
        F: Fn(&TrackConfig) -> anyhow::Result<Vec<LoadProfile>> + Send + Sync + 'static,
    {
        self.schedules.insert(name.into(), Arc::new(creator));
        self
    }

    /// Builds the load schedule of `track` with the creator registered under `name`.
    pub fn create_schedule(
        &self,
        name: &str,
        track: &TrackConfig,
    ) -> anyhow::Result<Vec<LoadProfile>> {
        let creator = self
            .schedules
            .get(name)
            .ok_or_else(|| Error::UnknownScheduleCreator(name.to_owned()))?;
        creator(track)
    }
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("generators", &self.factories.keys().collect::<Vec<_>>())
            .field("schedules", &self.schedules.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Draws a negative-exponentially distributed delay with the given mean.
///
/// A zero mean always yields zero.
pub fn exponential_delay<R: Rng>(mean: Duration, rng: &mut R) -> Duration {
    if mean.is_zero() {
        return Duration::ZERO;
    }
    match Exp::new(1.0 / mean.as_secs_f64()) {
        Ok(exp) => Duration::from_secs_f64(exp.sample(rng)),
        Err(_) => mean,
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;

    #[test]
    fn exponential_delay_has_requested_mean() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mean = Duration::from_millis(200);

        let total: Duration = (0..50_000).map(|_| exponential_delay(mean, &mut rng)).sum();
        let observed = total / 50_000;

        assert!(
            observed > Duration::from_millis(190) && observed < Duration::from_millis(210),
            "observed mean {observed:?}"
        );
        assert_eq!(exponential_delay(Duration::ZERO, &mut rng), Duration::ZERO);
    }

    #[test]
    fn registry_lists_names() {
        let mut registry = GeneratorRegistry::new();
        registry.register("browse", |_| anyhow::bail!("not needed"));

        assert!(registry.contains("browse"));
        assert!(!registry.contains("checkout"));
        assert_eq!(
            format!("{registry:?}"),
            r#"GeneratorRegistry { generators: ["browse"], schedules: [] }"#
        );
    }

    #[test]
    fn schedule_creators_build_profiles() {
        let mut registry = GeneratorRegistry::new();
        registry.register_schedule_creator("ramp", |track: &TrackConfig| {
            Ok((1..=track.max_users)
                .map(|users| LoadProfile::new(Duration::from_secs(10), users, ""))
                .collect())
        });

        let track = TrackConfig {
            max_users: 3,
            ..Default::default()
        };
        let schedule = registry.create_schedule("ramp", &track).unwrap();
        let users: Vec<_> = schedule.iter().map(|p| p.users).collect();
        assert_eq!(users, [1, 2, 3]);

        let err = registry.create_schedule("spike", &track).unwrap_err();
        assert_eq!(err.to_string(), "unknown load schedule creator `spike`");
    }
}
