//! Time-driven load profile schedules.
//!
//! A [`LoadScheduleManager`] cycles through a track's load profiles on a background thread. Worker
//! threads read the current profile on every iteration with
//! [`current_load_profile`](LoadScheduleManager::current_load_profile), which never waits on the
//! manager.
//!
//! Near the end of a profile, readers blend into the next one: during the trailing transition
//! window, the probability of seeing the next profile grows linearly with the elapsed fraction of
//! the window. Once the window has passed, readers see the next profile even if the manager has
//! not woken up yet.
//!
//! Profiles can also be injected at runtime with [`submit`](LoadScheduleManager::submit). A valid
//! injected profile takes precedence over the static schedule at the next advance.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::error::{Error, Result};
use crate::profile::LoadProfile;
use crate::timer::StopSignal;

/// Outcome of validating a load profile.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProfileStatus {
    /// The profile is valid, possibly after capping its user count.
    Valid,
    /// The profile asks for no users.
    BadUserCount,
    /// The profile names a mix the track does not define.
    UnknownMix,
    /// The profile was submitted for a track that does not exist.
    TrackNotFound,
}

impl ProfileStatus {
    /// Numeric status code.
    pub fn code(self) -> i32 {
        match self {
            Self::Valid => VALID_LOAD_PROFILE,
            Self::BadUserCount => ERROR_INVALID_LOAD_PROFILE_BAD_NUM_USERS,
            Self::UnknownMix => ERROR_INVALID_LOAD_PROFILE_BAD_MIX_NAME,
            Self::TrackNotFound => ERROR_TRACK_NOT_FOUND,
        }
    }

    /// Returns `true` for [`ProfileStatus::Valid`].
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }
}

/// Status code of a valid profile.
pub const VALID_LOAD_PROFILE: i32 = 0;
/// Status code of a profile without users.
pub const ERROR_INVALID_LOAD_PROFILE_BAD_NUM_USERS: i32 = 777;
/// Status code of a profile with an unknown mix.
pub const ERROR_INVALID_LOAD_PROFILE_BAD_MIX_NAME: i32 = 778;
/// Status code of a submission to an unknown track.
pub const ERROR_TRACK_NOT_FOUND: i32 = 779;

/// Checks load profiles against a track's mixes and user limit.
#[derive(Clone, Debug, Default)]
pub struct ProfileValidator {
    mixes: BTreeSet<String>,
    max_users: usize,
}

impl ProfileValidator {
    /// Creates a validator for the given mix names and user cap. A cap of zero disables capping.
    pub fn new(mixes: impl IntoIterator<Item = String>, max_users: usize) -> Self {
        Self {
            mixes: mixes.into_iter().collect(),
            max_users,
        }
    }

    /// Validates `profile`, capping its user count at the track maximum.
    pub fn validate(&self, profile: &mut LoadProfile) -> ProfileStatus {
        if profile.users == 0 {
            return ProfileStatus::BadUserCount;
        }
        if !profile.mix.is_empty() && !self.mixes.contains(&profile.mix) {
            return ProfileStatus::UnknownMix;
        }
        if self.max_users > 0 && profile.users > self.max_users {
            tracing::debug!(
                requested = profile.users,
                max = self.max_users,
                "capping load profile users"
            );
            profile.users = self.max_users;
        }
        ProfileStatus::Valid
    }
}

/// Lifecycle of a schedule manager.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScheduleState {
    /// Created but not started.
    Idle,
    /// Waiting for the first profile's activation.
    RampingUp,
    /// Advancing through profiles.
    Running,
    /// Stopped, either on request or after an error.
    Stopped,
}

/// Drives a track's cyclic load schedule.
pub struct LoadScheduleManager {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    track: String,
    schedule: Vec<Arc<LoadProfile>>,
    validator: ProfileValidator,

    current: RwLock<Arc<LoadProfile>>,
    index: AtomicUsize,
    activations: Mutex<Vec<u64>>,
    dynamic: Mutex<VecDeque<LoadProfile>>,

    state: Mutex<ScheduleState>,
    stop: StopSignal,
}

impl LoadScheduleManager {
    /// Creates a manager whose first profile becomes active at `start + ramp_up`.
    pub fn new(
        track: impl Into<String>,
        schedule: Vec<LoadProfile>,
        validator: ProfileValidator,
        start: Instant,
        ramp_up: Duration,
    ) -> Result<Self> {
        let track = track.into();
        let Some(first) = schedule.first() else {
            return Err(Error::EmptySchedule(track));
        };

        let current = first.activate(start + ramp_up, 1);
        let mut activations = vec![0; schedule.len()];
        activations[0] = 1;

        let inner = Inner {
            track,
            schedule: schedule.into_iter().map(Arc::new).collect(),
            validator,
            current: RwLock::new(current),
            index: AtomicUsize::new(0),
            activations: Mutex::new(activations),
            dynamic: Mutex::new(VecDeque::new()),
            state: Mutex::new(ScheduleState::Idle),
            stop: StopSignal::new(),
        };

        Ok(Self {
            inner: Arc::new(inner),
            handle: Mutex::new(None),
        })
    }

    /// Spawns the background thread that advances the schedule.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        *self.inner.state.lock() = ScheduleState::RampingUp;
        let inner = Arc::clone(&self.inner);
        let thread = thread::Builder::new()
            .name(format!("{}.schedule", self.inner.track))
            .spawn(move || {
                if catch_unwind(AssertUnwindSafe(|| inner.run())).is_err() {
                    tracing::error!(track = %inner.track, "load schedule manager panicked");
                }
                *inner.state.lock() = ScheduleState::Stopped;
            })?;

        *handle = Some(thread);
        Ok(())
    }

    /// Stops the background thread and waits for it to exit.
    pub fn stop(&self) {
        self.inner.stop.stop();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!(track = %self.inner.track, "load schedule thread failed to join");
            }
        }
        *self.inner.state.lock() = ScheduleState::Stopped;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScheduleState {
        *self.inner.state.lock()
    }

    /// Index of the static profile that is, or was most recently, current.
    pub fn current_index(&self) -> usize {
        self.inner.index.load(Ordering::Acquire)
    }

    /// The static schedule.
    pub fn schedule(&self) -> &[Arc<LoadProfile>] {
        &self.inner.schedule
    }

    /// The profile published by the last advance, without transition blending.
    pub fn active_profile(&self) -> Arc<LoadProfile> {
        Arc::clone(&self.inner.current.read())
    }

    /// The profile the next advance would make current.
    pub fn next_load_profile(&self) -> Arc<LoadProfile> {
        self.inner.next_profile()
    }

    /// The profile workers should follow right now.
    pub fn current_load_profile(&self) -> Arc<LoadProfile> {
        self.current_load_profile_at(Instant::now(), &mut rand::rng())
    }

    /// The profile workers should follow at `now`.
    pub fn current_load_profile_at<R: Rng>(&self, now: Instant, rng: &mut R) -> Arc<LoadProfile> {
        let current = self.active_profile();
        let (Some(interval_end), Some(transition_end)) =
            (current.interval_end(), current.transition_end())
        else {
            return current;
        };

        // Also covers reads before activation, i.e. during ramp-up.
        if now <= interval_end {
            return current;
        }

        if now < transition_end {
            let elapsed = (now - interval_end).as_secs_f64();
            let fraction = elapsed / current.transition.as_secs_f64();
            if rng.random::<f64>() < fraction {
                return self.next_load_profile();
            }
            return current;
        }

        // The manager overslept, the next profile is already due.
        self.next_load_profile()
    }

    /// Queues a profile to run at the next advance.
    ///
    /// The user count is capped at the track maximum. Invalid profiles are rejected and not
    /// queued.
    pub fn submit(&self, mut profile: LoadProfile) -> ProfileStatus {
        let status = self.inner.validator.validate(&mut profile);
        if status.is_valid() {
            tracing::info!(track = %self.inner.track, %profile, "dynamic load profile queued");
            self.inner.dynamic.lock().push_back(profile);
        } else {
            tracing::warn!(
                track = %self.inner.track,
                %profile,
                code = status.code(),
                "rejected dynamic load profile"
            );
        }
        status
    }

    /// Makes the next profile current, activated at `now`.
    ///
    /// This is what the background thread does each time a profile's transition window ends.
    pub fn advance(&self, now: Instant) -> Arc<LoadProfile> {
        self.inner.advance(now)
    }
}

impl Inner {
    fn run(&self) {
        let first_activation = self.current.read().activated_at();
        if let Some(at) = first_activation {
            if !self.stop.sleep_until(at) {
                return;
            }
        }

        *self.state.lock() = ScheduleState::Running;
        loop {
            let current = Arc::clone(&self.current.read());
            let deadline = current
                .transition_end()
                .unwrap_or_else(|| Instant::now() + current.duration + current.transition);

            if !self.stop.sleep_until(deadline) {
                tracing::debug!(track = %self.track, "load schedule stopped");
                return;
            }

            self.advance(Instant::now());
        }
    }

    fn pop_dynamic(&self) -> Option<LoadProfile> {
        let mut dynamic = self.dynamic.lock();
        while let Some(mut profile) = dynamic.pop_front() {
            if self.validator.validate(&mut profile).is_valid() {
                return Some(profile);
            }
        }
        None
    }

    fn next_profile(&self) -> Arc<LoadProfile> {
        if let Some(profile) = self.dynamic.lock().front() {
            return Arc::new(profile.clone());
        }
        let next = (self.index.load(Ordering::Acquire) + 1) % self.schedule.len();
        Arc::clone(&self.schedule[next])
    }

    fn advance(&self, now: Instant) -> Arc<LoadProfile> {
        let next = match self.pop_dynamic() {
            Some(profile) => {
                tracing::info!(track = %self.track, %profile, "activating dynamic load profile");
                profile.activate(now, 1)
            }
            None => {
                let next = (self.index.load(Ordering::Acquire) + 1) % self.schedule.len();
                if next == 0 {
                    tracing::info!(track = %self.track, "cycling back to first load profile");
                }
                self.index.store(next, Ordering::Release);

                let count = {
                    let mut activations = self.activations.lock();
                    activations[next] += 1;
                    activations[next]
                };
                let profile = self.schedule[next].activate(now, count);
                tracing::info!(
                    track = %self.track,
                    index = next,
                    %profile,
                    "advancing load profile"
                );
                profile
            }
        };

        *self.current.write() = Arc::clone(&next);
        next
    }
}

impl fmt::Debug for LoadScheduleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadScheduleManager")
            .field("track", &self.inner.track)
            .field("index", &self.current_index())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for LoadScheduleManager {
    fn drop(&mut self) {
        self.inner.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn manager(start: Instant) -> LoadScheduleManager {
        let schedule = vec![
            LoadProfile::new(secs(10), 1, "a")
                .named("p0")
                .with_transition(secs(4)),
            LoadProfile::new(secs(10), 2, "b").named("p1"),
            LoadProfile::new(secs(10), 3, "").named("p2"),
        ];
        let validator = ProfileValidator::new(["a".to_owned(), "b".to_owned()], 5);
        LoadScheduleManager::new("test", schedule, validator, start, secs(2)).unwrap()
    }

    #[test]
    fn first_profile_active_after_ramp_up() {
        let start = Instant::now();
        let manager = manager(start);

        let current = manager.active_profile();
        assert_eq!(current.name.as_deref(), Some("p0"));
        assert_eq!(current.activated_at(), Some(start + secs(2)));
        assert_eq!(current.activation_count(), 1);
        assert_eq!(manager.state(), ScheduleState::Idle);
    }

    #[test]
    fn blends_during_transition() {
        let start = Instant::now();
        let manager = manager(start);
        let mut rng = SmallRng::seed_from_u64(3);
        let interval_end = start + secs(12);

        // Before activation and within the interval proper.
        for now in [start, start + secs(5), interval_end] {
            let profile = manager.current_load_profile_at(now, &mut rng);
            assert_eq!(profile.name.as_deref(), Some("p0"));
        }

        let share_of_next = |now: Instant, rng: &mut SmallRng| {
            let draws = 20_000;
            let next = (0..draws)
                .filter(|_| {
                    let profile = manager.current_load_profile_at(now, rng);
                    assert!(matches!(profile.name.as_deref(), Some("p0" | "p1")));
                    profile.name.as_deref() == Some("p1")
                })
                .count();
            next as f64 / draws as f64
        };

        let early = share_of_next(interval_end + secs(1), &mut rng);
        let late = share_of_next(interval_end + secs(3), &mut rng);
        assert!((early - 0.25).abs() < 0.02, "early {early}");
        assert!((late - 0.75).abs() < 0.02, "late {late}");

        let overslept = manager.current_load_profile_at(interval_end + secs(4), &mut rng);
        assert_eq!(overslept.name.as_deref(), Some("p1"));
    }

    #[test]
    fn advances_cyclically() {
        let start = Instant::now();
        let manager = manager(start);

        let names: Vec<_> = (0..4)
            .map(|i| manager.advance(start + secs(20 * (i + 1))))
            .map(|p| (p.name.clone().unwrap(), p.activation_count()))
            .collect();

        assert_eq!(
            names,
            [
                ("p1".to_owned(), 1),
                ("p2".to_owned(), 1),
                ("p0".to_owned(), 2),
                ("p1".to_owned(), 2),
            ]
        );
        assert_eq!(manager.current_index(), 1);
        assert_eq!(
            manager.active_profile().activated_at(),
            Some(start + secs(80))
        );
    }

    #[test]
    fn validates_dynamic_profiles() {
        let manager = manager(Instant::now());

        let idle = LoadProfile::new(secs(1), 0, "a");
        assert_eq!(manager.submit(idle), ProfileStatus::BadUserCount);

        let unknown = LoadProfile::new(secs(1), 1, "missing");
        assert_eq!(manager.submit(unknown).code(), 778);

        assert_eq!(manager.next_load_profile().name.as_deref(), Some("p1"));

        let huge = LoadProfile::new(secs(1), 50, "b").named("burst");
        assert_eq!(manager.submit(huge), ProfileStatus::Valid);
        assert_eq!(manager.next_load_profile().name.as_deref(), Some("burst"));

        let now = Instant::now();
        let active = manager.advance(now);
        assert_eq!(active.name.as_deref(), Some("burst"));
        assert_eq!(active.users, 5);
        assert_eq!(active.activated_at(), Some(now));

        // The static schedule resumes afterwards.
        assert_eq!(manager.current_index(), 0);
        assert_eq!(manager.advance(now).name.as_deref(), Some("p1"));
    }

    #[test]
    fn stop_interrupts_background_thread() {
        let manager = manager(Instant::now());
        manager.start().unwrap();
        assert_ne!(manager.state(), ScheduleState::Idle);

        let begin = Instant::now();
        manager.stop();
        assert!(begin.elapsed() < secs(2));
        assert_eq!(manager.state(), ScheduleState::Stopped);
        assert_eq!(manager.active_profile().name.as_deref(), Some("p0"));
    }
}
