//! Load profiles describe how many users run which mix for how long.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::LoadProfileConfig;

/// A time-bounded target concurrency and operation mix.
///
/// Profiles in a track's schedule act as templates. Each time the schedule makes one current, it
/// publishes a fresh snapshot via [`activate`](Self::activate) that carries the activation time and
/// how often this profile has been activated so far. Snapshots are never modified afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadProfile {
    /// Optional interval name. Named profiles get their own interval scorecard.
    pub name: Option<String>,
    /// How long the profile is active before the transition window starts.
    pub duration: Duration,
    /// Trailing window during which readers blend into the next profile.
    pub transition: Duration,
    /// Number of simulated users that should be active.
    pub users: usize,
    /// Name of the mix matrix that picks operations. Empty means the track default.
    pub mix: String,
    /// Aggregate cap on asynchronous operations per second across all active users. Zero means
    /// unlimited.
    pub open_loop_max_ops_per_sec: u64,

    activated_at: Option<Instant>,
    activation_count: u64,
}

impl LoadProfile {
    /// Creates an unnamed profile without transition or rate limit.
    pub fn new(duration: Duration, users: usize, mix: impl Into<String>) -> Self {
        Self {
            name: None,
            duration,
            transition: Duration::ZERO,
            users,
            mix: mix.into(),
            open_loop_max_ops_per_sec: 0,
            activated_at: None,
            activation_count: 0,
        }
    }

    /// Sets the interval name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the transition window that follows the profile's duration.
    pub fn with_transition(mut self, transition: Duration) -> Self {
        self.transition = transition;
        self
    }

    /// Limits asynchronous operations to `ops_per_sec` across all active users.
    pub fn with_max_ops_per_sec(mut self, ops_per_sec: u64) -> Self {
        self.open_loop_max_ops_per_sec = ops_per_sec;
        self
    }

    /// Returns a snapshot of this profile made current at `at`.
    pub fn activate(&self, at: Instant, activation_count: u64) -> Arc<Self> {
        Arc::new(Self {
            activated_at: Some(at),
            activation_count,
            ..self.clone()
        })
    }

    /// The moment this snapshot became current, if it has been activated.
    pub fn activated_at(&self) -> Option<Instant> {
        self.activated_at
    }

    /// How many times this profile has been made current, including this activation.
    pub fn activation_count(&self) -> u64 {
        self.activation_count
    }

    /// End of the interval proper, after which the transition window begins.
    pub fn interval_end(&self) -> Option<Instant> {
        self.activated_at.map(|at| at + self.duration)
    }

    /// End of the transition window, after which the next profile is due.
    pub fn transition_end(&self) -> Option<Instant> {
        self.interval_end().map(|end| end + self.transition)
    }

    /// The interval name, if set and not empty.
    pub fn interval_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }
}

impl From<&LoadProfileConfig> for LoadProfile {
    fn from(config: &LoadProfileConfig) -> Self {
        Self {
            name: config.name.clone(),
            duration: config.duration,
            transition: config.transition,
            users: config.users,
            mix: config.mix.clone(),
            open_loop_max_ops_per_sec: config.open_loop_max_ops_per_sec,
            activated_at: None,
            activation_count: 0,
        }
    }
}

impl fmt::Display for LoadProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] duration: {:?}, users: {}, mix: {}, transition: {:?}",
            self.interval_name().unwrap_or("unnamed"),
            self.duration,
            self.users,
            if self.mix.is_empty() { "default" } else { &self.mix },
            self.transition,
        )?;
        if self.open_loop_max_ops_per_sec > 0 {
            write!(f, ", max ops/s: {}", self.open_loop_max_ops_per_sec)?;
        }
        Ok(())
    }
}
