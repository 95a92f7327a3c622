//! Bounded response-time sampling for percentile estimates.
//!
//! Recording every latency of a long benchmark is wasteful. Instead, a [`ResponseTimeSampler`]
//! thins the stream: with the [`Poisson`](SamplingStrategy::Poisson) strategy, the gaps between
//! accepted samples are drawn from an exponential distribution with a configured mean, which keeps
//! the kept samples representative of the whole stream. On top of that, the number of retained
//! samples is capped. Once the cap is reached, newly accepted samples replace a random retained
//! sample so that the retained set stays a uniform subset of everything accepted.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp};

/// Default cap on retained samples per sampler.
pub const DEFAULT_MAX_SAMPLES: usize = 10_000;

/// How a sampler decides which observations to keep.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplingStrategy {
    /// Accept observations at exponentially distributed gaps with the given mean.
    ///
    /// A mean of `1.0` or less keeps every observation.
    Poisson {
        /// Mean number of observations between two accepted samples.
        mean_interval: f64,
    },
    /// Keep every observation without limit.
    ///
    /// Used when merging already thinned samples, so they are not thinned a second time.
    Null,
}

/// Approximate percentile estimator over a thinned latency stream.
#[derive(Clone, Debug)]
pub struct ResponseTimeSampler {
    strategy: SamplingStrategy,
    gaps: Option<Exp<f64>>,
    capacity: usize,
    rng: SmallRng,

    samples: Vec<u64>,
    sample_sum: u64,
    seen: u64,
    accepted: u64,
    next_to_accept: u64,
}

impl ResponseTimeSampler {
    /// Creates a Poisson sampler with the given mean interval and sample cap.
    pub fn poisson(mean_interval: f64, capacity: usize) -> Self {
        Self::with_rng(
            SamplingStrategy::Poisson { mean_interval },
            capacity,
            SmallRng::seed_from_u64(rand::random()),
        )
    }

    /// Creates a sampler that keeps every observation.
    pub fn null() -> Self {
        Self::with_rng(
            SamplingStrategy::Null,
            usize::MAX,
            SmallRng::seed_from_u64(rand::random()),
        )
    }

    /// Creates a sampler with an explicit random source.
    pub fn with_rng(strategy: SamplingStrategy, capacity: usize, rng: SmallRng) -> Self {
        let gaps = match strategy {
            SamplingStrategy::Poisson { mean_interval } if mean_interval > 1.0 => {
                Exp::new(1.0 / mean_interval).ok()
            }
            _ => None,
        };

        Self {
            strategy,
            gaps,
            capacity: capacity.max(1),
            rng,
            samples: Vec::new(),
            sample_sum: 0,
            seen: 0,
            accepted: 0,
            next_to_accept: 1,
        }
    }

    /// The strategy this sampler was created with.
    pub fn strategy(&self) -> SamplingStrategy {
        self.strategy
    }

    /// Offers an observation, returning whether it was accepted.
    pub fn accept(&mut self, value: u64) -> bool {
        self.seen += 1;
        if self.seen != self.next_to_accept {
            return false;
        }

        let gap = match &self.gaps {
            Some(exp) => exp.sample(&mut self.rng).ceil() as u64,
            None => 1,
        };
        self.next_to_accept = self.seen + gap.max(1);
        self.accepted += 1;

        if self.samples.len() < self.capacity {
            self.samples.push(value);
            self.sample_sum += value;
        } else {
            let slot = self.rng.random_range(0..self.accepted);
            if let Some(old) = self.samples.get_mut(slot as usize) {
                self.sample_sum = self.sample_sum - *old + value;
                *old = value;
            }
        }

        true
    }

    /// Number of observations offered since the last reset.
    pub fn samples_seen(&self) -> u64 {
        self.seen
    }

    /// Number of observations currently retained.
    pub fn samples_collected(&self) -> usize {
        self.samples.len()
    }

    /// The retained observations, in no particular order.
    pub fn raw_samples(&self) -> &[u64] {
        &self.samples
    }

    /// Estimates the `pct`th percentile of the retained observations.
    ///
    /// Returns 0 when nothing was retained.
    pub fn nth_percentile(&mut self, pct: f64) -> u64 {
        percentile(&mut self.samples, pct)
    }

    /// Mean of the retained observations.
    pub fn sample_mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sample_sum as f64 / self.samples.len() as f64
    }

    /// Sample standard deviation (with `n - 1` degrees of freedom).
    pub fn sample_standard_deviation(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }

        let mean = self.sample_mean();
        let squares: f64 = self
            .samples
            .iter()
            .map(|v| (*v as f64 - mean).powi(2))
            .sum();
        (squares / (n - 1) as f64).sqrt()
    }

    /// Student's t statistic of the retained samples against `population_mean`.
    pub fn t_value(&self, population_mean: f64) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }

        let stddev = self.sample_standard_deviation();
        if stddev == 0.0 {
            return 0.0;
        }
        (self.sample_mean() - population_mean) / (stddev / (n as f64).sqrt())
    }

    /// Drops all retained samples and restarts the acceptance sequence.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.sample_sum = 0;
        self.seen = 0;
        self.accepted = 0;
        self.next_to_accept = 1;
    }
}

/// Percentile by rank `round(pct * (n + 1) / 100)` over a sorted copy of `samples`.
///
/// Ranks past the end clamp to the largest sample.
pub fn percentile(samples: &mut [u64], pct: f64) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();

    let index = (pct * (samples.len() + 1) as f64 / 100.0).round() as usize;
    samples[index.min(samples.len() - 1)]
}
