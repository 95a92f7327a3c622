//! Configuration for benchmark runs.
//!
//! Configuration is merged from the following sources (highest precedence first):
//!
//! 1. Environment variables (prefixed with `RAIN__`)
//! 2. YAML configuration file
//! 3. Defaults
//!
//! See [`Config`] for a description of all fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `RAIN__` as a prefix and double underscores (`__`) to denote nested
//! structures. For example:
//!
//! - `RAIN__DURATION=10m` sets the steady-state duration
//! - `RAIN__LOGGING__LEVEL=debug` raises log verbosity
//!
//! # YAML Configuration File
//!
//! ```yaml
//! ramp_up: 30s
//! duration: 10m
//! ramp_down: 10s
//!
//! tracks:
//!   - name: storefront
//!     generator: browse
//!     open_loop_probability: 0.2
//!     mixes:
//!       default:
//!         - [0, 1]
//!         - [1, 0]
//!     load_schedule:
//!       - duration: 5m
//!         users: 20
//!         mix: default
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::Result;
use crate::sampler::DEFAULT_MAX_SAMPLES;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "RAIN__";

/// Mix name used when a load profile does not name one.
pub const DEFAULT_MIX: &str = "default";

/// Run-wide configuration.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Delay between setting up a run and its scheduled start.
    ///
    /// Gives all worker threads time to spawn before the first operation is issued.
    ///
    /// # Default
    ///
    /// `5s`
    #[serde(with = "humantime_serde")]
    pub time_to_start: Duration,

    /// Warm-up period before the steady-state window.
    ///
    /// Operations started during ramp-up are executed but not counted.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub ramp_up: Duration,

    /// Length of the steady-state measurement window.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Cool-down period after the steady-state window.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub ramp_down: Duration,

    /// Directory for per-thread trace and error logs.
    ///
    /// Without a directory, operation traces are not written to files.
    ///
    /// # Default
    ///
    /// `None`
    pub log_dir: Option<PathBuf>,

    /// Writes full error reports, including causes and backtraces, to error logs.
    ///
    /// # Default
    ///
    /// `false`
    pub verbose_errors: bool,

    /// Prints an additional scorecard merged across all tracks.
    ///
    /// # Default
    ///
    /// `false`
    pub aggregate_stats: bool,

    /// How long to wait for a scoreboard to drain its queue on shutdown.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub worker_exit_timeout: Duration,

    /// How long to wait for in-flight asynchronous operations on shutdown.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub pool_shutdown_timeout: Duration,

    /// Maximum number of threads executing asynchronous operations.
    ///
    /// # Default
    ///
    /// `10`
    pub max_pool_threads: usize,

    /// Logging configuration.
    pub logging: Logging,

    /// The tracks to run concurrently.
    pub tracks: Vec<TrackConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            time_to_start: Duration::from_secs(5),
            ramp_up: Duration::from_secs(10),
            duration: Duration::from_secs(60),
            ramp_down: Duration::from_secs(10),
            log_dir: None,
            verbose_errors: false,
            aggregate_stats: false,
            worker_exit_timeout: Duration::from_secs(60),
            pool_shutdown_timeout: Duration::from_secs(10),
            max_pool_threads: 10,
            logging: Logging::default(),
            tracks: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration, merging defaults, an optional YAML file, and `RAIN__` environment
    /// variables in that order.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, or if any value has the wrong
    /// type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}

/// One independently scheduled workload lane.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Name of the track, used in thread names and reports.
    pub name: String,

    /// Registry name of the generator that produces operations.
    pub generator: String,

    /// Host the generator should target. Passed through to generators unchanged.
    pub target_host: String,

    /// Port the generator should target.
    pub target_port: u16,

    /// Number of worker threads, and the cap for dynamically submitted profiles.
    ///
    /// Zero derives the value from the largest profile in the load schedule.
    pub max_users: usize,

    /// Probability that an operation is issued open-loop (asynchronously).
    pub open_loop_probability: f64,

    /// Probability that a completed operation is written to the thread's trace log.
    pub log_sampling_probability: f64,

    /// Mean pacing between asynchronous issues. Generators may use this for cycle times.
    #[serde(with = "humantime_serde")]
    pub mean_cycle_time: Duration,

    /// Mean pause after a synchronous operation. Generators may use this for think times.
    #[serde(with = "humantime_serde")]
    pub mean_think_time: Duration,

    /// Whether operations are real requests. Non-interactive tracks only produce traces and skip
    /// pacing and latency accounting.
    pub interactive: bool,

    /// Mean number of observations between two retained response-time samples.
    pub response_time_sampling_interval: f64,

    /// Cap on retained response-time samples per operation.
    pub max_response_time_samples: usize,

    /// Streams every steady-state response time to `metrics-snapshots-{name}.log` during the
    /// run. The file is created in [`Config::log_dir`], or the working directory without one.
    pub metric_snapshots: bool,

    /// How often the snapshot writer flushes queued response times.
    #[serde(with = "humantime_serde")]
    pub metric_snapshot_interval: Duration,

    /// Named mix matrices, as raw weight rows.
    pub mixes: BTreeMap<String, Vec<Vec<f64>>>,

    /// The cyclic schedule of load profiles.
    pub load_schedule: Vec<LoadProfileConfig>,

    /// Registry name of a creator that builds the load schedule programmatically.
    ///
    /// When set, `load_schedule` is ignored.
    pub load_schedule_creator: Option<String>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            name: "track".to_owned(),
            generator: String::new(),
            target_host: "localhost".to_owned(),
            target_port: 80,
            max_users: 0,
            open_loop_probability: 0.0,
            log_sampling_probability: 1.0,
            mean_cycle_time: Duration::ZERO,
            mean_think_time: Duration::ZERO,
            interactive: true,
            response_time_sampling_interval: 500.0,
            max_response_time_samples: DEFAULT_MAX_SAMPLES,
            metric_snapshots: false,
            metric_snapshot_interval: Duration::from_secs(60),
            mixes: BTreeMap::new(),
            load_schedule: Vec::new(),
            load_schedule_creator: None,
        }
    }
}

/// A load profile as written in configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoadProfileConfig {
    /// Optional interval name.
    #[serde(default)]
    pub name: Option<String>,
    /// How long the profile runs.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Number of active users.
    pub users: usize,
    /// Mix name. Empty selects the track's default mix.
    #[serde(default)]
    pub mix: String,
    /// Transition window into the next profile.
    #[serde(default, with = "humantime_serde")]
    pub transition: Duration,
    /// Aggregate asynchronous rate limit. Zero means unlimited.
    #[serde(default)]
    pub open_loop_max_ops_per_sec: u64,
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  rain_core::schedule > advancing to profile 1
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2020-12-04T12:10:32Z [rain_core::schedule] INFO: advancing to profile 1
    /// ```
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Console diagnostics are always written to stderr. Per-thread operation logs are configured
/// separately through [`Config::log_dir`].
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// `RUST_LOG` takes precedence when set.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `RAIN__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options.
    ///
    /// # Default
    ///
    /// `Auto`
    ///
    /// # Environment Variable
    ///
    /// `RAIN__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}
