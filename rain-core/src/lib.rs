//! A load generation harness for benchmarking request-serving systems.
//!
//! A benchmark runs one or more tracks. Each track owns a pool of worker threads that simulate
//! users, a [`LoadScheduleManager`] that decides how many of them are active and which operation
//! mix they follow, and a [`Scoreboard`] that collects every finished operation. Workloads plug
//! in by implementing [`Generator`] and [`Operation`] and registering a constructor in a
//! [`GeneratorRegistry`].
//!
//! ```no_run
//! use rain_core::{Benchmark, Config, GeneratorRegistry};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load(Some("benchmark.yaml".as_ref()))?;
//! rain_core::observability::initialize_tracing(&config.logging)?;
//!
//! let registry = GeneratorRegistry::new();
//! let report = Benchmark::new(config, registry).run(&mut std::io::stdout())?;
//! println!("{} tracks finished", report.tracks.len());
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod benchmark;
pub mod config;
pub mod error;
pub mod generator;
pub mod logfile;
pub mod mix;
pub mod observability;
pub mod operation;
pub mod profile;
pub mod sampler;
pub mod schedule;
pub mod scoreboard;
pub mod scorecard;
pub mod snapshot;
pub mod timer;
pub mod track;
pub mod worker;

pub use benchmark::{Benchmark, RunReport, TrackReport};
pub use config::{Config, LoadProfileConfig, TrackConfig};
pub use error::{Error, Result};
pub use generator::{Generator, GeneratorContext, GeneratorRegistry};
pub use mix::MixMatrix;
pub use operation::{Operation, OperationExecutionRecord, OperationTrace};
pub use profile::LoadProfile;
pub use schedule::{LoadScheduleManager, ProfileStatus};
pub use scoreboard::Scoreboard;
pub use scorecard::Scorecard;
pub use track::Track;
