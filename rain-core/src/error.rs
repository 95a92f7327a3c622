use thiserror::Error;

/// Errors raised while configuring or running a benchmark.
#[derive(Debug, Error)]
pub enum Error {
    /// A mix matrix that cannot be normalized into selection probabilities.
    #[error("invalid mix matrix `{mix}`: {reason}")]
    InvalidMix {
        /// Name of the offending mix.
        mix: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A load profile references a mix that the track does not define.
    #[error("unknown mix `{0}`")]
    UnknownMix(String),

    /// No generator is registered under the configured name.
    #[error("unknown generator `{0}`")]
    UnknownGenerator(String),

    /// No load schedule creator is registered under the configured name.
    #[error("unknown load schedule creator `{0}`")]
    UnknownScheduleCreator(String),

    /// A load profile with impossible settings.
    #[error("invalid load profile: {0}")]
    InvalidProfile(String),

    /// A track without a single load profile to run.
    #[error("track `{0}` has an empty load schedule")]
    EmptySchedule(String),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or parsed.
    #[error("config error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

/// Result type for benchmark setup and bookkeeping.
pub type Result<T, E = Error> = std::result::Result<T, E>;
