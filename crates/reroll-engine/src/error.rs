//! Error types for the engine binary.
//!
//! [`EngineBinError`] wraps every failure that can stop the process during
//! startup or while the scheduler runs.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineBinError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: reroll_core::config::ConfigError,
    },

    /// Scheduler clock initialization failed.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: reroll_core::clock::ClockError,
    },

    /// The scheduler loop failed.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: reroll_core::runner::RunnerError,
    },

    /// A persistent store could not be reached or migrated.
    #[error("database error: {source}")]
    Db {
        /// The underlying data layer error.
        #[from]
        source: reroll_db::DbError,
    },

    /// NATS connection or subscription failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },
}
