//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] and [`fred`] errors. Implementations of the engine's store
//! traits convert them into [`StoreError`] at the trait boundary.

use reroll_core::store::StoreError;

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record did not have the expected shape.
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt {
        /// Key or row that failed to decode.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Serialization(e) => Self::Serialization {
                message: e.to_string(),
            },
            DbError::Corrupt { .. } => Self::Serialization {
                message: err.to_string(),
            },
            DbError::Postgres(_)
            | DbError::Migration(_)
            | DbError::Dragonfly(_)
            | DbError::Config(_) => Self::Backend {
                message: err.to_string(),
            },
        }
    }
}
