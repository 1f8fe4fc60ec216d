//! Error types for the reroll engine.
//!
//! Every per-entity failure leaves the entity exactly as it was: decisions
//! are computed on a copy and only written back when they succeed.

use chrono::{DateTime, Utc};
use reroll_types::{GodPackId, ParticipantId, VerificationStatus};

use crate::clock::ClockError;
use crate::store::{EntityKey, StoreError};

/// Input that can never be accepted, whatever the entity state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// A field the operation cannot do without was absent.
    #[error("missing required field `{field}`")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// Instance names must be non-empty.
    #[error("instance name is empty")]
    EmptyInstanceName,

    /// A `NoShow` test was recorded without the tester's slots/friends ratio.
    #[error("NoShow outcome requires a slots/friends ratio")]
    MissingRatio,

    /// The slots/friends ratio was negative, NaN or infinite.
    #[error("slots/friends ratio {ratio} is not a finite non-negative number")]
    InvalidRatio {
        /// The rejected ratio.
        ratio: f64,
    },

    /// A heartbeat claims a time too far ahead of the engine clock.
    #[error("heartbeat timestamp {timestamp} is more than {max_skew_secs}s ahead of {now}")]
    FutureTimestamp {
        /// Timestamp carried by the report.
        timestamp: DateTime<Utc>,
        /// Engine time at ingestion.
        now: DateTime<Utc>,
        /// Tolerated lead in seconds.
        max_skew_secs: u64,
    },

    /// A God Pack was announced with a pack count outside 1..=5.
    #[error("pack count {pack_count} is outside 1..=5")]
    InvalidPackCount {
        /// The rejected count.
        pack_count: u8,
    },

    /// An expiry extension of zero hours, or one that overflows the deadline.
    #[error("cannot extend expiry by {hours}h")]
    InvalidExtension {
        /// The rejected extension.
        hours: i64,
    },

    /// A timeline query window or bucket size is unusable.
    #[error("invalid range: {reason}")]
    InvalidRange {
        /// What is wrong with the range.
        reason: String,
    },

    /// The participant has not earned leech status yet.
    #[error("leech requires {min_gps} GPs or {min_packs} packs (have {gps_found} GPs, {packs_opened} packs)")]
    LeechNotEligible {
        /// GPs the participant has found.
        gps_found: u64,
        /// Packs the participant has opened.
        packs_opened: u64,
        /// GPs required.
        min_gps: u64,
        /// Packs required.
        min_packs: u64,
    },
}

/// Errors surfaced by engine commands and queries.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input; nothing changed.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Heartbeat not newer than the instance's last accepted one; dropped.
    #[error(
        "stale heartbeat for {participant_id}/{instance}: {timestamp} is not after {last_seen}"
    )]
    StaleReport {
        /// Reporting participant.
        participant_id: ParticipantId,
        /// Reporting instance.
        instance: String,
        /// Timestamp of the dropped report.
        timestamp: DateTime<Utc>,
        /// Last accepted timestamp for the instance.
        last_seen: DateTime<Utc>,
    },

    /// Test recorded against a God Pack that already has a final status.
    #[error("God Pack {gp_id} is already {status:?}")]
    TerminalConflict {
        /// The resolved pack.
        gp_id: GodPackId,
        /// Its terminal status.
        status: VerificationStatus,
    },

    /// Every write attempt lost a version race.
    #[error("gave up on {key} after {attempts} conflicting writes")]
    ConcurrencyConflict {
        /// The contended entity.
        key: EntityKey,
        /// Attempts made.
        attempts: u32,
    },

    /// The addressed entity does not exist.
    #[error("{key} not found")]
    NotFound {
        /// The missing entity.
        key: EntityKey,
    },

    /// The caller may not perform the action.
    #[error("{caller} may not {action}")]
    PermissionDenied {
        /// Who asked.
        caller: ParticipantId,
        /// What they asked for.
        action: &'static str,
    },

    /// The store failed for a reason other than a version race.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The scheduler clock failed.
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),
}

impl EngineError {
    /// Short machine-readable name of the error class.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::StaleReport { .. } => "stale_report",
            Self::TerminalConflict { .. } => "gp_already_terminal",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::NotFound { .. } => "not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Store(_) => "store",
            Self::Clock(_) => "clock",
        }
    }

    /// Whether retrying later might succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::Store(_))
    }
}
