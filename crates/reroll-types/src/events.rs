//! Notifications emitted by the engine for downstream delivery.
//!
//! Every participant status transition, auto-kick flag, anti-cheat flag,
//! and God Pack lifecycle step produces one [`Notification`]. The
//! statistics aggregator consumes status changes; the notification sink
//! forwards everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{AntiCheatRule, ParticipantStatus, TestOutcome, TransitionCause, VerificationStatus};
use crate::ids::{EventId, GodPackId, ParticipantId};

/// A participant moved from one status to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StatusChange {
    /// The participant that transitioned.
    pub participant_id: ParticipantId,
    /// Status before the transition.
    pub from: ParticipantStatus,
    /// Status after the transition.
    pub to: ParticipantStatus,
    /// What drove it.
    pub cause: TransitionCause,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// An advisory plausibility flag raised against a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct AntiCheatFlag {
    /// The reporting participant.
    pub participant_id: ParticipantId,
    /// The reporting instance.
    pub instance_name: String,
    /// Which rule was broken.
    pub rule: AntiCheatRule,
    /// The observed value (packs/min, instance count, or seconds).
    pub observed: f64,
    /// The bound it was compared against.
    pub limit: f64,
    /// Timestamp of the offending report.
    pub at: DateTime<Utc>,
}

/// What a notification is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum NotificationKind {
    /// A participant changed status.
    StatusChanged(StatusChange),
    /// A participant stayed silent past the auto-kick threshold.
    FlaggedForRemoval {
        /// The flagged participant.
        participant_id: ParticipantId,
        /// Last heartbeat or activation before the silence.
        silent_since: Option<DateTime<Utc>>,
    },
    /// A heartbeat broke a plausibility rule.
    AntiCheat(AntiCheatFlag),
    /// A new God Pack candidate was found.
    GodPackDiscovered {
        /// The new candidate.
        gp_id: GodPackId,
        /// Who found it.
        discovered_by: ParticipantId,
    },
    /// A test was appended to a God Pack's ledger.
    TestRecorded {
        /// The tested pack.
        gp_id: GodPackId,
        /// Who tested it.
        tester: ParticipantId,
        /// What they saw.
        outcome: TestOutcome,
        /// Live-probability after the append.
        probability: Option<f64>,
    },
    /// A God Pack reached a terminal status.
    GodPackResolved {
        /// The resolved pack.
        gp_id: GodPackId,
        /// Its terminal status.
        status: VerificationStatus,
        /// The tester whose record resolved it.
        resolved_by: ParticipantId,
    },
    /// A pending God Pack is close to its expiry deadline.
    GodPackExpiringSoon {
        /// The pack.
        gp_id: GodPackId,
        /// Its deadline.
        expires_at: DateTime<Utc>,
    },
    /// A pending God Pack expired and is now `Dead`.
    GodPackExpired {
        /// The pack.
        gp_id: GodPackId,
        /// The deadline it passed, or the time an admin forced it.
        expires_at: DateTime<Utc>,
        /// Admin who forced the expiry, `None` when the deadline passed.
        forced_by: Option<ParticipantId>,
    },
    /// A God Pack's ledger was cleared.
    TestsReset {
        /// The reset pack.
        gp_id: GodPackId,
        /// The moderator who reset it.
        reset_by: ParticipantId,
    },
}

impl NotificationKind {
    /// Short stable name, used as a routing suffix.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StatusChanged(_) => "status_changed",
            Self::FlaggedForRemoval { .. } => "flagged_for_removal",
            Self::AntiCheat(_) => "anticheat",
            Self::GodPackDiscovered { .. } => "gp_discovered",
            Self::TestRecorded { .. } => "test_recorded",
            Self::GodPackResolved { .. } => "gp_resolved",
            Self::GodPackExpiringSoon { .. } => "gp_expiring_soon",
            Self::GodPackExpired { .. } => "gp_expired",
            Self::TestsReset { .. } => "tests_reset",
        }
    }
}

/// A single event handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Notification {
    /// Unique id.
    pub id: EventId,
    /// When the underlying state change happened.
    pub at: DateTime<Utc>,
    /// Payload.
    pub kind: NotificationKind,
}

impl Notification {
    /// Wrap `kind` in a notification stamped at `at`.
    pub fn new(at: DateTime<Utc>, kind: NotificationKind) -> Self {
        Self {
            id: EventId::new(),
            at,
            kind,
        }
    }

    /// The status change carried by this notification, if any.
    pub const fn status_change(&self) -> Option<&StatusChange> {
        match &self.kind {
            NotificationKind::StatusChanged(change) => Some(change),
            _ => None,
        }
    }
}
