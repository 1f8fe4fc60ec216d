//! Enumeration types for participants, God Packs, and test evidence.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Participant status
// ---------------------------------------------------------------------------

/// Activity status of a participant. Exactly one holds at any time.
///
/// `Farm` and `Leech` are informational classifications layered on top of
/// activity: both count as active and are both subject to staleness
/// demotion to `Inactive`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS,
)]
#[ts(export, export_to = "bindings/")]
pub enum ParticipantStatus {
    /// Rolling with a main instance and testing capacity.
    Active,
    /// Not rolling. New participants start here.
    #[default]
    Inactive,
    /// Rolling with secondary instances only (no main).
    Farm,
    /// Rolling with a main instance only (no testing capacity).
    Leech,
}

impl ParticipantStatus {
    /// All statuses, in display order.
    pub const ALL: [Self; 4] = [Self::Active, Self::Inactive, Self::Farm, Self::Leech];

    /// Whether the status counts as active (anything but `Inactive`).
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Inactive)
    }

    /// Lowercase name, matching the command that sets it.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Farm => "farm",
            Self::Leech => "leech",
        }
    }
}

impl core::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What drove a participant status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum TransitionCause {
    /// An explicit `/active`, `/inactive`, `/farm` or `/leech` command.
    Command,
    /// An accepted heartbeat promoted an inactive participant.
    Heartbeat,
    /// The staleness sweep demoted a silent participant.
    Sweep,
}

/// Privilege level attached to a command caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum Privilege {
    /// Regular community member.
    Member,
    /// Moderator allowed to run privileged commands.
    Admin,
}

/// Role of an instance within a participant's roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum InstanceKind {
    /// The participant's main account, used for testing packs.
    Main,
    /// A secondary rolling instance.
    Secondary,
}

impl InstanceKind {
    /// Classify an instance by its reported name. `Main` (any case) is the
    /// main instance; every other name is secondary.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("main") {
            Self::Main
        } else {
            Self::Secondary
        }
    }
}

// ---------------------------------------------------------------------------
// God Pack verification
// ---------------------------------------------------------------------------

/// Verification status of a God Pack candidate.
///
/// Everything except `Pending` is terminal: once reached, the test ledger
/// is frozen until an explicit reset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS,
)]
#[ts(export, export_to = "bindings/")]
pub enum VerificationStatus {
    /// Still accumulating test evidence.
    #[default]
    Pending,
    /// Confirmed live.
    Verified,
    /// Confirmed gone.
    Dead,
    /// Live and wanted by the community.
    Liked,
    /// Live but not wanted.
    NotLiked,
}

impl VerificationStatus {
    /// All statuses, in display order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Verified,
        Self::Dead,
        Self::Liked,
        Self::NotLiked,
    ];

    /// Whether the status freezes the test ledger.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Outcome reported by a tester for a God Pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum TestOutcome {
    /// The tester looked and the pack was not there. Marks the pack as tested.
    Miss,
    /// The tester had open slots and the pack never showed up. Requires the
    /// tester's slots/friends ratio.
    NoShow,
    /// The pack is confirmed live.
    Verified,
    /// The pack is live and liked.
    Liked,
    /// The pack is live but not liked.
    NotLiked,
    /// The pack is confirmed dead.
    Dead,
}

impl TestOutcome {
    /// The verification status this outcome resolves to, if it is terminal.
    pub const fn terminal_status(self) -> Option<VerificationStatus> {
        match self {
            Self::Miss | Self::NoShow => None,
            Self::Verified => Some(VerificationStatus::Verified),
            Self::Liked => Some(VerificationStatus::Liked),
            Self::NotLiked => Some(VerificationStatus::NotLiked),
            Self::Dead => Some(VerificationStatus::Dead),
        }
    }

    /// Whether the outcome requires a slots/friends ratio.
    pub const fn requires_ratio(self) -> bool {
        matches!(self, Self::NoShow)
    }
}

/// Human-facing reading of a God Pack's test evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum Recommendation {
    /// Too little evidence to say anything.
    NeedsMoreTests,
    /// High probability backed by high confidence.
    LikelyAlive,
    /// Reasonable probability with moderate confidence.
    PossiblyAlive,
    /// Middling probability; more testing advised.
    Uncertain,
    /// Low probability backed by high confidence.
    LikelyDead,
    /// None of the above thresholds apply.
    Inconclusive,
    /// The pack already reached a terminal status.
    Resolved,
}

// ---------------------------------------------------------------------------
// Anti-cheat
// ---------------------------------------------------------------------------

/// Plausibility rule broken by a heartbeat report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum AntiCheatRule {
    /// Packs opened per minute since the previous report exceed the limit.
    ThroughputExceeded,
    /// The throughput declared in the instance configuration exceeds the limit.
    DeclaredThroughputExceeded,
    /// More instances online than the declared average plus tolerance.
    InstanceCountExceeded,
    /// Reports arrive faster than the minimum report interval.
    ReportTooFrequent,
}
