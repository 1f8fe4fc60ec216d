//! Core entity structs: participants, God Packs, test records, and timeline
//! snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{
    InstanceKind, ParticipantStatus, Privilege, Recommendation, TestOutcome, VerificationStatus,
};
use crate::ids::{GodPackId, ParticipantId};

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Configuration an instance declared in its most recent heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct InstanceConfig {
    /// Packs the instance is set to roll (e.g. `Mewtwo`, `Palkia`).
    pub pack_selection: Vec<String>,
    /// Rolling mode reported by the instance, if any.
    pub rolling_mode: Option<String>,
    /// Average packs per minute the instance claims to achieve.
    pub average_throughput: Option<f64>,
}

/// One running client under a participant's account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Instance {
    /// Name reported in the heartbeat (`Main`, `1`, `2`, ...).
    pub name: String,
    /// Main or secondary, derived from the name.
    pub kind: InstanceKind,
    /// Timestamp of the most recent accepted heartbeat.
    pub last_seen: DateTime<Utc>,
    /// Sub-instances the report listed as online.
    pub online_instances: Vec<String>,
    /// Sub-instances the report listed as offline.
    pub offline_instances: Vec<String>,
    /// Whether the main account was running alongside.
    pub main_on: bool,
    /// Last reported configuration.
    pub config: InstanceConfig,
    /// Packs opened through this instance, lifetime.
    pub packs_opened: u64,
}

/// A continuous stretch of activity, started by a promotion to an active
/// status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Session {
    /// When the participant last became active.
    pub started_at: DateTime<Utc>,
    /// Packs opened since `started_at`.
    pub packs_opened: u64,
}

impl Session {
    /// Start a fresh session at `at`.
    pub const fn starting_at(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            packs_opened: 0,
        }
    }

    /// Average packs per minute over the session up to `now`.
    ///
    /// Returns 0.0 for sessions shorter than a minute.
    #[allow(clippy::cast_precision_loss)]
    pub fn packs_per_minute(&self, now: DateTime<Utc>) -> f64 {
        let minutes = now.signed_duration_since(self.started_at).num_minutes();
        if minutes <= 0 {
            return 0.0;
        }
        self.packs_opened as f64 / minutes as f64
    }
}

/// A community member hunting God Packs.
///
/// Participants are never hard-deleted: silent ones are demoted to
/// `Inactive` and, after a longer silence, flagged for removal while their
/// history is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Participant {
    /// Stable external account id.
    pub id: ParticipantId,
    /// Linked in-game friend id.
    pub linked_game_id: Option<String>,
    /// Prefix the participant's in-game names start with.
    pub display_prefix: Option<String>,
    /// Display name, for notifications.
    pub display_name: Option<String>,
    /// Average number of instances the participant says they run.
    pub declared_average_instances: Option<u32>,
    /// Current activity status.
    pub status: ParticipantStatus,
    /// Instance roster keyed by instance name.
    pub instances: BTreeMap<String, Instance>,
    /// Packs opened, lifetime.
    pub packs_opened: u64,
    /// God Packs found, lifetime.
    pub gps_found: u64,
    /// Current activity session, if active.
    pub session: Option<Session>,
    /// Last heartbeat or explicit activation.
    pub last_active_at: Option<DateTime<Utc>>,
    /// Set by the auto-kick sweep. Flagged participants are excluded from
    /// active counts and GP eligibility.
    pub flagged_for_removal: bool,
    /// When the participant was first observed.
    pub created_at: DateTime<Utc>,
}

impl Participant {
    /// Create an inactive participant with an empty roster.
    pub const fn new(id: ParticipantId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            linked_game_id: None,
            display_prefix: None,
            display_name: None,
            declared_average_instances: None,
            status: ParticipantStatus::Inactive,
            instances: BTreeMap::new(),
            packs_opened: 0,
            gps_found: 0,
            session: None,
            last_active_at: None,
            flagged_for_removal: false,
            created_at,
        }
    }

    /// Most recent heartbeat across all instances.
    pub fn latest_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.instances.values().map(|i| i.last_seen).max()
    }

    /// Point from which silence is measured: the later of the latest
    /// heartbeat and the last explicit activation.
    pub fn silence_reference(&self) -> Option<DateTime<Utc>> {
        match (self.latest_heartbeat(), self.last_active_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether any instance in the roster is the main account.
    pub fn has_main_instance(&self) -> bool {
        self.instances
            .values()
            .any(|i| i.kind == InstanceKind::Main)
    }

    /// Whether the participant counts towards active rosters.
    pub const fn is_eligible(&self) -> bool {
        self.status.is_active() && !self.flagged_for_removal
    }
}

/// Identity and privilege of whoever issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Caller {
    /// The caller's account id.
    pub id: ParticipantId,
    /// The caller's privilege level.
    pub privilege: Privilege,
}

impl Caller {
    /// A regular member.
    pub const fn member(id: ParticipantId) -> Self {
        Self {
            id,
            privilege: Privilege::Member,
        }
    }

    /// A privileged moderator.
    pub const fn admin(id: ParticipantId) -> Self {
        Self {
            id,
            privilege: Privilege::Admin,
        }
    }

    /// Whether the caller holds admin privilege.
    pub fn is_admin(&self) -> bool {
        self.privilege >= Privilege::Admin
    }
}

// ---------------------------------------------------------------------------
// God Pack
// ---------------------------------------------------------------------------

/// One entry in a God Pack's append-only test ledger. Immutable once
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TestRecord {
    /// Who ran the test.
    pub tester: ParticipantId,
    /// What they observed.
    pub outcome: TestOutcome,
    /// When the test was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Slots offered divided by friends available, required for `NoShow`.
    pub slots_friends_ratio: Option<f64>,
}

/// A discovered candidate God Pack awaiting verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GodPack {
    /// Candidate id derived from the discovery event.
    pub id: GodPackId,
    /// When the pack was found.
    pub discovered_at: DateTime<Utc>,
    /// Who found it.
    pub discovered_by: ParticipantId,
    /// Number of packs in the discovery (1-5).
    pub pack_count: u8,
    /// Verification status.
    pub status: VerificationStatus,
    /// Append-only test ledger.
    pub ledger: Vec<TestRecord>,
    /// Live-probability derived from the ledger. `None` when undefined.
    pub probability: Option<f64>,
    /// When a terminal status was reached.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Number of times the ledger was reset.
    pub reset_count: u32,
    /// Deadline after which a pending pack is expired.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the expiring-soon warning went out for the current deadline.
    #[serde(default)]
    pub expiry_warned: bool,
    /// Set when the pack went `Dead` by expiring rather than by a test.
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
}

impl GodPack {
    /// Create a pending pack with an empty ledger.
    pub const fn discovered(
        id: GodPackId,
        discovered_by: ParticipantId,
        discovered_at: DateTime<Utc>,
        pack_count: u8,
    ) -> Self {
        Self {
            id,
            discovered_at,
            discovered_by,
            pack_count,
            status: VerificationStatus::Pending,
            ledger: Vec::new(),
            probability: None,
            resolved_at: None,
            reset_count: 0,
            expires_at: None,
            expiry_warned: false,
            expired_at: None,
        }
    }

    /// Set the expiry deadline.
    #[must_use]
    pub const fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether nobody has tested the pack yet.
    pub fn is_untested(&self) -> bool {
        self.status == VerificationStatus::Pending && self.ledger.is_empty()
    }
}

/// Number of ledger entries per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct OutcomeCounts {
    /// `Miss` records.
    pub miss: u32,
    /// `NoShow` records.
    pub no_show: u32,
    /// `Verified` records.
    pub verified: u32,
    /// `Liked` records.
    pub liked: u32,
    /// `NotLiked` records.
    pub not_liked: u32,
    /// `Dead` records.
    pub dead: u32,
}

impl OutcomeCounts {
    /// Count one record of `outcome`.
    pub const fn record(&mut self, outcome: TestOutcome) {
        let slot = match outcome {
            TestOutcome::Miss => &mut self.miss,
            TestOutcome::NoShow => &mut self.no_show,
            TestOutcome::Verified => &mut self.verified,
            TestOutcome::Liked => &mut self.liked,
            TestOutcome::NotLiked => &mut self.not_liked,
            TestOutcome::Dead => &mut self.dead,
        };
        *slot = slot.saturating_add(1);
    }
}

/// Result of the `testSummary` query. Reproducible from the ledger alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TestSummary {
    /// The pack summarised.
    pub gp_id: GodPackId,
    /// Current verification status.
    pub status: VerificationStatus,
    /// Live-probability, `None` when undefined or terminal.
    pub probability: Option<f64>,
    /// Confidence in the probability, 0.0 to 0.95.
    pub confidence: f64,
    /// Reading of the evidence.
    pub recommendation: Recommendation,
    /// Ledger entries per outcome.
    pub counts: OutcomeCounts,
    /// The full ledger, in append order.
    pub ledger: Vec<TestRecord>,
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Participants per status at a bucket boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StatusCounts {
    /// `Active` participants.
    pub active: u32,
    /// `Inactive` participants (flagged ones included).
    pub inactive: u32,
    /// `Farm` participants.
    pub farm: u32,
    /// `Leech` participants.
    pub leech: u32,
    /// Participants flagged for removal.
    pub flagged_for_removal: u32,
}

impl StatusCounts {
    /// Count a participant with the given status.
    pub const fn record(&mut self, status: ParticipantStatus) {
        let slot = match status {
            ParticipantStatus::Active => &mut self.active,
            ParticipantStatus::Inactive => &mut self.inactive,
            ParticipantStatus::Farm => &mut self.farm,
            ParticipantStatus::Leech => &mut self.leech,
        };
        *slot = slot.saturating_add(1);
    }

    /// Number of participants with `status`.
    pub const fn get(&self, status: ParticipantStatus) -> u32 {
        match status {
            ParticipantStatus::Active => self.active,
            ParticipantStatus::Inactive => self.inactive,
            ParticipantStatus::Farm => self.farm,
            ParticipantStatus::Leech => self.leech,
        }
    }
}

/// God Packs per verification status at a bucket boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct VerificationCounts {
    /// `Pending` packs.
    pub pending: u32,
    /// `Verified` packs.
    pub verified: u32,
    /// `Dead` packs.
    pub dead: u32,
    /// `Liked` packs.
    pub liked: u32,
    /// `NotLiked` packs.
    pub not_liked: u32,
}

impl VerificationCounts {
    /// Count a pack with the given status.
    pub const fn record(&mut self, status: VerificationStatus) {
        let slot = match status {
            VerificationStatus::Pending => &mut self.pending,
            VerificationStatus::Verified => &mut self.verified,
            VerificationStatus::Dead => &mut self.dead,
            VerificationStatus::Liked => &mut self.liked,
            VerificationStatus::NotLiked => &mut self.not_liked,
        };
        *slot = slot.saturating_add(1);
    }
}

/// One point of the activity timeline, keyed by its bucket start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TimelineSnapshot {
    /// Bucket boundary this snapshot was taken at.
    pub bucket_start: DateTime<Utc>,
    /// Participants per status.
    pub participants: StatusCounts,
    /// God Packs per verification status.
    pub god_packs: VerificationCounts,
    /// Packs opened by all participants, lifetime.
    pub total_packs_opened: u64,
    /// Packs opened since the previous snapshot.
    pub packs_in_bucket: u64,
    /// God Packs found by all participants, lifetime.
    pub total_gps_found: u64,
    /// God Packs found since the previous snapshot.
    pub gps_in_bucket: u64,
    /// Participant status transitions since the previous snapshot.
    pub transitions_in_bucket: u64,
}

impl TimelineSnapshot {
    /// A snapshot of an empty roster at `bucket_start`.
    pub fn empty(bucket_start: DateTime<Utc>) -> Self {
        Self {
            bucket_start,
            participants: StatusCounts::default(),
            god_packs: VerificationCounts::default(),
            total_packs_opened: 0,
            packs_in_bucket: 0,
            total_gps_found: 0,
            gps_in_bucket: 0,
            transitions_in_bucket: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Participant listing helpers
// ---------------------------------------------------------------------------

/// Participants grouped by status, as returned by roster listings.
pub type RosterByStatus = BTreeMap<ParticipantStatus, Vec<ParticipantId>>;
