//! Statistics aggregator.
//!
//! Turns the current roster and God Pack set into one [`TimelineSnapshot`]
//! per aggregation bucket, and re-buckets stored snapshots into coarser
//! windows for trend queries. Status counts are gauges (the coarse bucket
//! keeps the last value); per-bucket pack, GP and transition counts are
//! summed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use reroll_types::{GodPack, Participant, StatusCounts, TimelineSnapshot, VerificationCounts};

use crate::clock::{self, ClockError};

/// Count of status transitions since the last snapshot.
///
/// Fed by every emitted status change and drained when a snapshot is
/// written.
#[derive(Debug, Default)]
pub struct TransitionTally {
    count: AtomicU64,
}

impl TransitionTally {
    /// Create an empty tally.
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    /// Count one transition.
    pub fn record(&self) {
        self.add(1);
    }

    /// Put `n` transitions back, e.g. when a snapshot write was a duplicate.
    pub fn add(&self, n: u64) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_add(n)));
    }

    /// Take the current count and reset to zero.
    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::AcqRel)
    }

    /// Current count.
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

/// Build the snapshot for `bucket_start`.
///
/// `previous` is the newest snapshot before this bucket; per-bucket counts
/// are differences against its lifetime totals. Without one, the whole
/// history so far is attributed to this bucket.
pub fn build_snapshot(
    bucket_start: DateTime<Utc>,
    participants: &[Participant],
    god_packs: &[GodPack],
    previous: Option<&TimelineSnapshot>,
    transitions: u64,
) -> TimelineSnapshot {
    let mut statuses = StatusCounts::default();
    let mut total_packs: u64 = 0;
    let mut total_gps: u64 = 0;
    for p in participants {
        statuses.record(p.status);
        if p.flagged_for_removal {
            statuses.flagged_for_removal = statuses.flagged_for_removal.saturating_add(1);
        }
        total_packs = total_packs.saturating_add(p.packs_opened);
        total_gps = total_gps.saturating_add(p.gps_found);
    }

    let mut verification = VerificationCounts::default();
    for gp in god_packs {
        verification.record(gp.status);
    }

    let (prev_packs, prev_gps) =
        previous.map_or((0, 0), |s| (s.total_packs_opened, s.total_gps_found));

    TimelineSnapshot {
        bucket_start,
        participants: statuses,
        god_packs: verification,
        total_packs_opened: total_packs,
        packs_in_bucket: total_packs.saturating_sub(prev_packs),
        total_gps_found: total_gps,
        gps_in_bucket: total_gps.saturating_sub(prev_gps),
        transitions_in_bucket: transitions,
    }
}

/// Merge `snapshots` (ordered oldest first) into buckets of
/// `bucket_secs`.
///
/// # Errors
///
/// Returns [`ClockError::InvalidConfig`] for a zero bucket size.
pub fn rebucket(snapshots: &[TimelineSnapshot], bucket_secs: u64) -> Result<Vec<TimelineSnapshot>, ClockError> {
    let mut merged: BTreeMap<DateTime<Utc>, TimelineSnapshot> = BTreeMap::new();
    for snapshot in snapshots {
        let start = clock::bucket_start(snapshot.bucket_start, bucket_secs)?;
        match merged.get_mut(&start) {
            None => {
                merged.insert(
                    start,
                    TimelineSnapshot {
                        bucket_start: start,
                        ..snapshot.clone()
                    },
                );
            }
            Some(acc) => {
                acc.participants = snapshot.participants;
                acc.god_packs = snapshot.god_packs;
                acc.total_packs_opened = snapshot.total_packs_opened;
                acc.total_gps_found = snapshot.total_gps_found;
                acc.packs_in_bucket = acc.packs_in_bucket.saturating_add(snapshot.packs_in_bucket);
                acc.gps_in_bucket = acc.gps_in_bucket.saturating_add(snapshot.gps_in_bucket);
                acc.transitions_in_bucket = acc
                    .transitions_in_bucket
                    .saturating_add(snapshot.transitions_in_bucket);
            }
        }
    }
    Ok(merged.into_values().collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reroll_types::{GodPackId, ParticipantId, ParticipantStatus, VerificationStatus};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn participant(id: u64, status: ParticipantStatus, packs: u64, gps: u64) -> Participant {
        let mut p = Participant::new(ParticipantId::new(id), at(0));
        p.status = status;
        p.packs_opened = packs;
        p.gps_found = gps;
        p
    }

    fn snapshot(secs: i64, active: u32, packs_in_bucket: u64, total: u64) -> TimelineSnapshot {
        let mut s = TimelineSnapshot::empty(at(secs));
        s.participants.active = active;
        s.packs_in_bucket = packs_in_bucket;
        s.total_packs_opened = total;
        s.transitions_in_bucket = 1;
        s
    }

    #[test]
    fn snapshot_counts_roster() {
        let mut flagged = participant(3, ParticipantStatus::Inactive, 5, 0);
        flagged.flagged_for_removal = true;
        let roster = vec![
            participant(1, ParticipantStatus::Active, 100, 1),
            participant(2, ParticipantStatus::Farm, 50, 2),
            flagged,
        ];
        let mut verified = GodPack::discovered(GodPackId::new(1), ParticipantId::new(1), at(0), 1);
        verified.status = VerificationStatus::Verified;
        let gps = vec![
            verified,
            GodPack::discovered(GodPackId::new(2), ParticipantId::new(2), at(0), 1),
        ];

        let s = build_snapshot(at(600), &roster, &gps, None, 4);
        assert_eq!(s.participants.active, 1);
        assert_eq!(s.participants.farm, 1);
        assert_eq!(s.participants.inactive, 1);
        assert_eq!(s.participants.flagged_for_removal, 1);
        assert_eq!(s.god_packs.verified, 1);
        assert_eq!(s.god_packs.pending, 1);
        assert_eq!(s.total_packs_opened, 155);
        assert_eq!(s.packs_in_bucket, 155);
        assert_eq!(s.total_gps_found, 3);
        assert_eq!(s.transitions_in_bucket, 4);
    }

    #[test]
    fn bucket_counts_are_deltas() {
        let prev = snapshot(0, 0, 0, 100);
        let roster = vec![participant(1, ParticipantStatus::Active, 130, 0)];
        let s = build_snapshot(at(300), &roster, &[], Some(&prev), 0);
        assert_eq!(s.packs_in_bucket, 30);
    }

    #[test]
    fn rebucket_sums_counters_and_keeps_last_gauges() {
        let series = vec![
            snapshot(0, 1, 10, 10),
            snapshot(300, 3, 20, 30),
            snapshot(600, 2, 5, 35),
            snapshot(900, 4, 7, 42),
        ];
        let merged = rebucket(&series, 600).unwrap();
        assert_eq!(merged.len(), 2);

        let first = merged.first().unwrap();
        assert_eq!(first.bucket_start, at(0));
        assert_eq!(first.participants.active, 3);
        assert_eq!(first.packs_in_bucket, 30);
        assert_eq!(first.total_packs_opened, 30);
        assert_eq!(first.transitions_in_bucket, 2);

        let second = merged.last().unwrap();
        assert_eq!(second.bucket_start, at(600));
        assert_eq!(second.participants.active, 4);
        assert_eq!(second.packs_in_bucket, 12);
    }

    #[test]
    fn rebucket_at_native_size_is_identity() {
        let series = vec![snapshot(0, 1, 10, 10), snapshot(300, 2, 5, 15)];
        assert_eq!(rebucket(&series, 300).unwrap(), series);
    }

    #[test]
    fn tally_drains() {
        let tally = TransitionTally::new();
        tally.record();
        tally.record();
        assert_eq!(tally.take(), 2);
        assert_eq!(tally.get(), 0);
        tally.add(3);
        assert_eq!(tally.get(), 3);
    }
}
