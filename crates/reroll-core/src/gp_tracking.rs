//! God Pack test tracking.
//!
//! The ledger is append-only between resets. After every append the
//! status and probability are re-derived by replaying the ledger, so the
//! stored values always equal what [`summary`] would compute from scratch.
//! The one status not carried by the ledger is expiry, recorded in
//! `expired_at` by [`crate::expiration`].

use chrono::{DateTime, Utc};
use reroll_types::{GodPack, ParticipantId, TestOutcome, TestRecord, TestSummary, VerificationStatus};
use serde::Serialize;

use crate::error::{EngineError, ValidationError};
use crate::probability;

/// Result of appending one test record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestAccepted {
    /// Live-probability after the append.
    pub probability: Option<f64>,
    /// Terminal status, if this record resolved the pack.
    pub resolved: Option<VerificationStatus>,
}

/// Check a ratio supplied with a test.
///
/// # Errors
///
/// Returns [`ValidationError::MissingRatio`] for a `NoShow` without a
/// ratio and [`ValidationError::InvalidRatio`] for a negative or
/// non-finite one.
pub fn validate_ratio(outcome: TestOutcome, ratio: Option<f64>) -> Result<(), ValidationError> {
    match ratio {
        None if outcome.requires_ratio() => Err(ValidationError::MissingRatio),
        Some(r) if !r.is_finite() || r < 0.0 => Err(ValidationError::InvalidRatio { ratio: r }),
        _ => Ok(()),
    }
}

/// Append a test to `gp`'s ledger and re-derive its state.
///
/// # Errors
///
/// Returns [`EngineError::TerminalConflict`] if `gp` already has a final
/// status, or [`EngineError::Validation`] for a missing or invalid ratio.
/// `gp` is untouched on error.
pub fn record_test(gp: &mut GodPack, record: TestRecord, noshow_floor: f64) -> Result<TestAccepted, EngineError> {
    if gp.status.is_terminal() {
        return Err(EngineError::TerminalConflict {
            gp_id: gp.id,
            status: gp.status,
        });
    }
    validate_ratio(record.outcome, record.slots_friends_ratio)?;

    gp.ledger.push(record);
    let replayed = probability::replay(&gp.ledger, noshow_floor);
    let resolved = replayed.status.is_terminal().then_some(replayed.status);
    gp.status = replayed.status;
    gp.probability = replayed.probability;
    gp.resolved_at = replayed.resolved_at;

    Ok(TestAccepted {
        probability: gp.probability,
        resolved,
    })
}

/// Build a test record.
pub const fn test_record(
    tester: ParticipantId,
    outcome: TestOutcome,
    slots_friends_ratio: Option<f64>,
    at: DateTime<Utc>,
) -> TestRecord {
    TestRecord {
        tester,
        outcome,
        recorded_at: at,
        slots_friends_ratio,
    }
}

/// Clear `gp`'s ledger and return it to `Pending`.
///
/// Returns the number of records discarded.
pub fn reset(gp: &mut GodPack) -> usize {
    let cleared = gp.ledger.len();
    gp.ledger.clear();
    gp.status = VerificationStatus::Pending;
    gp.probability = None;
    gp.resolved_at = None;
    gp.expired_at = None;
    gp.expiry_warned = false;
    gp.reset_count = gp.reset_count.saturating_add(1);
    cleared
}

/// Summarize `gp` by replaying its ledger from empty.
///
/// An expired pack reports `Dead` whatever its ledger says.
pub fn summary(gp: &GodPack, noshow_floor: f64) -> TestSummary {
    let replayed = probability::replay(&gp.ledger, noshow_floor);
    let (status, live) = if gp.expired_at.is_some() {
        (VerificationStatus::Dead, None)
    } else {
        (replayed.status, replayed.probability)
    };
    let confidence = probability::confidence(&replayed.counts);
    TestSummary {
        gp_id: gp.id,
        status,
        probability: live,
        confidence,
        recommendation: probability::recommend(status, live, confidence),
        counts: replayed.counts,
        ledger: gp.ledger.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reroll_types::{GodPackId, Recommendation};

    use super::*;

    const FLOOR: f64 = 0.1;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn gp() -> GodPack {
        GodPack::discovered(GodPackId::new(1), ParticipantId::new(100), at(0), 2)
    }

    fn tester(n: u64) -> ParticipantId {
        ParticipantId::new(n)
    }

    #[test]
    fn noshow_needs_a_ratio() {
        let mut g = gp();
        let err = record_test(&mut g, test_record(tester(1), TestOutcome::NoShow, None, at(1)), FLOOR)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::MissingRatio)));
        assert!(g.ledger.is_empty());
    }

    #[test]
    fn invalid_ratio_rejected() {
        for bad in [-0.5, f64::INFINITY, f64::NAN] {
            assert!(validate_ratio(TestOutcome::NoShow, Some(bad)).is_err());
        }
        assert!(validate_ratio(TestOutcome::Miss, None).is_ok());
    }

    #[test]
    fn verification_scenario() {
        let mut g = gp();
        let a = record_test(&mut g, test_record(tester(1), TestOutcome::NoShow, Some(0.5), at(1)), FLOOR)
            .unwrap();
        let b = record_test(&mut g, test_record(tester(2), TestOutcome::NoShow, Some(0.5), at(2)), FLOOR)
            .unwrap();
        assert!(b.probability.unwrap() < a.probability.unwrap());

        let c = record_test(&mut g, test_record(tester(3), TestOutcome::Verified, None, at(3)), FLOOR)
            .unwrap();
        assert_eq!(c.resolved, Some(VerificationStatus::Verified));
        assert_eq!(g.status, VerificationStatus::Verified);
        assert!(g.probability.is_none());
        assert_eq!(g.resolved_at, Some(at(3)));

        let err = record_test(&mut g, test_record(tester(4), TestOutcome::Miss, None, at(4)), FLOOR)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TerminalConflict {
                status: VerificationStatus::Verified,
                ..
            }
        ));
        assert_eq!(g.ledger.len(), 3);
    }

    #[test]
    fn stored_state_matches_replay() {
        let mut g = gp();
        for (i, ratio) in [0.2, 1.5, 0.7].into_iter().enumerate() {
            let n = u64::try_from(i).unwrap();
            record_test(&mut g, test_record(tester(n), TestOutcome::NoShow, Some(ratio), at(10)), FLOOR)
                .unwrap();
        }
        record_test(&mut g, test_record(tester(9), TestOutcome::Miss, None, at(11)), FLOOR).unwrap();

        let s = summary(&g, FLOOR);
        assert_eq!(s.status, g.status);
        assert_eq!(s.probability, g.probability);
        assert_eq!(s.counts.no_show, 3);
        assert_eq!(s.counts.miss, 1);
        assert_eq!(s.ledger.len(), 4);
    }

    #[test]
    fn reset_reopens_terminal_pack() {
        let mut g = gp();
        record_test(&mut g, test_record(tester(1), TestOutcome::Dead, None, at(1)), FLOOR).unwrap();
        assert_eq!(reset(&mut g), 1);
        assert_eq!(g.status, VerificationStatus::Pending);
        assert!(g.probability.is_none());
        assert!(g.is_untested());
        assert_eq!(g.reset_count, 1);
        assert!(record_test(&mut g, test_record(tester(2), TestOutcome::Miss, None, at(2)), FLOOR).is_ok());
    }

    #[test]
    fn summary_of_terminal_pack_is_resolved() {
        let mut g = gp();
        record_test(&mut g, test_record(tester(1), TestOutcome::Liked, None, at(1)), FLOOR).unwrap();
        let s = summary(&g, FLOOR);
        assert_eq!(s.status, VerificationStatus::Liked);
        assert_eq!(s.recommendation, Recommendation::Resolved);
    }
}
