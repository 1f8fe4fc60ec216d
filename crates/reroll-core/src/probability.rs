//! Live-probability model for God Pack candidates.
//!
//! Each `NoShow` test is independent evidence that the pack is not live and
//! contributes a likelihood multiplier in `(0, 1]`; the live-probability is
//! the product of those multipliers, accumulated as a sum of logarithms and
//! floored at the smallest positive `f64` so that it never reaches 0 however
//! long the ledger grows. `Miss` tests mark the pack as tested
//! without moving the estimate. Everything here is a pure function of the
//! ledger, so replaying a ledger from empty always reproduces the stored
//! value.

use chrono::{DateTime, Utc};
use reroll_types::{OutcomeCounts, Recommendation, TestOutcome, TestRecord, VerificationStatus};

/// Weight of a `NoShow` relative to a `Miss` when computing confidence.
const NOSHOW_CONFIDENCE_WEIGHT: f64 = 0.7;

/// Weighted tests at which confidence reaches `1 - 1/e`.
const CONFIDENCE_SCALE: f64 = 3.0;

/// Confidence never exceeds this.
const CONFIDENCE_CAP: f64 = 0.95;

/// Likelihood multiplier of one `NoShow` test.
///
/// `m(r) = 1 - (1 - floor) * e^(-r)` for a slots/friends ratio `r`. A tester
/// with few slots for many friends (`r` near 0) had many chances to see the
/// pack, so the multiplier drops towards `floor`; a generous ratio barely
/// moves the estimate. Negative or non-finite ratios are treated as 0.
pub fn noshow_multiplier(ratio: f64, floor: f64) -> f64 {
    let r = if ratio.is_finite() { ratio.max(0.0) } else { 0.0 };
    (1.0 - floor).mul_add(-(-r).exp(), 1.0)
}

/// State derived from replaying a ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// Verification status after the last record.
    pub status: VerificationStatus,
    /// Live-probability, `None` for an empty ledger or a terminal status.
    pub probability: Option<f64>,
    /// Records per outcome.
    pub counts: OutcomeCounts,
    /// Timestamp of the record that resolved the pack.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Replay `ledger` from empty.
///
/// The first terminal record fixes the status; anything after it is
/// counted but cannot change the status.
pub fn replay(ledger: &[TestRecord], floor: f64) -> Replay {
    let mut status = VerificationStatus::Pending;
    let mut log_live: Option<f64> = None;
    let mut counts = OutcomeCounts::default();
    let mut resolved_at = None;

    for record in ledger {
        counts.record(record.outcome);
        if status.is_terminal() {
            continue;
        }
        match record.outcome {
            TestOutcome::Miss => {
                log_live = Some(log_live.unwrap_or(0.0));
            }
            TestOutcome::NoShow => {
                let ratio = record.slots_friends_ratio.unwrap_or(0.0);
                let evidence = noshow_multiplier(ratio, floor).ln();
                log_live = Some(log_live.unwrap_or(0.0) + evidence);
            }
            terminal => {
                if let Some(resolved) = terminal.terminal_status() {
                    status = resolved;
                    resolved_at = Some(record.recorded_at);
                }
            }
        }
    }

    let probability = if status.is_terminal() {
        None
    } else {
        log_live.map(|l| l.exp().max(f64::MIN_POSITIVE))
    };
    Replay {
        status,
        probability,
        counts,
        resolved_at,
    }
}

/// Confidence in the probability estimate, in `[0, 0.95]`.
///
/// Grows with the number of tests with diminishing returns; a `Miss`
/// weighs more than a `NoShow`.
pub fn confidence(counts: &OutcomeCounts) -> f64 {
    let weighted = f64::from(counts.no_show).mul_add(NOSHOW_CONFIDENCE_WEIGHT, f64::from(counts.miss));
    (1.0 - (-weighted / CONFIDENCE_SCALE).exp()).min(CONFIDENCE_CAP)
}

/// Reading of the evidence for humans deciding whether to keep testing.
pub const fn recommend(
    status: VerificationStatus,
    probability: Option<f64>,
    confidence: f64,
) -> Recommendation {
    if status.is_terminal() {
        return Recommendation::Resolved;
    }
    let p = match probability {
        Some(p) => p,
        None => 1.0,
    };
    let c = confidence;
    if c < 0.3 {
        Recommendation::NeedsMoreTests
    } else if p > 0.8 && c > 0.5 {
        Recommendation::LikelyAlive
    } else if p > 0.6 && c > 0.4 {
        Recommendation::PossiblyAlive
    } else if p > 0.3 && c > 0.5 {
        Recommendation::Uncertain
    } else if p < 0.3 && c > 0.6 {
        Recommendation::LikelyDead
    } else {
        Recommendation::Inconclusive
    }
}
