//! God Pack expiry.
//!
//! Each pack gets a deadline at discovery: `lifetime_days` after the first
//! daily reset that follows it. The scheduler warns once per deadline as
//! it approaches, then expires a pack that is still pending. An expired
//! pack is `Dead` with `expired_at` set, and its ledger is frozen like any
//! other terminal pack.

use chrono::{DateTime, Days, NaiveTime, TimeDelta, Utc};
use reroll_types::{GodPack, VerificationStatus};

use crate::config::ExpirationConfig;
use crate::error::{EngineError, ValidationError};

/// What one expiry check of one pack did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCheck {
    /// Nothing to do.
    Quiet,
    /// The deadline is inside the warning window; warn once.
    ExpiringSoon {
        /// The approaching deadline.
        expires_at: DateTime<Utc>,
    },
    /// The deadline passed and the pack is now `Dead`.
    Expired {
        /// The deadline that passed.
        expires_at: DateTime<Utc>,
    },
}

impl ExpiryCheck {
    /// Whether the check changed the pack.
    pub const fn is_quiet(&self) -> bool {
        matches!(self, Self::Quiet)
    }
}

/// Deadline of a pack discovered at `discovered_at`.
///
/// `None` only if the deadline falls outside chrono's range.
pub fn deadline(discovered_at: DateTime<Utc>, config: &ExpirationConfig) -> Option<DateTime<Utc>> {
    let reset_time = NaiveTime::from_hms_opt(config.reset_hour_utc, 0, 0)?;
    let reset_today = discovered_at.date_naive().and_time(reset_time).and_utc();
    let next_reset = if discovered_at < reset_today {
        reset_today
    } else {
        reset_today.checked_add_days(Days::new(1))?
    };
    next_reset.checked_add_days(Days::new(u64::from(config.lifetime_days)))
}

/// Check `gp` against its deadline at `now`.
///
/// Terminal packs and packs without a deadline are left alone.
pub fn check(gp: &mut GodPack, now: DateTime<Utc>, warning_window_secs: u64) -> ExpiryCheck {
    if gp.status.is_terminal() {
        return ExpiryCheck::Quiet;
    }
    let Some(expires_at) = gp.expires_at else {
        return ExpiryCheck::Quiet;
    };

    if now >= expires_at {
        expire(gp, now);
        return ExpiryCheck::Expired { expires_at };
    }

    let remaining = expires_at.signed_duration_since(now).num_seconds();
    let in_window = u64::try_from(remaining).is_ok_and(|r| r <= warning_window_secs);
    if in_window && !gp.expiry_warned {
        gp.expiry_warned = true;
        return ExpiryCheck::ExpiringSoon { expires_at };
    }
    ExpiryCheck::Quiet
}

/// Expire a pending pack immediately.
///
/// # Errors
///
/// Returns [`EngineError::TerminalConflict`] if the pack already has a
/// final status. `gp` is untouched on error.
pub fn force_expire(gp: &mut GodPack, now: DateTime<Utc>) -> Result<(), EngineError> {
    if gp.status.is_terminal() {
        return Err(EngineError::TerminalConflict {
            gp_id: gp.id,
            status: gp.status,
        });
    }
    expire(gp, now);
    Ok(())
}

/// Move a pack's deadline by `hours` (negative shortens it).
///
/// A pack stored without a deadline is extended from the one its
/// discovery time implies. Moving the deadline re-arms the warning.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidExtension`] for zero hours or a
/// deadline out of range. `gp` is untouched on error.
pub fn extend(gp: &mut GodPack, hours: i64, config: &ExpirationConfig) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = || ValidationError::InvalidExtension { hours };
    if hours == 0 {
        return Err(invalid());
    }
    let base = gp
        .expires_at
        .or_else(|| deadline(gp.discovered_at, config))
        .ok_or_else(invalid)?;
    let delta = TimeDelta::try_hours(hours).ok_or_else(invalid)?;
    let moved = base.checked_add_signed(delta).ok_or_else(invalid)?;
    gp.expires_at = Some(moved);
    gp.expiry_warned = false;
    Ok(moved)
}

fn expire(gp: &mut GodPack, now: DateTime<Utc>) {
    gp.status = VerificationStatus::Dead;
    gp.probability = None;
    gp.resolved_at = Some(now);
    gp.expired_at = Some(now);
}
