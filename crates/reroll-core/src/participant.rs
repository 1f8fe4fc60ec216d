//! Participant state machine.
//!
//! Four mutually exclusive statuses. Explicit commands may set any of them;
//! heartbeats only promote `Inactive` to `Active`; the staleness sweep only
//! demotes to `Inactive`. `Farm` and `Leech` describe instance composition
//! and decay like `Active`.
//!
//! Functions here mutate a participant in place and never suspend. The
//! engine runs them on a private copy and writes the copy back only on
//! success.

use chrono::{DateTime, Utc};
use reroll_types::{Caller, Participant, ParticipantStatus, Session, StatusChange, TransitionCause};

use crate::config::PermissionsConfig;
use crate::error::{EngineError, ValidationError};

/// Move `participant` to `to`.
///
/// Returns the status change, or `None` if the status did not change.
/// Entering a non-inactive status from `Inactive` opens a new session and
/// clears the removal flag. An explicit command to a non-inactive status
/// also refreshes the silence reference, even when the status is unchanged.
pub fn transition(
    participant: &mut Participant,
    to: ParticipantStatus,
    cause: TransitionCause,
    at: DateTime<Utc>,
) -> Option<StatusChange> {
    let from = participant.status;

    if to.is_active() {
        participant.flagged_for_removal = false;
        if cause == TransitionCause::Command || !from.is_active() {
            participant.last_active_at = Some(
                participant
                    .last_active_at
                    .map_or(at, |prev| prev.max(at)),
            );
        }
        if !from.is_active() {
            participant.session = Some(Session::starting_at(at));
        }
    } else if from.is_active() {
        participant.session = None;
    }

    if from == to {
        return None;
    }
    participant.status = to;
    Some(StatusChange {
        participant_id: participant.id,
        from,
        to,
        cause,
        at,
    })
}

/// Promote an inactive participant on heartbeat arrival.
///
/// Any other status is left alone.
pub fn promote_on_heartbeat(participant: &mut Participant, at: DateTime<Utc>) -> Option<StatusChange> {
    if participant.status == ParticipantStatus::Inactive {
        transition(participant, ParticipantStatus::Active, TransitionCause::Heartbeat, at)
    } else {
        None
    }
}

/// Check `caller` may set `target`'s status to `to`.
///
/// Participants may always change their own status. Admins may change
/// anyone's. Members changing someone else need the matching permission
/// flag.
///
/// # Errors
///
/// Returns [`EngineError::PermissionDenied`] when the flag is off.
pub fn authorize_status_change(
    caller: &Caller,
    target: &Participant,
    to: ParticipantStatus,
    permissions: &PermissionsConfig,
) -> Result<(), EngineError> {
    if caller.id == target.id || caller.is_admin() {
        return Ok(());
    }
    let allowed = if to.is_active() {
        permissions.can_set_others_active
    } else {
        permissions.can_set_others_inactive
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied {
            caller: caller.id,
            action: if to.is_active() {
                "set another participant active"
            } else {
                "set another participant inactive"
            },
        })
    }
}

/// Check `participant` has earned leech status when that is enforced.
///
/// Admins bypass the check.
///
/// # Errors
///
/// Returns [`ValidationError::LeechNotEligible`] if the participant has
/// neither enough GPs nor enough packs.
pub fn check_leech_eligibility(
    caller: &Caller,
    participant: &Participant,
    permissions: &PermissionsConfig,
) -> Result<(), ValidationError> {
    if !permissions.leech_requires_eligibility || caller.is_admin() {
        return Ok(());
    }
    if participant.gps_found >= permissions.leech_min_gps
        || participant.packs_opened >= permissions.leech_min_packs
    {
        return Ok(());
    }
    Err(ValidationError::LeechNotEligible {
        gps_found: participant.gps_found,
        packs_opened: participant.packs_opened,
        min_gps: permissions.leech_min_gps,
        min_packs: permissions.leech_min_packs,
    })
}

/// Apply a signed adjustment to the lifetime GP counter, saturating at
/// zero and `u64::MAX`. Returns the new count.
pub fn adjust_gps_found(participant: &mut Participant, delta: i64) -> u64 {
    let magnitude = delta.unsigned_abs();
    participant.gps_found = if delta >= 0 {
        participant.gps_found.saturating_add(magnitude)
    } else {
        participant.gps_found.saturating_sub(magnitude)
    };
    participant.gps_found
}

/// Add `packs` to the lifetime and session counters.
pub fn add_packs(participant: &mut Participant, packs: u64) {
    participant.packs_opened = participant.packs_opened.saturating_add(packs);
    if let Some(session) = participant.session.as_mut() {
        session.packs_opened = session.packs_opened.saturating_add(packs);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reroll_types::ParticipantId;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn participant() -> Participant {
        Participant::new(ParticipantId::new(7), at(0))
    }

    #[test]
    fn command_sets_any_status() {
        let mut p = participant();
        for to in [
            ParticipantStatus::Farm,
            ParticipantStatus::Leech,
            ParticipantStatus::Active,
            ParticipantStatus::Inactive,
        ] {
            let change = transition(&mut p, to, TransitionCause::Command, at(10)).unwrap();
            assert_eq!(change.to, to);
            assert_eq!(p.status, to);
        }
    }

    #[test]
    fn same_status_emits_nothing() {
        let mut p = participant();
        assert!(transition(&mut p, ParticipantStatus::Inactive, TransitionCause::Command, at(5)).is_none());
    }

    #[test]
    fn activation_opens_session_and_clears_flag() {
        let mut p = participant();
        p.flagged_for_removal = true;
        transition(&mut p, ParticipantStatus::Farm, TransitionCause::Command, at(100));
        assert!(!p.flagged_for_removal);
        assert_eq!(p.session.as_ref().unwrap().started_at, at(100));
        assert_eq!(p.last_active_at, Some(at(100)));
    }

    #[test]
    fn switching_between_active_kinds_keeps_session() {
        let mut p = participant();
        transition(&mut p, ParticipantStatus::Active, TransitionCause::Command, at(100));
        add_packs(&mut p, 40);
        transition(&mut p, ParticipantStatus::Leech, TransitionCause::Command, at(200));
        let session = p.session.as_ref().unwrap();
        assert_eq!(session.started_at, at(100));
        assert_eq!(session.packs_opened, 40);
    }

    #[test]
    fn demotion_closes_session() {
        let mut p = participant();
        transition(&mut p, ParticipantStatus::Active, TransitionCause::Command, at(100));
        let change = transition(&mut p, ParticipantStatus::Inactive, TransitionCause::Sweep, at(500)).unwrap();
        assert_eq!(change.from, ParticipantStatus::Active);
        assert_eq!(change.cause, TransitionCause::Sweep);
        assert!(p.session.is_none());
    }

    #[test]
    fn heartbeat_promotes_only_inactive() {
        let mut p = participant();
        let change = promote_on_heartbeat(&mut p, at(1)).unwrap();
        assert_eq!(change.to, ParticipantStatus::Active);
        assert_eq!(change.cause, TransitionCause::Heartbeat);

        p.status = ParticipantStatus::Farm;
        assert!(promote_on_heartbeat(&mut p, at(2)).is_none());
        assert_eq!(p.status, ParticipantStatus::Farm);
    }

    #[test]
    fn explicit_reactivation_refreshes_silence_reference() {
        let mut p = participant();
        transition(&mut p, ParticipantStatus::Active, TransitionCause::Command, at(100));
        assert!(transition(&mut p, ParticipantStatus::Active, TransitionCause::Command, at(900)).is_none());
        assert_eq!(p.last_active_at, Some(at(900)));
    }

    #[test]
    fn members_need_flags_for_others() {
        let target = participant();
        let other = Caller::member(ParticipantId::new(8));
        let own = Caller::member(target.id);
        let admin = Caller::admin(ParticipantId::new(9));
        let locked = PermissionsConfig {
            can_set_others_active: false,
            can_set_others_inactive: false,
            ..PermissionsConfig::default()
        };

        assert!(authorize_status_change(&own, &target, ParticipantStatus::Active, &locked).is_ok());
        assert!(authorize_status_change(&admin, &target, ParticipantStatus::Inactive, &locked).is_ok());
        assert!(matches!(
            authorize_status_change(&other, &target, ParticipantStatus::Inactive, &locked),
            Err(EngineError::PermissionDenied { .. })
        ));
        assert!(
            authorize_status_change(&other, &target, ParticipantStatus::Farm, &PermissionsConfig::default())
                .is_ok()
        );
    }

    #[test]
    fn leech_eligibility_when_enforced() {
        let mut p = participant();
        let caller = Caller::member(p.id);
        let strict = PermissionsConfig {
            leech_requires_eligibility: true,
            ..PermissionsConfig::default()
        };

        assert!(check_leech_eligibility(&caller, &p, &PermissionsConfig::default()).is_ok());
        assert!(check_leech_eligibility(&caller, &p, &strict).is_err());
        assert!(check_leech_eligibility(&Caller::admin(ParticipantId::new(1)), &p, &strict).is_ok());

        p.packs_opened = 50_000;
        assert!(check_leech_eligibility(&caller, &p, &strict).is_ok());
    }

    #[test]
    fn gp_counter_saturates() {
        let mut p = participant();
        assert_eq!(adjust_gps_found(&mut p, 3), 3);
        assert_eq!(adjust_gps_found(&mut p, -5), 0);
        p.gps_found = u64::MAX;
        assert_eq!(adjust_gps_found(&mut p, 1), u64::MAX);
    }
}
