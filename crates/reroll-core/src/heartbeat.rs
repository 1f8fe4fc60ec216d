//! Heartbeat monitor: report ingestion and the staleness sweep.
//!
//! Ingestion accepts a report only if it is newer than the last one from
//! the same instance. The sweep measures silence from the later of the
//! newest heartbeat and the last explicit activation, and fires each
//! threshold once per silence episode.

use chrono::{DateTime, Utc};
use reroll_types::{
    AntiCheatFlag, HeartbeatReport, Instance, InstanceKind, Participant, ParticipantStatus,
    StatusChange, TransitionCause,
};
use serde::Serialize;

use crate::anticheat;
use crate::config::{AntiCheatConfig, MonitorConfig};
use crate::error::{EngineError, ValidationError};
use crate::participant;

/// What an accepted heartbeat did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatAccepted {
    /// Inactive-to-active promotion, if the report caused one.
    pub promoted: Option<StatusChange>,
    /// Advisory anti-cheat flags raised by the report.
    pub flags: Vec<AntiCheatFlag>,
    /// Packs credited to the participant.
    pub packs_added: u64,
}

/// Check a report carries everything ingestion needs.
///
/// # Errors
///
/// Returns [`ValidationError`] for an empty instance name or a missing
/// required field.
pub fn validate(report: &HeartbeatReport) -> Result<(), ValidationError> {
    if report.instance_name.trim().is_empty() {
        return Err(ValidationError::EmptyInstanceName);
    }
    if report.fields.online_instances.is_none() {
        return Err(ValidationError::MissingField {
            field: "online_instances",
        });
    }
    if report.fields.packs_opened_delta.is_none() {
        return Err(ValidationError::MissingField {
            field: "packs_opened_delta",
        });
    }
    Ok(())
}

/// Refuse a report stamped more than `max_skew_secs` after `now`.
///
/// A report from the future would pin the instance's last-seen time ahead
/// of every genuine report and hide the participant from the sweep.
///
/// # Errors
///
/// Returns [`ValidationError::FutureTimestamp`] when the lead is too large.
pub fn check_clock_skew(
    report: &HeartbeatReport,
    now: DateTime<Utc>,
    max_skew_secs: u64,
) -> Result<(), ValidationError> {
    let lead = report.timestamp.signed_duration_since(now).num_seconds();
    let too_far = u64::try_from(lead).is_ok_and(|lead| lead > max_skew_secs);
    if too_far {
        return Err(ValidationError::FutureTimestamp {
            timestamp: report.timestamp,
            now,
            max_skew_secs,
        });
    }
    Ok(())
}

/// Apply one heartbeat report to `participant`.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] for malformed reports and
/// [`EngineError::StaleReport`] if the timestamp is not strictly after the
/// instance's last accepted heartbeat. In both cases `participant` is
/// untouched.
pub fn ingest(
    participant: &mut Participant,
    report: &HeartbeatReport,
    anticheat_config: &AntiCheatConfig,
) -> Result<HeartbeatAccepted, EngineError> {
    validate(report)?;
    let name = report.instance_name.trim();
    let previous = participant.instances.get(name);

    if let Some(prev) = previous
        && report.timestamp <= prev.last_seen
    {
        return Err(EngineError::StaleReport {
            participant_id: participant.id,
            instance: name.to_owned(),
            timestamp: report.timestamp,
            last_seen: prev.last_seen,
        });
    }

    let flags = anticheat::evaluate(
        previous,
        report,
        participant.declared_average_instances,
        anticheat_config,
    );

    let fields = &report.fields;
    let packs_added = fields.packs_opened_delta.unwrap_or(0);
    let instance_packs = previous.map_or(0, |p| p.packs_opened);
    participant.instances.insert(
        name.to_owned(),
        Instance {
            name: name.to_owned(),
            kind: InstanceKind::from_name(name),
            last_seen: report.timestamp,
            online_instances: fields.online_instances.clone().unwrap_or_default(),
            offline_instances: fields.offline_instances.clone(),
            main_on: fields.main_on,
            config: fields.instance_config(),
            packs_opened: instance_packs.saturating_add(packs_added),
        },
    );

    let promoted = participant::promote_on_heartbeat(participant, report.timestamp);
    participant::add_packs(participant, packs_added);

    Ok(HeartbeatAccepted {
        promoted,
        flags,
        packs_added,
    })
}

/// What one sweep of one participant did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Demotion to `Inactive`, if the silence threshold was crossed.
    pub demoted: Option<StatusChange>,
    /// Whether the participant was newly flagged for removal.
    pub flagged: bool,
}

impl SweepOutcome {
    /// Whether the sweep changed anything.
    pub const fn is_quiet(&self) -> bool {
        self.demoted.is_none() && !self.flagged
    }
}

/// Whole seconds elapsed from `since` to `now`, or `None` if `since` is in
/// the future.
fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> Option<u64> {
    u64::try_from(now.signed_duration_since(since).num_seconds()).ok()
}

/// Run the staleness sweep for one participant at `now`.
///
/// Demotes an active, farm or leech participant whose silence exceeds
/// `silence_threshold_secs`, then flags an inactive one whose silence
/// exceeds `auto_kick_threshold_secs`. Neither fires again until the
/// participant becomes active and falls silent anew.
pub fn sweep(participant: &mut Participant, now: DateTime<Utc>, config: &MonitorConfig) -> SweepOutcome {
    let reference = participant
        .silence_reference()
        .unwrap_or(participant.created_at);
    let Some(silence) = elapsed_secs(reference, now) else {
        return SweepOutcome::default();
    };

    let mut outcome = SweepOutcome::default();
    if participant.status.is_active() && silence > config.silence_threshold_secs {
        outcome.demoted = participant::transition(
            participant,
            ParticipantStatus::Inactive,
            TransitionCause::Sweep,
            now,
        );
    }

    if config.auto_kick_enabled
        && participant.status == ParticipantStatus::Inactive
        && !participant.flagged_for_removal
        && silence > config.auto_kick_threshold_secs
    {
        participant.flagged_for_removal = true;
        outcome.flagged = true;
    }
    outcome
}
