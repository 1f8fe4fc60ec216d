//! Command surface.
//!
//! Collaborators deliver already-parsed, authenticated commands as
//! [`Command`] values (JSON with a `command` tag) and get a JSON reply
//! back from [`dispatch`]. Replies are `{"ok": true, "data": ...}` or
//! `{"ok": false, "error": {"code": ..., "message": ...}}`.

use chrono::{DateTime, Utc};
use reroll_types::{
    Caller, GodPackId, HeartbeatReport, ParticipantId, ParticipantStatus, TestOutcome,
    VerificationStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::engine::{Engine, Registration};
use crate::error::EngineError;
use crate::store::EntityKey;

/// One command or query addressed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Create a participant or update identity fields.
    Register(Registration),
    /// Set a participant's status.
    SetStatus {
        /// Who is asking.
        caller: Caller,
        /// Whose status changes.
        target: ParticipantId,
        /// New status.
        status: ParticipantStatus,
    },
    /// Ingest a heartbeat report.
    Heartbeat(Box<HeartbeatReport>),
    /// Register a God Pack candidate.
    DiscoverGodPack {
        /// Candidate id.
        gp_id: GodPackId,
        /// Who found it.
        discovered_by: ParticipantId,
        /// When it was found; defaults to now.
        #[serde(default)]
        discovered_at: Option<DateTime<Utc>>,
        /// Pack position within the opening (1-5).
        #[serde(default = "default_pack_count")]
        pack_count: u8,
    },
    /// Append a test result.
    RecordTest {
        /// Who tested.
        tester: ParticipantId,
        /// Which pack.
        gp_id: GodPackId,
        /// What they saw.
        outcome: TestOutcome,
        /// Slots offered divided by friends available.
        #[serde(default)]
        slots_friends_ratio: Option<f64>,
    },
    /// Clear a pack's ledger.
    ResetTest {
        /// Who is asking.
        caller: Caller,
        /// Which pack.
        gp_id: GodPackId,
    },
    /// Move a pack's expiry deadline.
    ExtendExpiration {
        /// Who is asking.
        caller: Caller,
        /// Which pack.
        gp_id: GodPackId,
        /// Signed number of hours.
        hours: i64,
    },
    /// Expire a pending pack now.
    ForceExpire {
        /// Who is asking.
        caller: Caller,
        /// Which pack.
        gp_id: GodPackId,
    },
    /// Change a participant's lifetime GP count.
    AdjustGpFoundCount {
        /// Who is asking.
        caller: Caller,
        /// Whose counter changes.
        target: ParticipantId,
        /// Signed adjustment.
        delta: i64,
    },
    /// Fetch one participant.
    GetParticipant {
        /// Participant id.
        id: ParticipantId,
    },
    /// Participant ids grouped by status.
    ListParticipantsByStatus,
    /// Participants eligible for rosters and GP testing.
    EligibleParticipants,
    /// Fetch one God Pack.
    GetGodPack {
        /// God Pack id.
        id: GodPackId,
    },
    /// God Packs with a given status.
    ListGodPacksByStatus {
        /// Status to filter on.
        status: VerificationStatus,
    },
    /// Pending God Packs with no tests.
    ListUntestedGodPacks,
    /// Ledger, probability and counts of one God Pack.
    TestSummary {
        /// God Pack id.
        gp_id: GodPackId,
    },
    /// Timeline snapshots in a window.
    TimelineRange {
        /// Inclusive window start.
        start: DateTime<Utc>,
        /// Exclusive window end.
        end: DateTime<Utc>,
        /// Optional coarser bucket size in seconds.
        #[serde(default)]
        bucket_secs: Option<u64>,
    },
}

const fn default_pack_count() -> u8 {
    1
}

impl Command {
    /// The command's tag.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::SetStatus { .. } => "set_status",
            Self::Heartbeat(_) => "heartbeat",
            Self::DiscoverGodPack { .. } => "discover_god_pack",
            Self::RecordTest { .. } => "record_test",
            Self::ResetTest { .. } => "reset_test",
            Self::ExtendExpiration { .. } => "extend_expiration",
            Self::ForceExpire { .. } => "force_expire",
            Self::AdjustGpFoundCount { .. } => "adjust_gp_found_count",
            Self::GetParticipant { .. } => "get_participant",
            Self::ListParticipantsByStatus => "list_participants_by_status",
            Self::EligibleParticipants => "eligible_participants",
            Self::GetGodPack { .. } => "get_god_pack",
            Self::ListGodPacksByStatus { .. } => "list_god_packs_by_status",
            Self::ListUntestedGodPacks => "list_untested_god_packs",
            Self::TestSummary { .. } => "test_summary",
            Self::TimelineRange { .. } => "timeline_range",
        }
    }

    /// The entity the command writes to, `None` for read-only queries.
    ///
    /// Commands for the same key must be applied in arrival order.
    pub fn routing_key(&self) -> Option<EntityKey> {
        match self {
            Self::Register(registration) => Some(EntityKey::Participant(registration.id)),
            Self::SetStatus { target, .. } | Self::AdjustGpFoundCount { target, .. } => {
                Some(EntityKey::Participant(*target))
            }
            Self::Heartbeat(report) => Some(EntityKey::Participant(report.participant_id)),
            Self::DiscoverGodPack { gp_id, .. }
            | Self::RecordTest { gp_id, .. }
            | Self::ResetTest { gp_id, .. }
            | Self::ExtendExpiration { gp_id, .. }
            | Self::ForceExpire { gp_id, .. } => Some(EntityKey::GodPack(*gp_id)),
            Self::GetParticipant { .. }
            | Self::ListParticipantsByStatus
            | Self::EligibleParticipants
            | Self::GetGodPack { .. }
            | Self::ListGodPacksByStatus { .. }
            | Self::ListUntestedGodPacks
            | Self::TestSummary { .. }
            | Self::TimelineRange { .. } => None,
        }
    }
}

/// Errors produced while executing a command.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The engine refused or failed the command.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The result could not be encoded.
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DispatchError {
    /// Short machine-readable name of the error class.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Engine(err) => err.code(),
            Self::Encode(_) => "encode",
        }
    }
}

/// Run `command` and encode the outcome as a JSON reply.
pub async fn dispatch(engine: &Engine, command: Command) -> Value {
    let name = command.name();
    match execute(engine, command).await {
        Ok(data) => {
            debug!(command = name, "Command succeeded");
            json!({ "ok": true, "data": data })
        }
        Err(err) => {
            debug!(command = name, code = err.code(), %err, "Command failed");
            json!({
                "ok": false,
                "error": { "code": err.code(), "message": err.to_string() },
            })
        }
    }
}

/// Run `command` and return its result as JSON.
///
/// # Errors
///
/// Returns [`DispatchError`] if the engine rejects the command or the
/// result cannot be encoded.
pub async fn execute(engine: &Engine, command: Command) -> Result<Value, DispatchError> {
    let value = match command {
        Command::Register(registration) => {
            serde_json::to_value(engine.register_participant(registration).await?)?
        }
        Command::SetStatus {
            caller,
            target,
            status,
        } => serde_json::to_value(engine.set_status(caller, target, status).await?)?,
        Command::Heartbeat(report) => serde_json::to_value(engine.ingest_heartbeat(*report).await?)?,
        Command::DiscoverGodPack {
            gp_id,
            discovered_by,
            discovered_at,
            pack_count,
        } => {
            let at = discovered_at.unwrap_or_else(|| engine.now());
            serde_json::to_value(
                engine
                    .discover_god_pack(gp_id, discovered_by, at, pack_count)
                    .await?,
            )?
        }
        Command::RecordTest {
            tester,
            gp_id,
            outcome,
            slots_friends_ratio,
        } => serde_json::to_value(
            engine
                .record_test(tester, gp_id, outcome, slots_friends_ratio)
                .await?,
        )?,
        Command::ResetTest { caller, gp_id } => {
            serde_json::to_value(engine.reset_test(caller, gp_id).await?)?
        }
        Command::ExtendExpiration {
            caller,
            gp_id,
            hours,
        } => serde_json::to_value(engine.extend_expiration(caller, gp_id, hours).await?)?,
        Command::ForceExpire { caller, gp_id } => {
            serde_json::to_value(engine.force_expire(caller, gp_id).await?)?
        }
        Command::AdjustGpFoundCount {
            caller,
            target,
            delta,
        } => json!({ "gps_found": engine.adjust_gp_found_count(caller, target, delta).await? }),
        Command::GetParticipant { id } => serde_json::to_value(engine.get_participant(id).await?)?,
        Command::ListParticipantsByStatus => {
            serde_json::to_value(engine.list_participants_by_status().await?)?
        }
        Command::EligibleParticipants => {
            serde_json::to_value(engine.eligible_participants().await?)?
        }
        Command::GetGodPack { id } => serde_json::to_value(engine.get_god_pack(id).await?)?,
        Command::ListGodPacksByStatus { status } => {
            serde_json::to_value(engine.list_god_packs_by_status(status).await?)?
        }
        Command::ListUntestedGodPacks => {
            serde_json::to_value(engine.list_untested_god_packs().await?)?
        }
        Command::TestSummary { gp_id } => serde_json::to_value(engine.test_summary(gp_id).await?)?,
        Command::TimelineRange {
            start,
            end,
            bucket_secs,
        } => serde_json::to_value(engine.timeline_range(start, end, bucket_secs).await?)?,
    };
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RerollConfig;
    use crate::notify::NullSink;
    use crate::store::MemoryStore;

    fn engine() -> Engine {
        let store = Arc::new(MemoryStore::new());
        Engine::new(
            RerollConfig::default(),
            store.clone(),
            store,
            Arc::new(NullSink),
            Arc::new(ManualClock::new(DateTime::from_timestamp(1_000, 0).unwrap())),
        )
        .unwrap()
    }

    fn parse(value: Value) -> Command {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn commands_parse_from_tagged_json() {
        let cmd = parse(json!({
            "command": "record_test",
            "tester": 5,
            "gp_id": 9,
            "outcome": "NoShow",
            "slots_friends_ratio": 0.5
        }));
        assert_eq!(cmd.name(), "record_test");

        let cmd = parse(json!({ "command": "list_untested_god_packs" }));
        assert_eq!(cmd, Command::ListUntestedGodPacks);

        let cmd = parse(json!({ "command": "discover_god_pack", "gp_id": 1, "discovered_by": 2 }));
        assert!(matches!(
            cmd,
            Command::DiscoverGodPack {
                pack_count: 1,
                discovered_at: None,
                ..
            }
        ));
    }

    #[test]
    fn writes_route_by_target_entity() {
        let cmd = parse(json!({
            "command": "heartbeat",
            "participant_id": 4,
            "instance_name": "Main",
            "timestamp": "2026-01-01T00:00:00Z"
        }));
        assert_eq!(cmd.routing_key(), Some(EntityKey::Participant(ParticipantId::new(4))));

        let cmd = parse(json!({
            "command": "set_status",
            "caller": { "id": 1, "privilege": "Member" },
            "target": 4,
            "status": "Farm"
        }));
        assert_eq!(cmd.routing_key(), Some(EntityKey::Participant(ParticipantId::new(4))));

        let cmd = parse(json!({ "command": "record_test", "tester": 4, "gp_id": 9, "outcome": "Miss" }));
        assert_eq!(cmd.routing_key(), Some(EntityKey::GodPack(GodPackId::new(9))));

        assert_eq!(parse(json!({ "command": "get_god_pack", "id": 9 })).routing_key(), None);
    }

    #[test]
    fn heartbeat_command_tolerates_missing_fields() {
        let cmd = parse(json!({
            "command": "heartbeat",
            "participant_id": 1,
            "instance_name": "Main",
            "timestamp": "2026-01-01T00:00:00Z",
            "fields": {}
        }));
        assert!(matches!(cmd, Command::Heartbeat(_)));
    }

    #[tokio::test]
    async fn dispatch_wraps_success_and_errors() {
        let engine = engine();
        let reply = dispatch(
            &engine,
            parse(json!({ "command": "discover_god_pack", "gp_id": 7, "discovered_by": 3 })),
        )
        .await;
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["data"]["status"], json!("Pending"));

        let reply = dispatch(&engine, parse(json!({ "command": "get_god_pack", "id": 8 }))).await;
        assert_eq!(reply["ok"], json!(false));
        assert_eq!(reply["error"]["code"], json!("not_found"));
    }

    #[tokio::test]
    async fn terminal_conflict_has_stable_code() {
        let engine = engine();
        execute(
            &engine,
            parse(json!({ "command": "discover_god_pack", "gp_id": 1, "discovered_by": 1 })),
        )
        .await
        .unwrap();
        execute(
            &engine,
            parse(json!({ "command": "record_test", "tester": 2, "gp_id": 1, "outcome": "Dead" })),
        )
        .await
        .unwrap();
        let reply = dispatch(
            &engine,
            parse(json!({ "command": "record_test", "tester": 3, "gp_id": 1, "outcome": "Miss" })),
        )
        .await;
        assert_eq!(reply["error"]["code"], json!("gp_already_terminal"));
    }

    #[tokio::test]
    async fn impossible_pack_count_is_a_validation_error() {
        let engine = engine();
        let reply = dispatch(
            &engine,
            parse(json!({ "command": "discover_god_pack", "gp_id": 4, "discovered_by": 1, "pack_count": 9 })),
        )
        .await;
        assert_eq!(reply["error"]["code"], json!("validation"));
        let reply = dispatch(&engine, parse(json!({ "command": "get_god_pack", "id": 4 }))).await;
        assert_eq!(reply["error"]["code"], json!("not_found"));
    }

    #[tokio::test]
    async fn admins_move_and_force_expiry() {
        let engine = engine();
        let admin = json!({ "id": 1, "privilege": "Admin" });
        let reply = dispatch(
            &engine,
            parse(json!({ "command": "discover_god_pack", "gp_id": 2, "discovered_by": 3 })),
        )
        .await;
        assert_eq!(reply["data"]["expires_at"], json!("1970-01-04T06:00:00Z"));

        let reply = dispatch(
            &engine,
            parse(json!({ "command": "extend_expiration", "caller": admin, "gp_id": 2, "hours": 24 })),
        )
        .await;
        assert_eq!(reply["data"]["expires_at"], json!("1970-01-05T06:00:00Z"));

        let member = json!({ "id": 3, "privilege": "Member" });
        let reply = dispatch(
            &engine,
            parse(json!({ "command": "force_expire", "caller": member, "gp_id": 2 })),
        )
        .await;
        assert_eq!(reply["error"]["code"], json!("permission_denied"));

        let reply = dispatch(
            &engine,
            parse(json!({ "command": "force_expire", "caller": admin, "gp_id": 2 })),
        )
        .await;
        assert_eq!(reply["data"]["status"], json!("Dead"));
        assert_eq!(reply["data"]["expired_at"], json!("1970-01-01T00:16:40Z"));
    }
}
