//! The activity and verification engine.
//!
//! [`Engine`] ties the state machine, heartbeat monitor, GP test tracking
//! and aggregator to an [`EntityStore`]. Every mutation of a participant
//! or God Pack runs under that entity's lock and as a versioned
//! read-modify-write:
//!
//! 1. Take the per-entity lock (other entities proceed in parallel)
//! 2. Read the record and its version
//! 3. Decide on a copy, without suspending
//! 4. Write the copy back if it changed, conditional on the version
//! 5. On a version conflict, go back to 2, up to `store.max_write_attempts`
//! 6. Publish notifications only after the write committed
//!
//! The scheduler tick goes through the same locks, so a sweep never
//! interleaves with a heartbeat for the same participant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reroll_types::{
    Caller, GodPack, GodPackId, HeartbeatReport, Notification, NotificationKind, Participant,
    ParticipantId, ParticipantStatus, RosterByStatus, TestOutcome, TestSummary, TimelineSnapshot,
    TransitionCause, VerificationStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::clock::{Clock, TickPlan};
use crate::config::{ConfigError, RerollConfig};
use crate::error::{EngineError, ValidationError};
use crate::expiration::{self, ExpiryCheck};
use crate::gp_tracking::{self, TestAccepted};
use crate::heartbeat::{self, HeartbeatAccepted};
use crate::notify::NotificationSink;
use crate::participant;
use crate::statistics::{self, TransitionTally};
use crate::store::{EntityKey, EntityStore, StoreError, TimelineStore, Versioned};

// ---------------------------------------------------------------------------
// Per-entity locks
// ---------------------------------------------------------------------------

/// One async mutex per entity key, created on first use.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: EntityKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on. Returns how many remain.
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.len()
    }
}

// ---------------------------------------------------------------------------
// Versioned records
// ---------------------------------------------------------------------------

/// An entity the engine can read-modify-write.
#[async_trait]
trait Record: Clone + PartialEq + Send + Sync + 'static {
    type Id: Copy + Send + Sync + 'static;

    fn key(id: Self::Id) -> EntityKey;

    async fn load(store: &dyn EntityStore, id: Self::Id) -> Result<Option<Versioned<Self>>, StoreError>;

    async fn save(&self, store: &dyn EntityStore, expected: Option<u64>) -> Result<u64, StoreError>;
}

#[async_trait]
impl Record for Participant {
    type Id = ParticipantId;

    fn key(id: ParticipantId) -> EntityKey {
        EntityKey::Participant(id)
    }

    async fn load(store: &dyn EntityStore, id: ParticipantId) -> Result<Option<Versioned<Self>>, StoreError> {
        store.get_participant(id).await
    }

    async fn save(&self, store: &dyn EntityStore, expected: Option<u64>) -> Result<u64, StoreError> {
        store.put_participant(self, expected).await
    }
}

#[async_trait]
impl Record for GodPack {
    type Id = GodPackId;

    fn key(id: GodPackId) -> EntityKey {
        EntityKey::GodPack(id)
    }

    async fn load(store: &dyn EntityStore, id: GodPackId) -> Result<Option<Versioned<Self>>, StoreError> {
        store.get_god_pack(id).await
    }

    async fn save(&self, store: &dyn EntityStore, expected: Option<u64>) -> Result<u64, StoreError> {
        store.put_god_pack(self, expected).await
    }
}

/// Result of one read-modify-write.
#[derive(Debug)]
struct Mutation<T, R> {
    entity: T,
    outcome: R,
    created: bool,
}

// ---------------------------------------------------------------------------
// Public payloads
// ---------------------------------------------------------------------------

/// Identity fields supplied when a participant registers.
///
/// `None` fields leave the stored value alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Account id.
    pub id: ParticipantId,
    /// Linked in-game friend id.
    #[serde(default)]
    pub linked_game_id: Option<String>,
    /// In-game name prefix.
    #[serde(default)]
    pub display_prefix: Option<String>,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Declared average instance count.
    #[serde(default)]
    pub declared_average_instances: Option<u32>,
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tick number.
    pub tick: u64,
    /// Participants demoted to `Inactive`.
    pub demoted: u32,
    /// Participants flagged for removal.
    pub flagged: u32,
    /// Pending God Packs warned that their deadline is near.
    pub expiring_soon: u32,
    /// Pending God Packs expired to `Dead`.
    pub expired: u32,
    /// Participants or God Packs whose tick work failed and will be
    /// retried next tick.
    pub failures: u32,
    /// Snapshot taken this tick, if the tick entered a new bucket.
    pub snapshot: Option<TimelineSnapshot>,
    /// Whether the snapshot was new (false if its bucket already existed).
    pub snapshot_written: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The activity and verification engine.
pub struct Engine {
    config: RerollConfig,
    entities: Arc<dyn EntityStore>,
    timeline: Arc<dyn TimelineStore>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    locks: EntityLocks,
    tally: TransitionTally,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .field("tally", &self.tally)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine over the given stores.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `config` fails validation.
    pub fn new(
        config: RerollConfig,
        entities: Arc<dyn EntityStore>,
        timeline: Arc<dyn TimelineStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            entities,
            timeline,
            sink,
            clock,
            locks: EntityLocks::new(),
            tally: TransitionTally::new(),
        })
    }

    /// The engine's configuration.
    pub const fn config(&self) -> &RerollConfig {
        &self.config
    }

    /// The engine's current time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Status transitions not yet attributed to a snapshot.
    pub fn pending_transitions(&self) -> u64 {
        self.tally.get()
    }

    async fn mutate<T, R, F>(&self, id: T::Id, seed: Option<T>, mut decide: F) -> Result<Mutation<T, R>, EngineError>
    where
        T: Record,
        R: Send,
        F: FnMut(&mut T) -> Result<R, EngineError> + Send,
    {
        let key = T::key(id);
        let _guard = self.locks.acquire(key).await;
        let attempts = self.config.store.max_write_attempts;

        for attempt in 1..=attempts {
            let (original, version) = match T::load(self.entities.as_ref(), id).await? {
                Some(stored) => (stored.value, Some(stored.version)),
                None => match &seed {
                    Some(seed) => (seed.clone(), None),
                    None => return Err(EngineError::NotFound { key }),
                },
            };

            let mut entity = original.clone();
            let outcome = decide(&mut entity)?;
            if version.is_some() && entity == original {
                return Ok(Mutation {
                    entity,
                    outcome,
                    created: false,
                });
            }

            match entity.save(self.entities.as_ref(), version).await {
                Ok(_) => {
                    return Ok(Mutation {
                        entity,
                        outcome,
                        created: version.is_none(),
                    });
                }
                Err(err) if err.is_conflict() => {
                    debug!(%key, attempt, %err, "Write lost a version race, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(%key, attempts, "Write attempts exhausted");
        Err(EngineError::ConcurrencyConflict { key, attempts })
    }

    fn emit(&self, at: DateTime<Utc>, kind: NotificationKind) {
        if matches!(kind, NotificationKind::StatusChanged(_)) {
            self.tally.record();
        }
        self.sink.publish(&Notification::new(at, kind));
    }

    fn require_admin(caller: &Caller, action: &'static str) -> Result<(), EngineError> {
        if caller.is_admin() {
            Ok(())
        } else {
            warn!(caller = %caller.id, action, "Privileged command refused");
            Err(EngineError::PermissionDenied {
                caller: caller.id,
                action,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Create a participant or update their identity fields.
    ///
    /// Never changes status.
    pub async fn register_participant(&self, registration: Registration) -> Result<Participant, EngineError> {
        let now = self.now();
        let id = registration.id;
        let m = self
            .mutate(id, Some(Participant::new(id, now)), |p| {
                if let Some(v) = &registration.linked_game_id {
                    p.linked_game_id = Some(v.clone());
                }
                if let Some(v) = &registration.display_prefix {
                    p.display_prefix = Some(v.clone());
                }
                if let Some(v) = &registration.display_name {
                    p.display_name = Some(v.clone());
                }
                if let Some(v) = registration.declared_average_instances {
                    p.declared_average_instances = Some(v);
                }
                Ok(())
            })
            .await?;
        info!(participant = %id, created = m.created, "Participant registered");
        Ok(m.entity)
    }

    /// Set a participant's status by command.
    ///
    /// A participant setting their own status is created on the fly if
    /// unknown.
    pub async fn set_status(
        &self,
        caller: Caller,
        target: ParticipantId,
        to: ParticipantStatus,
    ) -> Result<Participant, EngineError> {
        let now = self.now();
        let seed = (caller.id == target).then(|| Participant::new(target, now));
        let permissions = &self.config.permissions;
        let m = self
            .mutate(target, seed, |p| {
                participant::authorize_status_change(&caller, p, to, permissions)?;
                if to == ParticipantStatus::Leech {
                    participant::check_leech_eligibility(&caller, p, permissions)?;
                }
                Ok(participant::transition(p, to, TransitionCause::Command, now))
            })
            .await
            .inspect_err(|err| warn!(caller = %caller.id, participant = %target, %to, %err, "Status change refused"))?;

        if let Some(change) = m.outcome {
            info!(
                participant = %target,
                from = %change.from,
                to = %change.to,
                caller = %caller.id,
                "Status changed by command"
            );
            self.emit(now, NotificationKind::StatusChanged(change));
        }
        Ok(m.entity)
    }

    /// Ingest one heartbeat report.
    ///
    /// The first report from an unknown participant creates them. Reports
    /// stamped more than `monitor.max_clock_skew_secs` ahead of the engine
    /// clock are refused.
    pub async fn ingest_heartbeat(&self, report: HeartbeatReport) -> Result<HeartbeatAccepted, EngineError> {
        let id = report.participant_id;
        let checked = heartbeat::validate(&report).and_then(|()| {
            heartbeat::check_clock_skew(&report, self.now(), self.config.monitor.max_clock_skew_secs)
        });
        if let Err(err) = checked {
            warn!(participant = %id, timestamp = %report.timestamp, %err, "Malformed heartbeat rejected");
            return Err(err.into());
        }

        let anticheat = &self.config.anticheat;
        let result = self
            .mutate(id, Some(Participant::new(id, report.timestamp)), |p| {
                heartbeat::ingest(p, &report, anticheat)
            })
            .await;
        let m = match result {
            Ok(m) => m,
            Err(err) => {
                warn!(
                    participant = %id,
                    instance = %report.instance_name,
                    timestamp = %report.timestamp,
                    %err,
                    "Heartbeat rejected"
                );
                return Err(err);
            }
        };

        let accepted = m.outcome;
        debug!(
            participant = %id,
            instance = %report.instance_name,
            packs = accepted.packs_added,
            "Heartbeat accepted"
        );
        if let Some(change) = &accepted.promoted {
            info!(participant = %id, from = %change.from, "Promoted to active by heartbeat");
            self.emit(change.at, NotificationKind::StatusChanged(change.clone()));
        }
        for flag in &accepted.flags {
            warn!(
                participant = %id,
                instance = %flag.instance_name,
                rule = ?flag.rule,
                observed = flag.observed,
                limit = flag.limit,
                "Anti-cheat flag raised"
            );
            self.emit(flag.at, NotificationKind::AntiCheat(flag.clone()));
        }
        Ok(accepted)
    }

    /// Register a newly found God Pack candidate.
    ///
    /// Idempotent: rediscovering a known id returns the stored pack and
    /// emits nothing. The pack's expiry deadline is fixed here.
    pub async fn discover_god_pack(
        &self,
        gp_id: GodPackId,
        discovered_by: ParticipantId,
        discovered_at: DateTime<Utc>,
        pack_count: u8,
    ) -> Result<GodPack, EngineError> {
        if !(1..=5).contains(&pack_count) {
            warn!(gp = %gp_id, pack_count, "God Pack with impossible pack count rejected");
            return Err(ValidationError::InvalidPackCount { pack_count }.into());
        }
        let mut seed = GodPack::discovered(gp_id, discovered_by, discovered_at, pack_count);
        if let Some(deadline) = expiration::deadline(discovered_at, &self.config.expiration) {
            seed = seed.with_expiry(deadline);
        }
        let m = self.mutate(gp_id, Some(seed), |_| Ok(())).await?;
        if m.created {
            info!(gp = %gp_id, discovered_by = %discovered_by, pack_count, "God Pack discovered");
            self.emit(
                discovered_at,
                NotificationKind::GodPackDiscovered {
                    gp_id,
                    discovered_by,
                },
            );
        } else {
            debug!(gp = %gp_id, "God Pack already known");
        }
        Ok(m.entity)
    }

    /// Append a test result to a God Pack's ledger.
    pub async fn record_test(
        &self,
        tester: ParticipantId,
        gp_id: GodPackId,
        outcome: TestOutcome,
        slots_friends_ratio: Option<f64>,
    ) -> Result<TestAccepted, EngineError> {
        let now = self.now();
        let floor = self.config.testing.noshow_floor;
        let m = self
            .mutate::<GodPack, _, _>(gp_id, None, |gp| {
                let record = gp_tracking::test_record(tester, outcome, slots_friends_ratio, now);
                gp_tracking::record_test(gp, record, floor)
            })
            .await
            .inspect_err(|err| warn!(gp = %gp_id, tester = %tester, ?outcome, %err, "Test rejected"))?;

        let accepted = m.outcome;
        debug!(gp = %gp_id, tester = %tester, ?outcome, probability = ?accepted.probability, "Test recorded");
        self.emit(
            now,
            NotificationKind::TestRecorded {
                gp_id,
                tester,
                outcome,
                probability: accepted.probability,
            },
        );
        if let Some(status) = accepted.resolved {
            info!(gp = %gp_id, ?status, resolved_by = %tester, "God Pack resolved");
            self.emit(
                now,
                NotificationKind::GodPackResolved {
                    gp_id,
                    status,
                    resolved_by: tester,
                },
            );
        }
        Ok(accepted)
    }

    /// Clear a God Pack's ledger and return it to `Pending`. Admin only.
    pub async fn reset_test(&self, caller: Caller, gp_id: GodPackId) -> Result<TestSummary, EngineError> {
        Self::require_admin(&caller, "reset God Pack tests")?;
        let now = self.now();
        let m = self
            .mutate::<GodPack, _, _>(gp_id, None, |gp| Ok(gp_tracking::reset(gp)))
            .await?;
        info!(gp = %gp_id, cleared = m.outcome, reset_by = %caller.id, "God Pack tests reset");
        self.emit(
            now,
            NotificationKind::TestsReset {
                gp_id,
                reset_by: caller.id,
            },
        );
        Ok(gp_tracking::summary(&m.entity, self.config.testing.noshow_floor))
    }

    /// Move a God Pack's expiry deadline by `hours`. Admin only.
    pub async fn extend_expiration(&self, caller: Caller, gp_id: GodPackId, hours: i64) -> Result<GodPack, EngineError> {
        Self::require_admin(&caller, "extend God Pack expiry")?;
        let config = &self.config.expiration;
        let m = self
            .mutate::<GodPack, _, _>(gp_id, None, |gp| {
                expiration::extend(gp, hours, config).map_err(EngineError::from)
            })
            .await?;
        info!(gp = %gp_id, hours, expires_at = %m.outcome, by = %caller.id, "God Pack expiry moved");
        Ok(m.entity)
    }

    /// Expire a pending God Pack now. Admin only.
    pub async fn force_expire(&self, caller: Caller, gp_id: GodPackId) -> Result<GodPack, EngineError> {
        Self::require_admin(&caller, "expire God Packs")?;
        let now = self.now();
        let m = self
            .mutate::<GodPack, _, _>(gp_id, None, |gp| expiration::force_expire(gp, now))
            .await
            .inspect_err(|err| warn!(gp = %gp_id, %err, "Forced expiry refused"))?;
        info!(gp = %gp_id, by = %caller.id, "God Pack expired by admin");
        self.emit(
            now,
            NotificationKind::GodPackExpired {
                gp_id,
                expires_at: now,
                forced_by: Some(caller.id),
            },
        );
        Ok(m.entity)
    }

    /// Add to or subtract from a participant's GP counter. Admin only.
    ///
    /// Returns the new count.
    pub async fn adjust_gp_found_count(
        &self,
        caller: Caller,
        target: ParticipantId,
        delta: i64,
    ) -> Result<u64, EngineError> {
        Self::require_admin(&caller, "adjust GP counts")?;
        let m = self
            .mutate::<Participant, _, _>(target, None, |p| {
                Ok(participant::adjust_gps_found(p, delta))
            })
            .await?;
        info!(participant = %target, delta, gps_found = m.outcome, by = %caller.id, "GP count adjusted");
        Ok(m.outcome)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// One participant.
    pub async fn get_participant(&self, id: ParticipantId) -> Result<Participant, EngineError> {
        self.entities
            .get_participant(id)
            .await?
            .map(|v| v.value)
            .ok_or(EngineError::NotFound {
                key: EntityKey::Participant(id),
            })
    }

    /// Participant ids grouped by status. Every status has an entry.
    pub async fn list_participants_by_status(&self) -> Result<RosterByStatus, EngineError> {
        let mut roster: RosterByStatus = ParticipantStatus::ALL
            .into_iter()
            .map(|s| (s, Vec::new()))
            .collect();
        for p in self.entities.list_participants().await? {
            roster.entry(p.status).or_default().push(p.id);
        }
        Ok(roster)
    }

    /// Participants counted in active rosters and eligible for GP testing.
    pub async fn eligible_participants(&self) -> Result<Vec<Participant>, EngineError> {
        Ok(self
            .entities
            .list_participants()
            .await?
            .into_iter()
            .filter(Participant::is_eligible)
            .collect())
    }

    /// One God Pack.
    pub async fn get_god_pack(&self, id: GodPackId) -> Result<GodPack, EngineError> {
        self.entities
            .get_god_pack(id)
            .await?
            .map(|v| v.value)
            .ok_or(EngineError::NotFound {
                key: EntityKey::GodPack(id),
            })
    }

    /// God Packs with the given status.
    pub async fn list_god_packs_by_status(&self, status: VerificationStatus) -> Result<Vec<GodPack>, EngineError> {
        Ok(self
            .entities
            .list_god_packs()
            .await?
            .into_iter()
            .filter(|gp| gp.status == status)
            .collect())
    }

    /// Pending God Packs nobody has tested yet.
    pub async fn list_untested_god_packs(&self) -> Result<Vec<GodPack>, EngineError> {
        Ok(self
            .entities
            .list_god_packs()
            .await?
            .into_iter()
            .filter(GodPack::is_untested)
            .collect())
    }

    /// Ledger, probability and outcome counts of a God Pack, derived by
    /// replaying its ledger.
    pub async fn test_summary(&self, id: GodPackId) -> Result<TestSummary, EngineError> {
        let gp = self.get_god_pack(id).await?;
        Ok(gp_tracking::summary(&gp, self.config.testing.noshow_floor))
    }

    /// Snapshots with `start <= bucket_start < end`, oldest first,
    /// optionally merged into `bucket_secs` buckets.
    pub async fn timeline_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket_secs: Option<u64>,
    ) -> Result<Vec<TimelineSnapshot>, EngineError> {
        if end < start {
            return Err(ValidationError::InvalidRange {
                reason: format!("end {end} is before start {start}"),
            }
            .into());
        }
        let snapshots = self.timeline.snapshots_between(start, end).await?;
        match bucket_secs {
            None => Ok(snapshots),
            Some(0) => Err(ValidationError::InvalidRange {
                reason: "bucket size must be at least one second".to_owned(),
            }
            .into()),
            Some(size) => Ok(statistics::rebucket(&snapshots, size)?),
        }
    }

    // -----------------------------------------------------------------------
    // Scheduler
    // -----------------------------------------------------------------------

    /// Run one scheduler tick: sweep every participant, expire overdue God
    /// Packs, then snapshot if the current bucket has no snapshot yet.
    ///
    /// A participant or pack whose update fails is logged and retried next
    /// tick. A failed snapshot fails the tick.
    pub async fn run_tick(&self, plan: TickPlan) -> Result<TickReport, EngineError> {
        let monitor = &self.config.monitor;
        let mut report = TickReport {
            tick: plan.tick,
            ..TickReport::default()
        };

        for listed in self.entities.list_participants().await? {
            let mut preview = listed.clone();
            if heartbeat::sweep(&mut preview, plan.now, monitor).is_quiet() {
                continue;
            }

            let result = self
                .mutate::<Participant, _, _>(listed.id, None, |p| {
                    Ok(heartbeat::sweep(p, plan.now, monitor))
                })
                .await;
            let m = match result {
                Ok(m) => m,
                Err(EngineError::NotFound { .. }) => continue,
                Err(err) => {
                    warn!(tick = plan.tick, participant = %listed.id, %err, "Sweep failed");
                    report.failures = report.failures.saturating_add(1);
                    continue;
                }
            };

            if let Some(change) = m.outcome.demoted {
                info!(tick = plan.tick, participant = %listed.id, from = %change.from, "Demoted to inactive after silence");
                report.demoted = report.demoted.saturating_add(1);
                self.emit(plan.now, NotificationKind::StatusChanged(change));
            }
            if m.outcome.flagged {
                let silent_since = m.entity.silence_reference();
                info!(tick = plan.tick, participant = %listed.id, ?silent_since, "Flagged for removal");
                report.flagged = report.flagged.saturating_add(1);
                self.emit(
                    plan.now,
                    NotificationKind::FlaggedForRemoval {
                        participant_id: listed.id,
                        silent_since,
                    },
                );
            }
        }

        if self.config.expiration.enabled {
            self.expire_god_packs(plan, &mut report).await?;
        }

        if let Some(bucket) = plan.aggregate_bucket {
            let (snapshot, written) = self.aggregate(bucket).await?;
            report.snapshot = Some(snapshot);
            report.snapshot_written = written;
        }

        let live_locks = self.locks.prune();
        debug!(tick = plan.tick, live_locks, "Tick complete");
        Ok(report)
    }

    async fn expire_god_packs(&self, plan: TickPlan, report: &mut TickReport) -> Result<(), EngineError> {
        let window = self.config.expiration.warning_window_secs;
        for listed in self.entities.list_god_packs().await? {
            let mut preview = listed.clone();
            if expiration::check(&mut preview, plan.now, window).is_quiet() {
                continue;
            }

            let result = self
                .mutate::<GodPack, _, _>(listed.id, None, |gp| Ok(expiration::check(gp, plan.now, window)))
                .await;
            let outcome = match result {
                Ok(m) => m.outcome,
                Err(EngineError::NotFound { .. }) => continue,
                Err(err) => {
                    warn!(tick = plan.tick, gp = %listed.id, %err, "Expiry check failed");
                    report.failures = report.failures.saturating_add(1);
                    continue;
                }
            };

            match outcome {
                ExpiryCheck::Quiet => {}
                ExpiryCheck::ExpiringSoon { expires_at } => {
                    info!(tick = plan.tick, gp = %listed.id, %expires_at, "God Pack expiring soon");
                    report.expiring_soon = report.expiring_soon.saturating_add(1);
                    self.emit(
                        plan.now,
                        NotificationKind::GodPackExpiringSoon {
                            gp_id: listed.id,
                            expires_at,
                        },
                    );
                }
                ExpiryCheck::Expired { expires_at } => {
                    info!(tick = plan.tick, gp = %listed.id, %expires_at, "God Pack expired");
                    report.expired = report.expired.saturating_add(1);
                    self.emit(
                        plan.now,
                        NotificationKind::GodPackExpired {
                            gp_id: listed.id,
                            expires_at,
                            forced_by: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Snapshot the current state into the bucket starting at `bucket`.
    ///
    /// Returns the snapshot and whether it was stored; a bucket that
    /// already has a snapshot keeps the original.
    pub async fn aggregate(&self, bucket: DateTime<Utc>) -> Result<(TimelineSnapshot, bool), EngineError> {
        let participants = self.entities.list_participants().await?;
        let god_packs = self.entities.list_god_packs().await?;
        let previous = self.timeline.latest_snapshot_before(bucket).await?;

        let transitions = self.tally.take();
        let snapshot = statistics::build_snapshot(
            bucket,
            &participants,
            &god_packs,
            previous.as_ref(),
            transitions,
        );
        let written = match self.timeline.insert_snapshot(&snapshot).await {
            Ok(written) => written,
            Err(err) => {
                self.tally.add(transitions);
                return Err(err.into());
            }
        };
        if written {
            debug!(
                bucket = %bucket,
                active = snapshot.participants.active,
                packs = snapshot.packs_in_bucket,
                transitions,
                "Timeline snapshot written"
            );
        } else {
            self.tally.add(transitions);
            debug!(bucket = %bucket, "Timeline bucket already snapshotted");
        }
        Ok((snapshot, written))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use reroll_types::ReportedFields;

    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::CollectingSink;
    use crate::store::MemoryStore;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    /// Store that loses the first `failures` participant writes to a
    /// simulated concurrent writer.
    struct RacyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl EntityStore for RacyStore {
        async fn get_participant(&self, id: ParticipantId) -> Result<Option<Versioned<Participant>>, StoreError> {
            self.inner.get_participant(id).await
        }

        async fn put_participant(&self, p: &Participant, expected: Option<u64>) -> Result<u64, StoreError> {
            let lose = self
                .failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if lose {
                return Err(StoreError::VersionConflict {
                    key: EntityKey::Participant(p.id),
                    expected: expected.unwrap_or(0),
                    actual: None,
                });
            }
            self.inner.put_participant(p, expected).await
        }

        async fn list_participants(&self) -> Result<Vec<Participant>, StoreError> {
            self.inner.list_participants().await
        }

        async fn get_god_pack(&self, id: GodPackId) -> Result<Option<Versioned<GodPack>>, StoreError> {
            self.inner.get_god_pack(id).await
        }

        async fn put_god_pack(&self, gp: &GodPack, expected: Option<u64>) -> Result<u64, StoreError> {
            self.inner.put_god_pack(gp, expected).await
        }

        async fn list_god_packs(&self) -> Result<Vec<GodPack>, StoreError> {
            self.inner.list_god_packs().await
        }
    }

    fn engine_with(entities: Arc<dyn EntityStore>) -> (Engine, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let engine = Engine::new(
            RerollConfig::default(),
            entities,
            Arc::new(MemoryStore::new()),
            sink.clone(),
            Arc::new(ManualClock::new(at(0))),
        )
        .unwrap();
        (engine, sink)
    }

    fn heartbeat(id: u64, instance: &str, secs: i64) -> HeartbeatReport {
        HeartbeatReport {
            participant_id: ParticipantId::new(id),
            instance_name: instance.to_owned(),
            timestamp: at(secs),
            fields: ReportedFields {
                online_instances: Some(vec!["1".to_owned()]),
                packs_opened_delta: Some(1),
                ..ReportedFields::default()
            },
        }
    }

    #[tokio::test]
    async fn invalid_config_refused() {
        let mut config = RerollConfig::default();
        config.store.max_write_attempts = 0;
        let store = Arc::new(MemoryStore::new());
        let result = Engine::new(
            config,
            store.clone(),
            store,
            Arc::new(CollectingSink::new()),
            Arc::new(ManualClock::new(at(0))),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn lost_races_are_retried() {
        let store = Arc::new(RacyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(2),
        });
        let (engine, _) = engine_with(store);
        engine.ingest_heartbeat(heartbeat(1, "1", 0)).await.unwrap();
        let p = engine.get_participant(ParticipantId::new(1)).await.unwrap();
        assert_eq!(p.packs_opened, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_conflict_without_side_effects() {
        let store = Arc::new(RacyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(100),
        });
        let (engine, sink) = engine_with(store);
        let err = engine.ingest_heartbeat(heartbeat(1, "1", 0)).await.unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict { attempts: 5, .. }));
        assert!(err.is_transient());
        assert!(sink.is_empty());
        assert!(engine.get_participant(ParticipantId::new(1)).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_heartbeats_lose_no_updates() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let engine = Arc::new(engine);
        let mut handles = Vec::new();
        for i in 0..20_i64 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.ingest_heartbeat(heartbeat(1, &format!("inst{i}"), i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let p = engine.get_participant(ParticipantId::new(1)).await.unwrap();
        assert_eq!(p.packs_opened, 20);
        assert_eq!(p.instances.len(), 20);
    }

    #[tokio::test]
    async fn locks_are_pruned_when_idle() {
        let locks = EntityLocks::new();
        let key = EntityKey::Participant(ParticipantId::new(1));
        let guard = locks.acquire(key).await;
        assert_eq!(locks.prune(), 1);
        drop(guard);
        assert_eq!(locks.prune(), 0);
    }

    #[tokio::test]
    async fn discovery_is_idempotent() {
        let (engine, sink) = engine_with(Arc::new(MemoryStore::new()));
        let id = GodPackId::new(5);
        engine.discover_god_pack(id, ParticipantId::new(1), at(0), 2).await.unwrap();
        let again = engine.discover_god_pack(id, ParticipantId::new(2), at(10), 1).await.unwrap();
        assert_eq!(again.discovered_by, ParticipantId::new(1));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn members_cannot_reset_or_adjust() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let member = Caller::member(ParticipantId::new(1));
        let err = engine.reset_test(member, GodPackId::new(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied { .. }));
        let err = engine
            .adjust_gp_found_count(member, ParticipantId::new(1), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn setting_unknown_other_participant_is_not_found() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let err = engine
            .set_status(Caller::admin(ParticipantId::new(1)), ParticipantId::new(2), ParticipantStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let me = engine
            .set_status(Caller::member(ParticipantId::new(3)), ParticipantId::new(3), ParticipantStatus::Farm)
            .await
            .unwrap();
        assert_eq!(me.status, ParticipantStatus::Farm);
    }

    #[tokio::test]
    async fn zero_bucket_size_rejected() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let err = engine.timeline_range(at(0), at(10), Some(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn future_heartbeat_is_refused_without_side_effects() {
        let (engine, sink) = engine_with(Arc::new(MemoryStore::new()));
        let err = engine
            .ingest_heartbeat(heartbeat(1, "1", 1_000_000_000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::FutureTimestamp { max_skew_secs: 300, .. })
        ));
        assert!(sink.is_empty());
        assert!(engine.get_participant(ParticipantId::new(1)).await.is_err());

        // Small skew between machines is tolerated.
        engine.ingest_heartbeat(heartbeat(1, "1", 300)).await.unwrap();
    }

    #[tokio::test]
    async fn pack_count_must_be_one_to_five() {
        let (engine, sink) = engine_with(Arc::new(MemoryStore::new()));
        for bad in [0_u8, 6, 200] {
            let err = engine
                .discover_god_pack(GodPackId::new(1), ParticipantId::new(1), at(0), bad)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                EngineError::Validation(ValidationError::InvalidPackCount { pack_count }) if pack_count == bad
            ));
        }
        assert!(sink.is_empty());
        for good in 1..=5_u8 {
            let id = GodPackId::new(u64::from(good));
            let gp = engine.discover_god_pack(id, ParticipantId::new(1), at(0), good).await.unwrap();
            assert_eq!(gp.pack_count, good);
        }
    }

    #[tokio::test]
    async fn overdue_packs_expire_on_tick() {
        let (engine, sink) = engine_with(Arc::new(MemoryStore::new()));
        let gp = engine
            .discover_god_pack(GodPackId::new(2), ParticipantId::new(1), at(0), 1)
            .await
            .unwrap();
        let deadline = gp.expires_at.unwrap();
        assert_eq!(deadline, at(280_800));

        let plan = |tick, now| TickPlan {
            tick,
            now,
            aggregate_bucket: None,
        };
        let report = engine.run_tick(plan(1, at(280_800 - 3_600))).await.unwrap();
        assert_eq!(report.expiring_soon, 1);
        let report = engine.run_tick(plan(2, at(280_800 - 60))).await.unwrap();
        assert_eq!(report.expiring_soon, 0);

        let report = engine.run_tick(plan(3, deadline)).await.unwrap();
        assert_eq!(report.expired, 1);
        let stored = engine.get_god_pack(GodPackId::new(2)).await.unwrap();
        assert_eq!(stored.status, VerificationStatus::Dead);
        assert_eq!(stored.expired_at, Some(deadline));
        assert_eq!(engine.run_tick(plan(4, at(400_000))).await.unwrap().expired, 0);

        let kinds: Vec<&str> = sink.notifications().iter().map(|n| n.kind.name()).collect();
        assert_eq!(kinds, vec!["gp_discovered", "gp_expiring_soon", "gp_expired"]);
    }

    #[tokio::test]
    async fn expiry_can_be_switched_off() {
        let mut config = RerollConfig::default();
        config.expiration.enabled = false;
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(
            config,
            store.clone(),
            store,
            Arc::new(CollectingSink::new()),
            Arc::new(ManualClock::new(at(0))),
        )
        .unwrap();
        engine
            .discover_god_pack(GodPackId::new(2), ParticipantId::new(1), at(0), 1)
            .await
            .unwrap();
        let report = engine
            .run_tick(TickPlan {
                tick: 1,
                now: at(10_000_000),
                aggregate_bucket: None,
            })
            .await
            .unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(
            engine.get_god_pack(GodPackId::new(2)).await.unwrap().status,
            VerificationStatus::Pending
        );
    }
}
