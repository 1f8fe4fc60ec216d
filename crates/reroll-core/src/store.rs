//! Persistent store abstraction with per-key optimistic concurrency.
//!
//! Every entity record carries a version. Writers read a record, decide,
//! and write back with the version they read; the store refuses the write
//! if someone else got there first. [`MemoryStore`] is the process-local
//! implementation used by tests and the `memory` backend.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reroll_types::{GodPack, GodPackId, Participant, ParticipantId, TimelineSnapshot};
use tokio::sync::RwLock;

/// Errors returned by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stored version differs from the one the writer read.
    #[error("version conflict on {key}: expected {expected}, found {actual:?}")]
    VersionConflict {
        /// The contended key.
        key: EntityKey,
        /// Version the writer read.
        expected: u64,
        /// Version actually stored, `None` if the record vanished.
        actual: Option<u64>,
    },

    /// A create raced with another create of the same key.
    #[error("{key} already exists")]
    AlreadyExists {
        /// The contended key.
        key: EntityKey,
    },

    /// The backend failed (connection, query, timeout).
    #[error("store backend error: {message}")]
    Backend {
        /// Backend-specific description.
        message: String,
    },

    /// A record could not be encoded or decoded.
    #[error("store serialization error: {message}")]
    Serialization {
        /// Codec-specific description.
        message: String,
    },
}

impl StoreError {
    /// Whether a retry of the whole read-modify-write might succeed.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::AlreadyExists { .. })
    }
}

/// Address of one serialized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    /// A participant record.
    Participant(ParticipantId),
    /// A God Pack record.
    GodPack(GodPackId),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Participant(id) => write!(f, "participant:{id}"),
            Self::GodPack(id) => write!(f, "gp:{id}"),
        }
    }
}

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// Monotonic per-key version, starting at 1.
    pub version: u64,
    /// The record.
    pub value: T,
}

/// Key-addressable store for participants and God Packs.
///
/// `put_*` with `expected == None` creates the record and fails with
/// [`StoreError::AlreadyExists`] if it is present. With `Some(v)` it
/// replaces the record only if its stored version is still `v`, and fails
/// with [`StoreError::VersionConflict`] otherwise. Both return the new
/// version.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Read one participant.
    async fn get_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<Versioned<Participant>>, StoreError>;

    /// Write one participant, checking its version.
    async fn put_participant(
        &self,
        participant: &Participant,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Every participant, ordered by id.
    async fn list_participants(&self) -> Result<Vec<Participant>, StoreError>;

    /// Read one God Pack.
    async fn get_god_pack(&self, id: GodPackId) -> Result<Option<Versioned<GodPack>>, StoreError>;

    /// Write one God Pack, checking its version.
    async fn put_god_pack(&self, gp: &GodPack, expected: Option<u64>) -> Result<u64, StoreError>;

    /// Every God Pack, ordered by id.
    async fn list_god_packs(&self) -> Result<Vec<GodPack>, StoreError>;
}

/// Append-only series of timeline snapshots keyed by bucket start.
#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Insert a snapshot unless its bucket already has one.
    ///
    /// Returns `false` when the bucket was already taken.
    async fn insert_snapshot(&self, snapshot: &TimelineSnapshot) -> Result<bool, StoreError>;

    /// Snapshots with `start <= bucket_start < end`, oldest first.
    async fn snapshots_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineSnapshot>, StoreError>;

    /// The newest snapshot strictly before `before`.
    async fn latest_snapshot_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Option<TimelineSnapshot>, StoreError>;
}

/// Process-local store backed by ordered maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    participants: RwLock<BTreeMap<ParticipantId, Versioned<Participant>>>,
    god_packs: RwLock<BTreeMap<GodPackId, Versioned<GodPack>>>,
    snapshots: RwLock<BTreeMap<DateTime<Utc>, TimelineSnapshot>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_and_put<K: Ord + Copy, T: Clone>(
    map: &mut BTreeMap<K, Versioned<T>>,
    id: K,
    key: EntityKey,
    value: &T,
    expected: Option<u64>,
) -> Result<u64, StoreError> {
    let current = map.get(&id).map(|v| v.version);
    let next = match (expected, current) {
        (None, None) => 1,
        (None, Some(_)) => return Err(StoreError::AlreadyExists { key }),
        (Some(expected), actual) if actual != Some(expected) => {
            return Err(StoreError::VersionConflict {
                key,
                expected,
                actual,
            });
        }
        (Some(expected), _) => expected.saturating_add(1),
    };
    map.insert(
        id,
        Versioned {
            version: next,
            value: value.clone(),
        },
    );
    Ok(next)
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<Versioned<Participant>>, StoreError> {
        Ok(self.participants.read().await.get(&id).cloned())
    }

    async fn put_participant(
        &self,
        participant: &Participant,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut map = self.participants.write().await;
        check_and_put(
            &mut map,
            participant.id,
            EntityKey::Participant(participant.id),
            participant,
            expected,
        )
    }

    async fn list_participants(&self) -> Result<Vec<Participant>, StoreError> {
        Ok(self
            .participants
            .read()
            .await
            .values()
            .map(|v| v.value.clone())
            .collect())
    }

    async fn get_god_pack(&self, id: GodPackId) -> Result<Option<Versioned<GodPack>>, StoreError> {
        Ok(self.god_packs.read().await.get(&id).cloned())
    }

    async fn put_god_pack(&self, gp: &GodPack, expected: Option<u64>) -> Result<u64, StoreError> {
        let mut map = self.god_packs.write().await;
        check_and_put(&mut map, gp.id, EntityKey::GodPack(gp.id), gp, expected)
    }

    async fn list_god_packs(&self) -> Result<Vec<GodPack>, StoreError> {
        Ok(self
            .god_packs
            .read()
            .await
            .values()
            .map(|v| v.value.clone())
            .collect())
    }
}

#[async_trait]
impl TimelineStore for MemoryStore {
    async fn insert_snapshot(&self, snapshot: &TimelineSnapshot) -> Result<bool, StoreError> {
        let mut map = self.snapshots.write().await;
        if map.contains_key(&snapshot.bucket_start) {
            return Ok(false);
        }
        map.insert(snapshot.bucket_start, snapshot.clone());
        Ok(true)
    }

    async fn snapshots_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineSnapshot>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }
        Ok(self
            .snapshots
            .read()
            .await
            .range(start..end)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn latest_snapshot_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Option<TimelineSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .await
            .range(..before)
            .next_back()
            .map(|(_, s)| s.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn snapshot(secs: i64) -> TimelineSnapshot {
        TimelineSnapshot::empty(at(secs))
    }

    #[tokio::test]
    async fn create_then_versioned_update() {
        let store = MemoryStore::new();
        let mut p = Participant::new(ParticipantId::new(1), at(0));

        assert_eq!(store.put_participant(&p, None).await.unwrap(), 1);
        p.packs_opened = 10;
        assert_eq!(store.put_participant(&p, Some(1)).await.unwrap(), 2);

        let stored = store.get_participant(p.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.value.packs_opened, 10);
    }

    #[tokio::test]
    async fn stale_version_is_refused() {
        let store = MemoryStore::new();
        let p = Participant::new(ParticipantId::new(1), at(0));
        store.put_participant(&p, None).await.unwrap();
        store.put_participant(&p, Some(1)).await.unwrap();

        let err = store.put_participant(&p, Some(1)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                actual: Some(2),
                ..
            }
        ));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn double_create_is_refused() {
        let store = MemoryStore::new();
        let gp = GodPack::discovered(GodPackId::new(9), ParticipantId::new(1), at(0), 1);
        store.put_god_pack(&gp, None).await.unwrap();
        let err = store.put_god_pack(&gp, None).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn listing_is_ordered_by_id() {
        let store = MemoryStore::new();
        for id in [3_u64, 1, 2] {
            let p = Participant::new(ParticipantId::new(id), at(0));
            store.put_participant(&p, None).await.unwrap();
        }
        let ids: Vec<u64> = store
            .list_participants()
            .await
            .unwrap()
            .iter()
            .map(|p| p.id.get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn snapshot_bucket_is_written_once() {
        let store = MemoryStore::new();
        assert!(store.insert_snapshot(&snapshot(300)).await.unwrap());
        assert!(!store.insert_snapshot(&snapshot(300)).await.unwrap());
        assert_eq!(store.snapshots_between(at(0), at(900)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_range_is_half_open() {
        let store = MemoryStore::new();
        for secs in [0, 300, 600, 900] {
            store.insert_snapshot(&snapshot(secs)).await.unwrap();
        }
        let got = store.snapshots_between(at(300), at(900)).await.unwrap();
        let starts: Vec<_> = got.iter().map(|s| s.bucket_start).collect();
        assert_eq!(starts, vec![at(300), at(600)]);

        let latest = store.latest_snapshot_before(at(600)).await.unwrap().unwrap();
        assert_eq!(latest.bucket_start, at(300));
        assert!(store.latest_snapshot_before(at(0)).await.unwrap().is_none());
    }
}
