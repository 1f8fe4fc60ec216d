//! Timeline snapshot persistence.
//!
//! One row per aggregation bucket, keyed by the bucket start. Inserts use
//! `ON CONFLICT DO NOTHING`, so a bucket that was already written (by a
//! restarted or concurrent engine) keeps its first snapshot. The full
//! snapshot lives in a JSONB column; a handful of headline counters are
//! broken out for ad-hoc queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reroll_core::store::{StoreError, TimelineStore};
use reroll_types::TimelineSnapshot;
use sqlx::PgPool;

use crate::error::DbError;

/// Operations on the `timeline_snapshots` table.
#[derive(Debug, Clone)]
pub struct PgTimelineStore {
    pool: PgPool,
}

impl PgTimelineStore {
    /// Create a timeline store on a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, snapshot: &TimelineSnapshot) -> Result<bool, DbError> {
        let counts = snapshot.participants;
        let active_count = i64::from(counts.active)
            .saturating_add(i64::from(counts.farm))
            .saturating_add(i64::from(counts.leech));
        let body = serde_json::to_value(snapshot)?;

        let result = sqlx::query(
            r"INSERT INTO timeline_snapshots
              (bucket_start, active_count, total_packs_opened, packs_in_bucket,
               total_gps_found, gps_in_bucket, snapshot)
              VALUES ($1, $2, $3, $4, $5, $6, $7)
              ON CONFLICT (bucket_start) DO NOTHING",
        )
        .bind(snapshot.bucket_start)
        .bind(active_count)
        .bind(to_i64(snapshot.total_packs_opened))
        .bind(to_i64(snapshot.packs_in_bucket))
        .bind(to_i64(snapshot.total_gps_found))
        .bind(to_i64(snapshot.gps_in_bucket))
        .bind(&body)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        tracing::debug!(bucket = %snapshot.bucket_start, inserted, "Timeline snapshot write");
        Ok(inserted)
    }

    async fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineSnapshot>, DbError> {
        let rows = sqlx::query_as::<_, TimelineRow>(
            r"SELECT bucket_start, snapshot
              FROM timeline_snapshots
              WHERE bucket_start >= $1 AND bucket_start < $2
              ORDER BY bucket_start ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TimelineRow::into_snapshot).collect()
    }

    async fn latest_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Option<TimelineSnapshot>, DbError> {
        let row = sqlx::query_as::<_, TimelineRow>(
            r"SELECT bucket_start, snapshot
              FROM timeline_snapshots
              WHERE bucket_start < $1
              ORDER BY bucket_start DESC
              LIMIT 1",
        )
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TimelineRow::into_snapshot).transpose()
    }
}

#[async_trait]
impl TimelineStore for PgTimelineStore {
    async fn insert_snapshot(&self, snapshot: &TimelineSnapshot) -> Result<bool, StoreError> {
        Ok(self.insert(snapshot).await?)
    }

    async fn snapshots_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineSnapshot>, StoreError> {
        Ok(self.between(start, end).await?)
    }

    async fn latest_snapshot_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Option<TimelineSnapshot>, StoreError> {
        Ok(self.latest_before(before).await?)
    }
}

/// A row from the `timeline_snapshots` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimelineRow {
    /// Bucket the snapshot belongs to.
    pub bucket_start: DateTime<Utc>,
    /// The full snapshot as JSON.
    pub snapshot: serde_json::Value,
}

impl TimelineRow {
    /// Decode the JSONB body, checking it agrees with the row key.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the body does not decode and
    /// [`DbError::Corrupt`] if it names a different bucket.
    pub fn into_snapshot(self) -> Result<TimelineSnapshot, DbError> {
        let snapshot: TimelineSnapshot = serde_json::from_value(self.snapshot)?;
        if snapshot.bucket_start != self.bucket_start {
            return Err(DbError::Corrupt {
                key: format!("timeline_snapshots:{}", self.bucket_start),
                reason: format!("body names bucket {}", snapshot.bucket_start),
            });
        }
        Ok(snapshot)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
