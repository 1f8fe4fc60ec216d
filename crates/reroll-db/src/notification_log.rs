//! Append-only log of emitted notifications.
//!
//! The engine binary forwards every notification it publishes here so the
//! history survives restarts. Inserts are idempotent on the notification id.

use chrono::{DateTime, Utc};
use reroll_types::Notification;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;

/// Operations on the `notifications` table.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    pool: PgPool,
}

impl NotificationLog {
    /// Create a notification log on a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one notification. Re-appending the same id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the payload does not encode.
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn append(&self, notification: &Notification) -> Result<(), DbError> {
        let payload = serde_json::to_value(&notification.kind)?;

        sqlx::query(
            r"INSERT INTO notifications (id, at, kind, payload)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (id) DO NOTHING",
        )
        .bind(notification.id.into_inner())
        .bind(notification.at)
        .bind(notification.kind.name())
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The most recent notifications, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn recent(&self, limit: i64) -> Result<Vec<NotificationRow>, DbError> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            r"SELECT id, at, kind, payload, created_at
              FROM notifications
              ORDER BY at DESC, id DESC
              LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Notifications of one kind at or after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn of_kind_since(
        &self,
        kind: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<NotificationRow>, DbError> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            r"SELECT id, at, kind, payload, created_at
              FROM notifications
              WHERE kind = $1 AND at >= $2
              ORDER BY at ASC, id ASC",
        )
        .bind(kind)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// A row from the `notifications` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRow {
    /// Notification id.
    pub id: Uuid,
    /// When the underlying state change happened.
    pub at: DateTime<Utc>,
    /// Routing name of the payload.
    pub kind: String,
    /// The payload as JSON.
    pub payload: serde_json::Value,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}
