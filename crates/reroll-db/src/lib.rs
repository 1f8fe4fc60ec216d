//! Data layer for the reroll engine (`Dragonfly` + `PostgreSQL`).
//!
//! `Dragonfly` holds the live participant and God Pack records, written
//! under per-key optimistic concurrency. `PostgreSQL` holds what only ever
//! grows: the activity timeline and the notification log.
//!
//! # Architecture (CQRS)
//!
//! ```text
//! Engine command / tick
//!     |
//!     +-- Read/write entities ---> Dragonfly (DragonflyPool: EntityStore)
//!     |
//!     +-- Bucket boundary -------> PostgreSQL (ColdStore)
//!     |                              |-- PgTimelineStore (TimelineStore)
//!     +-- Notification sink ------>  +-- NotificationLog
//! ```
//!
//! # Modules
//!
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) versioned entity store
//! - [`postgres`] -- `PostgreSQL` pool, URL parsing and migrations
//! - [`timeline_store`] -- Timeline snapshot persistence
//! - [`notification_log`] -- Notification history
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod error;
pub mod notification_log;
pub mod postgres;
pub mod timeline_store;

// Re-export primary types for convenience.
pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use notification_log::{NotificationLog, NotificationRow};
pub use postgres::ColdStore;
pub use timeline_store::{PgTimelineStore, TimelineRow};
