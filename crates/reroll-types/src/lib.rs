//! Shared type definitions for the reroll activity and verification engine.
//!
//! This crate is the single source of truth for the data model shared by
//! the engine, the persistence layer, and the binary. Types flow downstream
//! to `TypeScript` via `ts-rs` for dashboards.
//!
//! # Modules
//!
//! - [`ids`] -- Participant, God Pack, and event identifiers
//! - [`enums`] -- Statuses, test outcomes, privileges, anti-cheat rules
//! - [`structs`] -- Participants, God Packs, test ledgers, timeline snapshots
//! - [`heartbeat`] -- Heartbeat reports from the ingestion layer
//! - [`events`] -- Notifications emitted by the engine

pub mod enums;
pub mod events;
pub mod heartbeat;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{
    AntiCheatRule, InstanceKind, ParticipantStatus, Privilege, Recommendation, TestOutcome,
    TransitionCause, VerificationStatus,
};
pub use events::{AntiCheatFlag, Notification, NotificationKind, StatusChange};
pub use heartbeat::{HeartbeatReport, ReportedFields};
pub use ids::{EventId, GodPackId, ParticipantId};
pub use structs::{
    Caller, GodPack, Instance, InstanceConfig, OutcomeCounts, Participant, RosterByStatus,
    Session, StatusCounts, TestRecord, TestSummary, TimelineSnapshot, VerificationCounts,
};
