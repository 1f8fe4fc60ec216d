//! Activity and verification engine for the reroll community.
//!
//! This crate owns every decision the system makes: who counts as active,
//! when silence demotes or removes a participant, what a God Pack's test
//! ledger says about whether it is live, and what the activity timeline
//! looks like. Persistence, message transport and chat formatting live
//! behind the traits in [`store`] and [`notify`].
//!
//! # Modules
//!
//! - [`clock`] -- Scheduler clock, time sources, bucket arithmetic
//! - [`config`] -- YAML configuration and startup validation
//! - [`error`] -- Engine and validation errors
//! - [`participant`] -- Participant status state machine and permissions
//! - [`heartbeat`] -- Heartbeat ingestion and the staleness sweep
//! - [`anticheat`] -- Plausibility checks on heartbeat reports
//! - [`probability`] -- Live-probability model, confidence, recommendations
//! - [`gp_tracking`] -- God Pack test ledger
//! - [`expiration`] -- God Pack expiry deadlines
//! - [`statistics`] -- Timeline snapshots and re-bucketing
//! - [`store`] -- Versioned entity and timeline stores
//! - [`notify`] -- Notification sinks
//! - [`engine`] -- Per-entity serialized commands, queries and ticks
//! - [`command`] -- Tagged command enum and JSON dispatch
//! - [`runner`] -- Scheduler loop with operator controls

pub mod anticheat;
pub mod clock;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod gp_tracking;
pub mod heartbeat;
pub mod notify;
pub mod participant;
pub mod probability;
pub mod runner;
pub mod statistics;
pub mod store;

pub use command::{Command, dispatch};
pub use config::RerollConfig;
pub use engine::{Engine, Registration, TickReport};
pub use error::{EngineError, ValidationError};
