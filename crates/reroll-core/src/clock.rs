//! Scheduler clock and time sources.
//!
//! The scheduler is the single source of tick events. Every tick runs the
//! staleness sweep; a tick that crosses into a new aggregation bucket also
//! asks for a timeline snapshot. Bucket boundaries are derived from wall
//! time, never stored independently, so re-running a tick inside the same
//! bucket never asks for a second snapshot.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

use crate::config::{MonitorConfig, StatisticsConfig};

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// Tick counter would overflow.
    #[error("tick counter overflow: cannot advance beyond u64::MAX")]
    TickOverflow,

    /// Invalid interval configuration (e.g. a zero-second bucket).
    #[error("invalid clock configuration: {reason}")]
    InvalidConfig {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

/// Source of the current time. Injected so tests can drive time by hand.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Create a clock stopped at `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::Release);
    }

    /// Move forward by `secs` seconds (saturating).
    pub fn advance_secs(&self, secs: i64) {
        let delta = secs.saturating_mul(1000);
        let _ = self
            .millis
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| {
                Some(m.saturating_add(delta))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::Acquire)).unwrap_or_default()
    }
}

/// What a single scheduler tick must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    /// Tick number (1-based).
    pub tick: u64,
    /// Time the tick fired.
    pub now: DateTime<Utc>,
    /// Bucket to snapshot, while the current bucket has no snapshot yet.
    pub aggregate_bucket: Option<DateTime<Utc>>,
}

/// Tick counter plus aggregation bucket tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerClock {
    /// Ticks fired so far.
    tick: u64,

    /// Seconds between ticks.
    tick_interval_secs: u64,

    /// Seconds per aggregation bucket.
    aggregation_interval_secs: u64,

    /// Start of the last bucket whose snapshot is known to be stored.
    last_bucket: Option<DateTime<Utc>>,
}

impl SchedulerClock {
    /// Create a scheduler clock from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidConfig`] if either interval is zero.
    pub fn new(monitor: &MonitorConfig, statistics: &StatisticsConfig) -> Result<Self, ClockError> {
        if monitor.tick_interval_secs == 0 {
            return Err(ClockError::InvalidConfig {
                reason: "tick_interval_secs must be at least 1".to_owned(),
            });
        }
        if statistics.aggregation_interval_secs == 0 {
            return Err(ClockError::InvalidConfig {
                reason: "aggregation_interval_secs must be at least 1".to_owned(),
            });
        }
        Ok(Self {
            tick: 0,
            tick_interval_secs: monitor.tick_interval_secs,
            aggregation_interval_secs: statistics.aggregation_interval_secs,
            last_bucket: None,
        })
    }

    /// Fire one tick at `now` and decide whether it snapshots.
    ///
    /// The current bucket is offered on every tick until
    /// [`SchedulerClock::commit_bucket`] records its snapshot, so a failed
    /// write is retried on the next tick of the same bucket.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::TickOverflow`] if the tick counter would exceed
    /// `u64::MAX`, or [`ClockError::InvalidConfig`] if `now` cannot be
    /// bucketed.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<TickPlan, ClockError> {
        self.tick = self.tick.checked_add(1).ok_or(ClockError::TickOverflow)?;
        let bucket = bucket_start(now, self.aggregation_interval_secs)?;

        let aggregate_bucket = if self.last_bucket.is_some_and(|last| last >= bucket) {
            None
        } else {
            Some(bucket)
        };

        Ok(TickPlan {
            tick: self.tick,
            now,
            aggregate_bucket,
        })
    }

    /// Record that `bucket` has a stored snapshot.
    ///
    /// Never moves backwards.
    pub fn commit_bucket(&mut self, bucket: DateTime<Utc>) {
        if self.last_bucket.is_none_or(|last| last < bucket) {
            self.last_bucket = Some(bucket);
        }
    }

    /// Start of the last bucket committed with [`SchedulerClock::commit_bucket`].
    pub const fn last_bucket(&self) -> Option<DateTime<Utc>> {
        self.last_bucket
    }

    /// Return the number of ticks fired so far.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Return the configured tick interval in seconds.
    pub const fn tick_interval_secs(&self) -> u64 {
        self.tick_interval_secs
    }

    /// Return the configured aggregation bucket size in seconds.
    pub const fn aggregation_interval_secs(&self) -> u64 {
        self.aggregation_interval_secs
    }
}

/// Start of the `interval_secs` bucket containing `at`.
///
/// Buckets are aligned to the Unix epoch, so every process agrees on them.
///
/// # Errors
///
/// Returns [`ClockError::InvalidConfig`] if `interval_secs` is zero or too
/// large to bucket with.
pub fn bucket_start(at: DateTime<Utc>, interval_secs: u64) -> Result<DateTime<Utc>, ClockError> {
    let interval = i64::try_from(interval_secs)
        .ok()
        .filter(|i| *i > 0)
        .ok_or_else(|| ClockError::InvalidConfig {
            reason: format!("bucket interval {interval_secs}s is out of range"),
        })?;
    let secs = at.timestamp();
    let offset = secs.rem_euclid(interval);
    let start = secs.saturating_sub(offset);
    DateTime::from_timestamp(start, 0).ok_or_else(|| ClockError::InvalidConfig {
        reason: format!("bucket start {start} is out of range"),
    })
}
