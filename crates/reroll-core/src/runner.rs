//! Scheduler loop with operator controls.
//!
//! [`run_scheduler`] fires a tick every `monitor.tick_interval_secs`,
//! letting [`Engine::run_tick`] sweep and snapshot, until a stop is
//! requested or an optional tick limit is reached. Pausing holds the loop
//! without losing its place; a tick missed while paused is simply not run,
//! since every tick re-derives what it has to do from the current time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::clock::{Clock, ClockError, SchedulerClock};
use crate::engine::{Engine, TickReport};
use crate::error::EngineError;

/// Errors that end the scheduler loop.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The scheduler clock could not advance.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },
}

/// Why the scheduler stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`SchedulerControl::request_stop`] was called.
    Requested,
    /// The configured tick limit was reached.
    TickLimit,
}

/// Result of a scheduler run.
#[derive(Debug)]
pub struct SchedulerResult {
    /// Why the loop ended.
    pub reason: StopReason,
    /// Ticks that ran.
    pub total_ticks: u64,
    /// Ticks whose engine work failed.
    pub failed_ticks: u64,
    /// Report of the last successful tick.
    pub last_report: Option<TickReport>,
}

/// Callback invoked after each successful tick.
pub trait TickCallback: Send {
    /// Called with the report of a completed tick.
    fn on_tick(&mut self, report: &TickReport);
}

/// A tick callback that does nothing.
pub struct NoOpCallback;

impl TickCallback for NoOpCallback {
    fn on_tick(&mut self, _report: &TickReport) {}
}

/// Shared control state for a running scheduler.
///
/// Wrapped in [`Arc`] and shared between the loop and whoever controls
/// it (signal handlers, tests).
#[derive(Debug, Default)]
pub struct SchedulerControl {
    /// Whether the loop is paused.
    paused: AtomicBool,

    /// Whether a stop has been requested.
    stop_requested: AtomicBool,

    /// Wakes the loop on resume or stop.
    wake: Notify,

    /// Stop after this many ticks (0 = unlimited).
    max_ticks: u64,
}

impl SchedulerControl {
    /// Create control state with no tick limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create control state that stops after `max_ticks` ticks.
    pub fn with_tick_limit(max_ticks: u64) -> Self {
        Self {
            max_ticks,
            ..Self::default()
        }
    }

    /// Check whether the loop is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Pause the loop before its next tick.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume the loop and wake it.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Request a clean stop and wake the loop.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Check whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Return the tick limit (0 = unlimited).
    pub const fn max_ticks(&self) -> u64 {
        self.max_ticks
    }

    /// Whether `ticks` completed ticks reach the limit.
    pub const fn tick_limit_reached(&self, ticks: u64) -> bool {
        self.max_ticks > 0 && ticks >= self.max_ticks
    }

    /// Sleep for `duration` or until woken by resume/stop.
    async fn sleep(&self, duration: Duration) {
        let woken = self.wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        if self.is_stop_requested() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = woken => {}
        }
    }

    /// Wait while paused, returning early on stop.
    async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_stop_requested() {
            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();
            if !self.is_paused() || self.is_stop_requested() {
                break;
            }
            woken.await;
        }
    }
}

/// Run the scheduler loop until stopped.
///
/// Engine failures within a tick are logged and counted; the loop keeps
/// going. A bucket is committed only once its snapshot is stored, so a
/// failed snapshot is retried by the next tick. Only a clock failure ends
/// the loop early.
///
/// # Errors
///
/// Returns [`RunnerError::Clock`] if the tick counter overflows.
pub async fn run_scheduler(
    engine: &Engine,
    clock: &dyn Clock,
    scheduler: &mut SchedulerClock,
    control: &Arc<SchedulerControl>,
    callback: &mut dyn TickCallback,
) -> Result<SchedulerResult, RunnerError> {
    let interval = Duration::from_secs(scheduler.tick_interval_secs());
    let mut total_ticks: u64 = 0;
    let mut failed_ticks: u64 = 0;
    let mut last_report = None;

    info!(
        tick_interval_secs = scheduler.tick_interval_secs(),
        aggregation_interval_secs = scheduler.aggregation_interval_secs(),
        max_ticks = control.max_ticks(),
        "Scheduler starting"
    );

    loop {
        if control.is_paused() {
            info!("Scheduler paused");
            control.wait_if_paused().await;
            info!("Scheduler resumed");
        }

        if control.is_stop_requested() {
            info!(total_ticks, "Scheduler stop requested");
            return Ok(SchedulerResult {
                reason: StopReason::Requested,
                total_ticks,
                failed_ticks,
                last_report,
            });
        }

        let plan = scheduler.advance(clock.now())?;
        total_ticks = total_ticks.saturating_add(1);
        match engine.run_tick(plan).await {
            Ok(report) => {
                if let Some(snapshot) = &report.snapshot {
                    scheduler.commit_bucket(snapshot.bucket_start);
                }
                callback.on_tick(&report);
                last_report = Some(report);
            }
            Err(err) => {
                failed_ticks = failed_ticks.saturating_add(1);
                log_tick_failure(plan.tick, &err);
            }
        }

        if control.tick_limit_reached(total_ticks) {
            info!(total_ticks, "Tick limit reached");
            return Ok(SchedulerResult {
                reason: StopReason::TickLimit,
                total_ticks,
                failed_ticks,
                last_report,
            });
        }

        control.sleep(interval).await;
    }
}

fn log_tick_failure(tick: u64, err: &EngineError) {
    warn!(tick, code = err.code(), %err, "Tick failed, continuing");
}

/// Log how a scheduler run ended.
pub fn log_scheduler_end(result: &SchedulerResult) {
    info!(
        reason = ?result.reason,
        total_ticks = result.total_ticks,
        failed_ticks = result.failed_ticks,
        last_tick = result.last_report.as_ref().map(|r| r.tick),
        "Scheduler ended"
    );
    if result.last_report.is_none() {
        warn!("Scheduler ended with no successful ticks");
    }
}
