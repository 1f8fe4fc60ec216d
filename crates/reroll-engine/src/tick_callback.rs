//! Tick callback that reports scheduler progress.
//!
//! Quiet ticks are logged at `trace`; ticks that demoted, flagged,
//! expired packs or snapshotted are logged at `info` and, when NATS is connected, published
//! on `reroll.tick`.

use reroll_core::TickReport;
use reroll_core::runner::TickCallback;
use tracing::{info, trace, warn};

/// Subject non-quiet tick reports are published on.
pub const TICK_SUBJECT: &str = "reroll.tick";

/// Callback that logs and publishes tick reports.
pub struct TickReporter {
    nats: Option<async_nats::Client>,
}

impl TickReporter {
    /// Create a reporter, publishing through `nats` when given.
    pub const fn new(nats: Option<async_nats::Client>) -> Self {
        Self { nats }
    }
}

/// Whether a tick did anything worth reporting.
pub const fn is_eventful(report: &TickReport) -> bool {
    report.demoted > 0
        || report.flagged > 0
        || report.expiring_soon > 0
        || report.expired > 0
        || report.failures > 0
        || report.snapshot.is_some()
}

impl TickCallback for TickReporter {
    fn on_tick(&mut self, report: &TickReport) {
        if !is_eventful(report) {
            trace!(tick = report.tick, "Quiet tick");
            return;
        }

        info!(
            tick = report.tick,
            demoted = report.demoted,
            flagged = report.flagged,
            expiring_soon = report.expiring_soon,
            expired = report.expired,
            failures = report.failures,
            bucket = report.snapshot.as_ref().map(|s| s.bucket_start.to_rfc3339()),
            snapshot_written = report.snapshot_written,
            "Tick complete"
        );

        let Some(client) = self.nats.clone() else {
            return;
        };
        match serde_json::to_vec(report) {
            Ok(payload) => {
                tokio::spawn(async move {
                    if let Err(e) = client.publish(TICK_SUBJECT, payload.into()).await {
                        warn!(error = %e, "Failed to publish tick report");
                    }
                });
            }
            Err(e) => warn!(tick = report.tick, error = %e, "Failed to encode tick report"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::DateTime;
    use reroll_types::TimelineSnapshot;

    use super::*;

    fn quiet(tick: u64) -> TickReport {
        TickReport {
            tick,
            ..TickReport::default()
        }
    }

    #[test]
    fn eventful_ticks_are_detected() {
        assert!(!is_eventful(&quiet(1)));
        assert!(is_eventful(&TickReport {
            demoted: 1,
            ..quiet(2)
        }));
        assert!(is_eventful(&TickReport {
            snapshot: Some(TimelineSnapshot::empty(DateTime::from_timestamp(0, 0).unwrap())),
            ..quiet(3)
        }));
        assert!(is_eventful(&TickReport {
            expired: 1,
            ..quiet(5)
        }));
        assert!(is_eventful(&TickReport {
            expiring_soon: 2,
            ..quiet(6)
        }));
    }

    #[test]
    fn reporter_without_nats_only_logs() {
        let mut reporter = TickReporter::new(None);
        reporter.on_tick(&TickReport {
            flagged: 2,
            ..quiet(4)
        });
    }
}
