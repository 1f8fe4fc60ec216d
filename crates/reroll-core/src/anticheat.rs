//! Anti-cheat evaluator.
//!
//! A stateless classifier over one heartbeat report and the instance state
//! it replaces. It only produces advisory flags: the report is ingested
//! regardless and no participant or GP state is touched here.

use reroll_types::{AntiCheatFlag, AntiCheatRule, HeartbeatReport, Instance};

use crate::config::AntiCheatConfig;

/// Evaluate one report against the plausibility bounds.
///
/// `previous` is the instance as it was before this report, `None` for an
/// instance's first report. `declared_instances` is the participant's
/// declared average instance count, if they gave one.
#[allow(clippy::cast_precision_loss)]
pub fn evaluate(
    previous: Option<&Instance>,
    report: &HeartbeatReport,
    declared_instances: Option<u32>,
    config: &AntiCheatConfig,
) -> Vec<AntiCheatFlag> {
    let mut flags = Vec::new();
    if !config.enabled {
        return flags;
    }
    let mut flag = |rule, observed: f64, limit: f64| {
        flags.push(AntiCheatFlag {
            participant_id: report.participant_id,
            instance_name: report.instance_name.clone(),
            rule,
            observed,
            limit,
            at: report.timestamp,
        });
    };

    if let Some(prev) = previous {
        let elapsed_ms = report
            .timestamp
            .signed_duration_since(prev.last_seen)
            .num_milliseconds();
        let elapsed_secs = elapsed_ms as f64 / 1000.0;
        let min_interval = config.min_report_interval_secs as f64;
        if elapsed_secs < min_interval {
            flag(AntiCheatRule::ReportTooFrequent, elapsed_secs, min_interval);
        }

        let delta = report.fields.packs_opened_delta.unwrap_or(0);
        let online = report.fields.online_count().max(1) as f64;
        if elapsed_secs > 0.0 && delta > 0 {
            let per_instance = delta as f64 / (elapsed_secs / 60.0) / online;
            if per_instance > config.max_plausible_throughput {
                flag(
                    AntiCheatRule::ThroughputExceeded,
                    per_instance,
                    config.max_plausible_throughput,
                );
            }
        }
    }

    if let Some(declared) = report.fields.average_throughput
        && declared > config.max_plausible_throughput
    {
        flag(
            AntiCheatRule::DeclaredThroughputExceeded,
            declared,
            config.max_plausible_throughput,
        );
    }

    if let Some(declared) = declared_instances {
        let limit = declared.saturating_add(config.instance_count_tolerance);
        let online = report.fields.online_count();
        if u32::try_from(online).ok().is_none_or(|n| n > limit) {
            flag(
                AntiCheatRule::InstanceCountExceeded,
                online as f64,
                f64::from(limit),
            );
        }
    }

    flags
}
