//! Heartbeat reports delivered by the chat ingestion layer.
//!
//! The ingestion layer has already split the raw message into the
//! reporting participant, the instance suffix, a timestamp, and loosely
//! typed fields. Required fields stay optional here so the monitor can
//! reject malformed reports instead of failing deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::ParticipantId;
use crate::structs::InstanceConfig;

/// Fields parsed out of one heartbeat message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(default)]
pub struct ReportedFields {
    /// Sub-instances reported online. Required.
    pub online_instances: Option<Vec<String>>,
    /// Sub-instances reported offline.
    pub offline_instances: Vec<String>,
    /// Whether the main account is running.
    pub main_on: bool,
    /// Packs opened since the previous report from this instance. Required.
    pub packs_opened_delta: Option<u64>,
    /// Minutes the instance has been running.
    pub session_minutes: Option<u64>,
    /// Packs the instance is set to roll.
    pub pack_selection: Vec<String>,
    /// Rolling mode, if reported.
    pub rolling_mode: Option<String>,
    /// Declared average packs per minute.
    pub average_throughput: Option<f64>,
}

impl ReportedFields {
    /// The instance configuration carried by this report.
    pub fn instance_config(&self) -> InstanceConfig {
        InstanceConfig {
            pack_selection: self.pack_selection.clone(),
            rolling_mode: self.rolling_mode.clone(),
            average_throughput: self.average_throughput,
        }
    }

    /// Number of instances reported online, 0 when the field is missing.
    pub fn online_count(&self) -> usize {
        self.online_instances.as_ref().map_or(0, Vec::len)
    }
}

/// A periodic liveness report from one of a participant's instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct HeartbeatReport {
    /// Reporting participant.
    pub participant_id: ParticipantId,
    /// Instance suffix (`Main`, `1`, `2`, ...).
    pub instance_name: String,
    /// When the report was sent.
    pub timestamp: DateTime<Utc>,
    /// Parsed report fields.
    #[serde(default)]
    pub fields: ReportedFields,
}
