//! Telemetry sink seam.
//!
//! The shipper itself (transport, batching, the time-series store) is a
//! collaborator. edgeshift only tells it which instances to ship for and
//! hands it records; delivery is best effort.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use edgeshift_state::InstanceId;

/// Log line or metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Log,
    Metric,
}

/// One structured record emitted by an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub instance_id: InstanceId,
    pub kind: RecordKind,
    /// Unix timestamp (milliseconds).
    pub timestamp_ms: u64,
    pub body: serde_json::Value,
}

/// A downstream log/metric shipper.
pub trait TelemetrySink: Send + Sync {
    /// Start or stop shipping for one instance.
    fn set_enabled(&self, instance_id: &str, enabled: bool);

    /// Forward one record. No acknowledgement.
    fn ship(&self, record: TelemetryRecord);
}

/// Sink that writes records to the process log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn set_enabled(&self, instance_id: &str, enabled: bool) {
        info!(instance = %instance_id, enabled, "telemetry shipping toggled");
    }

    fn ship(&self, record: TelemetryRecord) {
        debug!(
            target: "edgeshift::telemetry",
            instance = %record.instance_id,
            kind = ?record.kind,
            ts = record.timestamp_ms,
            body = %record.body,
            "record"
        );
    }
}
