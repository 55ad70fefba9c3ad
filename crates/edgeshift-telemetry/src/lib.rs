//! edgeshift-telemetry: log and metric shipping for live instances.
//!
//! ```text
//! TelemetryGatekeeper
//!   ├── on_live_set_changed() ← called by the rollout controller
//!   │     ├── added   → enable shipping now
//!   │     └── removed → disable shipping after the drain period
//!   └── forward()     → hands records of shipping instances to the sink
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics
//! ```

pub mod gatekeeper;
pub mod prometheus;
pub mod sink;

pub use gatekeeper::TelemetryGatekeeper;
pub use prometheus::render_prometheus;
pub use sink::{RecordKind, TelemetryRecord, TelemetrySink, TracingSink};
