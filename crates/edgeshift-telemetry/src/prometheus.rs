//! Prometheus text exposition format.
//!
//! Renders registry state for scraping by a Prometheus server or
//! compatible agent.

use std::collections::BTreeMap;
use std::fmt::Write;

use edgeshift_state::{HealthState, Instance, Role};

/// Render the current instance set into Prometheus text format.
///
/// Produces `edgeshift_instances` per hostname and role, plus per-instance
/// health and shipping gauges.
pub fn render_prometheus(instances: &[Instance]) -> String {
    let mut out = String::new();

    let mut by_role: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    for inst in instances {
        *by_role
            .entry((inst.hostname.as_str(), inst.role.as_str()))
            .or_default() += 1;
    }

    out.push_str("# HELP edgeshift_instances Registered instances by hostname and role.\n");
    out.push_str("# TYPE edgeshift_instances gauge\n");
    for ((hostname, role), count) in &by_role {
        let _ = writeln!(
            out,
            "edgeshift_instances{{hostname=\"{hostname}\",role=\"{role}\"}} {count}"
        );
    }

    out.push_str("# HELP edgeshift_instance_healthy Whether the instance passes its liveness probe (1) or not (0).\n");
    out.push_str("# TYPE edgeshift_instance_healthy gauge\n");
    for inst in instances {
        let _ = writeln!(
            out,
            "edgeshift_instance_healthy{{hostname=\"{}\",instance=\"{}\",version=\"{}\"}} {}",
            inst.hostname,
            inst.id,
            inst.version,
            u8::from(inst.health == HealthState::Healthy)
        );
    }

    out.push_str("# HELP edgeshift_shipping_enabled Whether telemetry is shipped for the instance.\n");
    out.push_str("# TYPE edgeshift_shipping_enabled gauge\n");
    for inst in instances.iter().filter(|i| i.role != Role::Retired) {
        let _ = writeln!(
            out,
            "edgeshift_shipping_enabled{{hostname=\"{}\",instance=\"{}\"}} {}",
            inst.hostname,
            inst.id,
            u8::from(inst.shipping)
        );
    }

    out
}
