//! Telemetry gatekeeper.
//!
//! Mirrors live-set membership onto shipping toggles. Instances entering
//! the live set are enabled at once; instances leaving it keep shipping
//! for the drain period so logs from in-flight requests are not lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use edgeshift_state::{Instance, InstanceId, InstanceRegistry, RegistryError};

use crate::sink::{TelemetryRecord, TelemetrySink};

#[derive(Clone)]
pub struct TelemetryGatekeeper {
    registry: InstanceRegistry,
    sink: Arc<dyn TelemetrySink>,
    drain_period: Duration,
    /// Delayed disables not yet fired: instance id → timer task.
    pending: Arc<Mutex<HashMap<InstanceId, JoinHandle<()>>>>,
}

impl TelemetryGatekeeper {
    pub fn new(registry: InstanceRegistry, sink: Arc<dyn TelemetrySink>, drain_period: Duration) -> Self {
        Self {
            registry,
            sink,
            drain_period,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// React to a change of the live set. Must be called within a tokio
    /// runtime; disables are scheduled as timer tasks.
    pub fn on_live_set_changed(&self, added: &[Instance], removed: &[Instance]) {
        for inst in added {
            // Re-added before its disable fired: keep it shipping.
            if let Some(timer) = self.pending.lock().expect("pending lock").remove(&inst.id) {
                timer.abort();
            }
            self.sink.set_enabled(&inst.id, true);
            mark_shipping(&self.registry, &inst.id, true);
            info!(instance = %inst.id, hostname = %inst.hostname, "telemetry enabled");
        }

        for inst in removed {
            let id = inst.id.clone();
            let registry = self.registry.clone();
            let sink = Arc::clone(&self.sink);
            let pending = Arc::clone(&self.pending);
            let drain = self.drain_period;

            // Held across the spawn so the timer cannot deregister itself
            // before it is registered.
            let mut timers = self.pending.lock().expect("pending lock");
            let timer = tokio::spawn(async move {
                tokio::time::sleep(drain).await;
                sink.set_enabled(&id, false);
                mark_shipping(&registry, &id, false);
                pending.lock().expect("pending lock").remove(&id);
                info!(instance = %id, "telemetry disabled after drain");
            });
            if let Some(old) = timers.insert(inst.id.clone(), timer) {
                old.abort();
            }
            debug!(instance = %inst.id, drain_ms = drain.as_millis() as u64, "telemetry disable scheduled");
        }
    }

    /// Forward a record if its instance is currently shipping.
    ///
    /// Returns whether the record was handed to the sink.
    pub fn forward(&self, record: TelemetryRecord) -> bool {
        let shipping = self
            .registry
            .get(&record.instance_id)
            .is_some_and(|inst| inst.shipping);
        if shipping {
            self.sink.ship(record);
        } else {
            debug!(instance = %record.instance_id, "dropping record of non-shipping instance");
        }
        shipping
    }

    /// Number of disables still waiting on their drain timer.
    pub fn pending_disables(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }
}

fn mark_shipping(registry: &InstanceRegistry, id: &str, enabled: bool) {
    match registry.set_shipping(id, enabled) {
        Ok(()) => {}
        // Retired before the toggle landed; the sink has already been told.
        Err(RegistryError::UnknownInstance(_)) => {
            debug!(instance = %id, "shipping flag not recorded, instance gone");
        }
        Err(e) => debug!(instance = %id, error = %e, "shipping flag not recorded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordKind;

    #[derive(Default)]
    struct RecordingSink {
        toggles: Mutex<Vec<(String, bool)>>,
        shipped: Mutex<Vec<TelemetryRecord>>,
    }

    impl TelemetrySink for RecordingSink {
        fn set_enabled(&self, instance_id: &str, enabled: bool) {
            self.toggles
                .lock()
                .unwrap()
                .push((instance_id.to_string(), enabled));
        }

        fn ship(&self, record: TelemetryRecord) {
            self.shipped.lock().unwrap().push(record);
        }
    }

    fn record(id: &str) -> TelemetryRecord {
        TelemetryRecord {
            instance_id: id.to_string(),
            kind: RecordKind::Log,
            timestamp_ms: 1,
            body: serde_json::json!({"msg": "GET / 200"}),
        }
    }

    fn setup() -> (InstanceRegistry, Arc<RecordingSink>, TelemetryGatekeeper) {
        let registry = InstanceRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let gate = TelemetryGatekeeper::new(registry.clone(), sink.clone(), Duration::from_secs(30));
        (registry, sink, gate)
    }

    #[tokio::test(start_paused = true)]
    async fn added_instance_ships_immediately() {
        let (registry, sink, gate) = setup();
        let inst = registry.register("a.example", "v1").unwrap();

        gate.on_live_set_changed(std::slice::from_ref(&inst), &[]);

        assert_eq!(*sink.toggles.lock().unwrap(), vec![(inst.id.clone(), true)]);
        assert!(registry.get(&inst.id).unwrap().shipping);
        assert!(gate.forward(record(&inst.id)));
        assert_eq!(sink.shipped.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_instance_ships_until_drain_ends() {
        let (registry, sink, gate) = setup();
        let inst = registry.register("a.example", "v1").unwrap();
        gate.on_live_set_changed(std::slice::from_ref(&inst), &[]);

        gate.on_live_set_changed(&[], std::slice::from_ref(&inst));
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(registry.get(&inst.id).unwrap().shipping);
        assert!(gate.forward(record(&inst.id)));
        assert_eq!(gate.pending_disables(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!registry.get(&inst.id).unwrap().shipping);
        assert!(!gate.forward(record(&inst.id)));
        assert_eq!(sink.toggles.lock().unwrap().last(), Some(&(inst.id.clone(), false)));
        assert_eq!(gate.pending_disables(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn readding_cancels_pending_disable() {
        let (registry, sink, gate) = setup();
        let inst = registry.register("a.example", "v1").unwrap();
        gate.on_live_set_changed(std::slice::from_ref(&inst), &[]);
        gate.on_live_set_changed(&[], std::slice::from_ref(&inst));
        gate.on_live_set_changed(std::slice::from_ref(&inst), &[]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.get(&inst.id).unwrap().shipping);
        assert!(sink.toggles.lock().unwrap().iter().all(|(_, on)| *on));
    }

    #[tokio::test(start_paused = true)]
    async fn disable_after_retire_still_reaches_sink() {
        let (registry, sink, gate) = setup();
        let inst = registry.register("a.example", "v1").unwrap();
        gate.on_live_set_changed(std::slice::from_ref(&inst), &[]);
        gate.on_live_set_changed(&[], std::slice::from_ref(&inst));
        registry.discard(&inst.id).unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.toggles.lock().unwrap().last(), Some(&(inst.id.clone(), false)));
    }

    #[test]
    fn unknown_instance_records_are_dropped() {
        let (_registry, sink, gate) = setup();
        assert!(!gate.forward(record("ghost")));
        assert!(sink.shipped.lock().unwrap().is_empty());
    }
}
