//! Health prober: one background probe task per instance.
//!
//! Each task periodically probes its instance's endpoint, debounces the
//! results, writes transitions into the [`InstanceRegistry`] and broadcasts
//! a [`HealthEvent`] for the rollout controller.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use edgeshift_state::{HealthState, Instance, InstanceId, InstanceRegistry, RegistryError};

use crate::checker::{HealthTracker, LivenessProbe, ProbeConfig};

/// Capacity of the transition event channel.
const EVENT_CAPACITY: usize = 256;

/// A health transition of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub instance_id: InstanceId,
    pub hostname: String,
    pub from: HealthState,
    pub to: HealthState,
}

/// Per-instance probe task.
struct ProbeSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Runs liveness probes for every watched instance.
#[derive(Clone)]
pub struct HealthProber {
    registry: InstanceRegistry,
    probe: Arc<dyn LivenessProbe>,
    config: ProbeConfig,
    /// Active probe tasks: instance id → slot.
    tasks: Arc<RwLock<HashMap<InstanceId, ProbeSlot>>>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthProber {
    pub fn new(registry: InstanceRegistry, probe: Arc<dyn LivenessProbe>, config: ProbeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            probe,
            config,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to health transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Start probing an instance. Returns `false` if it has no endpoint yet.
    ///
    /// Watching an instance that is already watched restarts its task.
    pub async fn watch(&self, instance: &Instance) -> bool {
        let Some(endpoint) = instance.endpoint.clone() else {
            warn!(instance = %instance.id, "cannot probe instance without an endpoint");
            return false;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = ProbeTask {
            instance_id: instance.id.clone(),
            hostname: instance.hostname.clone(),
            endpoint,
            registry: self.registry.clone(),
            probe: Arc::clone(&self.probe),
            config: self.config.clone(),
            events: self.events.clone(),
        };
        let handle = tokio::spawn(task.run(shutdown_rx));

        let mut tasks = self.tasks.write().await;
        if let Some(old) = tasks.insert(
            instance.id.clone(),
            ProbeSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(instance = %instance.id, hostname = %instance.hostname, "health probe started");
        true
    }

    /// Stop probing an instance.
    pub async fn unwatch(&self, instance_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(slot) = tasks.remove(instance_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(instance = %instance_id, "health probe stopped");
        }
    }

    /// Stop all probe tasks (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.write().await;
        for (id, slot) in tasks.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(instance = %id, "health probe stopped");
        }
        info!("all health probes stopped");
    }

    /// Instance ids with an active probe task.
    pub async fn active(&self) -> Vec<InstanceId> {
        let tasks = self.tasks.read().await;
        tasks
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn is_watching(&self, instance_id: &str) -> bool {
        let tasks = self.tasks.read().await;
        tasks
            .get(instance_id)
            .is_some_and(|slot| !slot.handle.is_finished())
    }
}

/// Everything one probe loop needs, moved into its task.
struct ProbeTask {
    instance_id: InstanceId,
    hostname: String,
    endpoint: String,
    registry: InstanceRegistry,
    probe: Arc<dyn LivenessProbe>,
    config: ProbeConfig,
    events: broadcast::Sender<HealthEvent>,
}

impl ProbeTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let initial = match self.registry.get(&self.instance_id) {
            Some(inst) => inst.health,
            None => return,
        };
        let mut tracker = HealthTracker::new(&self.config, initial);

        debug!(instance = %self.instance_id, endpoint = %self.endpoint, "probe loop starting");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tracker.next_interval()) => {
                    if self.registry.get(&self.instance_id).is_none() {
                        debug!(instance = %self.instance_id, "instance left the registry, probe loop exiting");
                        break;
                    }

                    let result = self.probe.check(&self.endpoint).await;
                    let from = tracker.status();
                    let to = tracker.record(result);
                    if from == to {
                        continue;
                    }

                    match self.registry.set_health(&self.instance_id, to) {
                        Ok(_) => {
                            info!(
                                instance = %self.instance_id,
                                hostname = %self.hostname,
                                %from,
                                %to,
                                "health transition"
                            );
                            // No subscribers is fine.
                            let _ = self.events.send(HealthEvent {
                                instance_id: self.instance_id.clone(),
                                hostname: self.hostname.clone(),
                                from,
                                to,
                            });
                        }
                        Err(RegistryError::UnknownInstance(_)) => {
                            debug!(instance = %self.instance_id, "instance retired mid-probe");
                            break;
                        }
                        Err(e) => {
                            error!(instance = %self.instance_id, error = %e, "failed to record health");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!(instance = %self.instance_id, "probe loop shutting down");
                    break;
                }
            }
        }
    }
}
