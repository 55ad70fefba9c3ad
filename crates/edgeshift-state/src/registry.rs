//! Instance registry: the single owner of every running instance.
//!
//! Instances are grouped per hostname, and each hostname has its own
//! mutex. Every mutation of a hostname's instances (health writes from the
//! prober, promote/retire from the controller) happens under that mutex,
//! which makes them linearizable per hostname while hostnames stay
//! independent of each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::types::*;

/// Instances of a single hostname, keyed by id.
#[derive(Default)]
struct HostInstances {
    instances: BTreeMap<InstanceId, Instance>,
}

impl HostInstances {
    fn get_mut(&mut self, id: &str) -> RegistryResult<&mut Instance> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))
    }

    fn live_id(&self) -> Option<InstanceId> {
        self.instances
            .values()
            .find(|i| i.role == Role::Live)
            .map(|i| i.id.clone())
    }
}

struct RegistryInner {
    /// hostname → its instances, each behind its own lock.
    hosts: RwLock<HashMap<String, Arc<Mutex<HostInstances>>>>,
    /// instance id → hostname.
    index: RwLock<HashMap<InstanceId, String>>,
    next_seq: AtomicU64,
}

/// Result of a successful promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    /// The instance that is now live.
    pub live: Instance,
    /// The previously live instance, now retiring.
    pub demoted: Option<Instance>,
}

/// Thread-safe registry of versioned backend instances.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RegistryInner>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hosts: RwLock::new(HashMap::new()),
                index: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Lock for a hostname, created on first use.
    fn host(&self, hostname: &str) -> Arc<Mutex<HostInstances>> {
        if let Some(host) = self.inner.hosts.read().expect("hosts lock").get(hostname) {
            return Arc::clone(host);
        }
        let mut hosts = self.inner.hosts.write().expect("hosts lock");
        Arc::clone(hosts.entry(hostname.to_string()).or_default())
    }

    /// Lock for a hostname that already has an entry. Queries go through
    /// here so that reads never create hostnames.
    fn existing_host(&self, hostname: &str) -> Option<Arc<Mutex<HostInstances>>> {
        self.inner
            .hosts
            .read()
            .expect("hosts lock")
            .get(hostname)
            .map(Arc::clone)
    }

    /// Lock for the hostname owning `id`.
    fn host_of(&self, id: &str) -> RegistryResult<Arc<Mutex<HostInstances>>> {
        let hostname = self
            .inner
            .index
            .read()
            .expect("index lock")
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
        Ok(self.host(&hostname))
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Create a candidate instance in `Starting` health.
    ///
    /// Fails with `DuplicateVersion` if the same version is already
    /// registered (and not yet retired) for the hostname.
    pub fn register(&self, hostname: &str, version: &str) -> RegistryResult<Instance> {
        let host = self.host(hostname);
        let mut host = host.lock().expect("host lock");

        if host.instances.values().any(|i| i.version == version) {
            return Err(RegistryError::DuplicateVersion {
                hostname: hostname.to_string(),
                version: version.to_string(),
            });
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let instance = Instance {
            id: format!("{hostname}-{version}-{seq}"),
            hostname: hostname.to_string(),
            version: version.to_string(),
            created_at: epoch_secs(),
            health: HealthState::Starting,
            role: Role::Candidate,
            endpoint: None,
            shipping: false,
            drain_deadline: None,
        };

        self.inner
            .index
            .write()
            .expect("index lock")
            .insert(instance.id.clone(), hostname.to_string());
        host.instances.insert(instance.id.clone(), instance.clone());

        info!(%hostname, %version, instance = %instance.id, "registered candidate");
        Ok(instance)
    }

    /// Record the liveness address the runtime reported for an instance.
    pub fn bind_endpoint(&self, id: &str, endpoint: &str) -> RegistryResult<()> {
        let host = self.host_of(id)?;
        let mut host = host.lock().expect("host lock");
        host.get_mut(id)?.endpoint = Some(endpoint.to_string());
        Ok(())
    }

    /// Set the health of an instance. Idempotent; returns the previous state.
    pub fn set_health(&self, id: &str, health: HealthState) -> RegistryResult<HealthState> {
        let host = self.host_of(id)?;
        let mut host = host.lock().expect("host lock");
        let inst = host.get_mut(id)?;
        let previous = inst.health;
        if previous != health {
            inst.health = health;
            debug!(instance = %id, from = %previous, to = %health, "health updated");
        }
        Ok(previous)
    }

    /// Make a healthy candidate live, demoting the current live instance
    /// of the same hostname to `Retiring` in the same critical section.
    pub fn promote(&self, id: &str) -> RegistryResult<Promotion> {
        let host = self.host_of(id)?;
        let mut host = host.lock().expect("host lock");

        let target = host.get_mut(id)?;
        if target.role != Role::Candidate {
            return Err(RegistryError::InvalidRole {
                id: id.to_string(),
                role: target.role,
                expected: Role::Candidate,
            });
        }
        if target.health != HealthState::Healthy {
            return Err(RegistryError::NoHealthyCandidate {
                id: id.to_string(),
                health: target.health,
            });
        }

        let demoted = match host.live_id() {
            Some(prev_id) => {
                let prev = host.get_mut(&prev_id)?;
                prev.role = Role::Retiring;
                prev.drain_deadline = None;
                Some(prev.clone())
            }
            None => None,
        };

        let live = host.get_mut(id)?;
        live.role = Role::Live;
        let live = live.clone();

        info!(
            hostname = %live.hostname,
            instance = %live.id,
            version = %live.version,
            demoted = ?demoted.as_ref().map(|d| d.id.as_str()),
            "promoted instance to live"
        );
        Ok(Promotion { live, demoted })
    }

    /// Undo a promotion whose routing publication was rejected: the
    /// candidate is removed and the previous instance is live again.
    pub fn revert_promotion(&self, candidate: &str, previous: Option<&str>) -> RegistryResult<()> {
        let host = self.host_of(candidate)?;
        let mut host = host.lock().expect("host lock");

        let cand = host.get_mut(candidate)?;
        if cand.role != Role::Live {
            return Err(RegistryError::InvalidRole {
                id: candidate.to_string(),
                role: cand.role,
                expected: Role::Live,
            });
        }
        if let Some(prev_id) = previous {
            let prev = host.get_mut(prev_id)?;
            if prev.role != Role::Retiring {
                return Err(RegistryError::InvalidRole {
                    id: prev_id.to_string(),
                    role: prev.role,
                    expected: Role::Retiring,
                });
            }
            prev.role = Role::Live;
            prev.drain_deadline = None;
        }

        host.instances.remove(candidate);
        self.inner.index.write().expect("index lock").remove(candidate);
        info!(instance = %candidate, restored = ?previous, "reverted promotion");
        Ok(())
    }

    /// Stamp the drain deadline on a retiring instance.
    pub fn begin_drain(&self, id: &str, deadline: Instant) -> RegistryResult<()> {
        let host = self.host_of(id)?;
        let mut host = host.lock().expect("host lock");
        let inst = host.get_mut(id)?;
        if inst.role != Role::Retiring {
            return Err(RegistryError::InvalidRole {
                id: id.to_string(),
                role: inst.role,
                expected: Role::Retiring,
            });
        }
        inst.drain_deadline = Some(deadline);
        debug!(instance = %id, "drain started");
        Ok(())
    }

    /// Remove a retiring instance whose drain deadline has passed.
    pub fn retire(&self, id: &str) -> RegistryResult<Instance> {
        let host = self.host_of(id)?;
        let mut host = host.lock().expect("host lock");
        let inst = host.get_mut(id)?;
        if inst.role != Role::Retiring {
            return Err(RegistryError::InvalidRole {
                id: id.to_string(),
                role: inst.role,
                expected: Role::Retiring,
            });
        }
        match inst.drain_deadline {
            Some(deadline) if Instant::now() >= deadline => {}
            _ => return Err(RegistryError::DrainPending(id.to_string())),
        }

        let mut removed = host
            .instances
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
        self.inner.index.write().expect("index lock").remove(id);
        removed.role = Role::Retired;

        info!(hostname = %removed.hostname, instance = %id, version = %removed.version, "retired instance");
        Ok(removed)
    }

    /// Remove a candidate that never went live (failed or aborted deploy).
    pub fn discard(&self, id: &str) -> RegistryResult<Instance> {
        let host = self.host_of(id)?;
        let mut host = host.lock().expect("host lock");
        let inst = host.get_mut(id)?;
        if inst.role != Role::Candidate {
            return Err(RegistryError::InvalidRole {
                id: id.to_string(),
                role: inst.role,
                expected: Role::Candidate,
            });
        }
        let mut removed = host
            .instances
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
        self.inner.index.write().expect("index lock").remove(id);
        removed.role = Role::Retired;

        info!(hostname = %removed.hostname, instance = %id, "discarded candidate");
        Ok(removed)
    }

    /// Toggle the telemetry shipping flag.
    pub fn set_shipping(&self, id: &str, enabled: bool) -> RegistryResult<()> {
        let host = self.host_of(id)?;
        let mut host = host.lock().expect("host lock");
        host.get_mut(id)?.shipping = enabled;
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Instance> {
        let host = self.host_of(id).ok()?;
        let host = host.lock().expect("host lock");
        host.instances.get(id).cloned()
    }

    /// The live instance for a hostname, if any.
    pub fn live(&self, hostname: &str) -> Option<Instance> {
        let host = self.existing_host(hostname)?;
        let host = host.lock().expect("host lock");
        host.instances.values().find(|i| i.role == Role::Live).cloned()
    }

    /// Number of live instances for a hostname (at most one).
    pub fn live_count(&self, hostname: &str) -> usize {
        let Some(host) = self.existing_host(hostname) else {
            return 0;
        };
        let host = host.lock().expect("host lock");
        host.instances.values().filter(|i| i.role == Role::Live).count()
    }

    /// All instances of a hostname, ordered by id.
    pub fn instances(&self, hostname: &str) -> Vec<Instance> {
        let Some(host) = self.existing_host(hostname) else {
            return Vec::new();
        };
        let host = host.lock().expect("host lock");
        host.instances.values().cloned().collect()
    }

    /// Every instance across all hostnames.
    pub fn list(&self) -> Vec<Instance> {
        let mut out = Vec::new();
        for hostname in self.hostnames() {
            out.extend(self.instances(&hostname));
        }
        out
    }

    /// Hostnames that have ever had an instance, sorted.
    pub fn hostnames(&self) -> Vec<String> {
        let hosts = self.inner.hosts.read().expect("hosts lock");
        let mut names: Vec<String> = hosts.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
