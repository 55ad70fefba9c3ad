//! Rollout controller: one state machine per hostname.
//!
//! ```text
//! Idle ──deploy──▶ Deploying ──healthy──▶ Promoting ──grace──▶ Draining ──retired──▶ Idle
//!   │                 │                                                        ▲
//!   └──rollback──▶ RollingBack (same path, target from history) ───────────────┘
//!                     │
//!                     └──timeout / start or publish failure──▶ Failed
//! ```
//!
//! Commands validate and register synchronously, so conflicts are returned
//! to the caller without touching any state. The rollout itself runs on a
//! spawned task and reports through a [`RolloutHandle`].
//!
//! The routing table is always published (and acknowledged) before the
//! previous instance's drain timer starts.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use edgeshift_health::{HealthEvent, HealthProber};
use edgeshift_proxy::RoutingTablePublisher;
use edgeshift_state::{
    HealthState, HistoryStore, Instance, InstanceRegistry, RoutingEntry, RolloutKind,
    RolloutOutcome, RolloutRecord, epoch_secs,
};
use edgeshift_telemetry::TelemetryGatekeeper;

use crate::config::RolloutConfig;
use crate::error::RolloutError;
use crate::runtime::{ContainerRuntime, InstanceHandle};

/// Traffic share of a sole live instance.
const FULL_WEIGHT: u32 = 100;
/// Traffic share of each instance during the dual-serving window.
const SPLIT_WEIGHT: u32 = 50;
/// First and largest delay between attempts to unpublish a replaced instance.
const UNPUBLISH_RETRY: Duration = Duration::from_secs(1);
const MAX_UNPUBLISH_RETRY: Duration = Duration::from_secs(8);

/// Where a hostname's rollout currently stands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RolloutPhase {
    #[default]
    Idle,
    /// Candidate started, waiting for it to become healthy.
    Deploying { version: String },
    /// Candidate live, old and new both published.
    Promoting { version: String },
    /// Old instance unpublished, waiting out its drain.
    Draining { version: String },
    /// Deploying a version taken from history.
    RollingBack { version: String },
    /// Last rollout failed; the record carries the reason.
    Failed { reason: String },
}

impl RolloutPhase {
    /// A rollout task owns the hostname.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Failed { .. })
    }

    /// The candidate is not live yet and can still be torn down.
    fn is_cancellable(&self) -> bool {
        matches!(self, Self::Deploying { .. } | Self::RollingBack { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Deploying { .. } => "deploying",
            Self::Promoting { .. } => "promoting",
            Self::Draining { .. } => "draining",
            Self::RollingBack { .. } => "rolling_back",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Deploying { version }
            | Self::Promoting { version }
            | Self::Draining { version }
            | Self::RollingBack { version } => write!(f, "{} {version}", self.name()),
        }
    }
}

/// Point-in-time view of one hostname.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub hostname: String,
    pub phase: RolloutPhase,
    pub live: Option<Instance>,
    pub instances: Vec<Instance>,
    /// Most recent rollout records, oldest first.
    pub history: Vec<RolloutRecord>,
}

/// Completion of a started rollout.
#[derive(Debug)]
pub struct RolloutHandle {
    pub hostname: String,
    pub version: String,
    pub kind: RolloutKind,
    /// The candidate registered for this rollout.
    pub instance_id: String,
    done: watch::Receiver<Option<RolloutRecord>>,
}

impl RolloutHandle {
    /// Wait for the rollout to finish and return its record.
    pub async fn wait(self) -> Result<RolloutRecord, RolloutError> {
        wait_record(&self.hostname, self.done).await
    }
}

async fn wait_record(
    hostname: &str,
    mut done: watch::Receiver<Option<RolloutRecord>>,
) -> Result<RolloutRecord, RolloutError> {
    let record = match done.wait_for(Option::is_some).await {
        Ok(record) => record.clone(),
        Err(_) => None,
    };
    record.ok_or_else(|| RolloutError::Interrupted(hostname.to_string()))
}

/// Per-hostname controller state.
#[derive(Default)]
struct HostSlot {
    phase: RolloutPhase,
    cancel: Option<watch::Sender<bool>>,
    done: Option<watch::Receiver<Option<RolloutRecord>>>,
}

/// Drives deploys and rollbacks for every hostname.
#[derive(Clone)]
pub struct RolloutController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    registry: InstanceRegistry,
    history: HistoryStore,
    prober: HealthProber,
    publisher: Arc<RoutingTablePublisher>,
    gatekeeper: TelemetryGatekeeper,
    runtime: Arc<dyn ContainerRuntime>,
    config: RolloutConfig,
    slots: Mutex<HashMap<String, HostSlot>>,
}

impl RolloutController {
    pub fn new(
        registry: InstanceRegistry,
        history: HistoryStore,
        prober: HealthProber,
        publisher: Arc<RoutingTablePublisher>,
        gatekeeper: TelemetryGatekeeper,
        runtime: Arc<dyn ContainerRuntime>,
        config: RolloutConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                registry,
                history,
                prober,
                publisher,
                gatekeeper,
                runtime,
                config,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start rolling `hostname` onto `version`.
    ///
    /// Fails with `RolloutInProgress` unless the hostname is idle (or its
    /// last rollout failed), and with `DuplicateVersion` if that version is
    /// already running.
    pub fn deploy(&self, hostname: &str, version: &str) -> Result<RolloutHandle, RolloutError> {
        self.inner.begin(hostname, version, RolloutKind::Deploy)
    }

    /// Roll back to the most recent successfully deployed version other
    /// than the live one.
    ///
    /// A candidate still waiting for health is aborted first; once
    /// promotion has begun the rollback is refused with `CannotCancel`.
    pub async fn rollback(&self, hostname: &str) -> Result<RolloutHandle, RolloutError> {
        let current = self.inner.registry.live(hostname).map(|i| i.version);
        let target = self
            .inner
            .history
            .rollback_target(hostname, current.as_deref())?
            .ok_or_else(|| RolloutError::NoRollbackTarget {
                hostname: hostname.to_string(),
                version: None,
            })?;
        self.preempt_and_begin(hostname, &target.to_version).await
    }

    /// Roll back to a specific version. Requires a successful rollout to
    /// that version in the hostname's history.
    pub async fn rollback_to(&self, hostname: &str, version: &str) -> Result<RolloutHandle, RolloutError> {
        if self.inner.history.last_successful_to(hostname, version)?.is_none() {
            return Err(RolloutError::NoRollbackTarget {
                hostname: hostname.to_string(),
                version: Some(version.to_string()),
            });
        }
        self.preempt_and_begin(hostname, version).await
    }

    async fn preempt_and_begin(&self, hostname: &str, version: &str) -> Result<RolloutHandle, RolloutError> {
        match self.phase(hostname) {
            RolloutPhase::Deploying { .. } => match self.abort(hostname).await {
                Ok(_) | Err(RolloutError::NotInProgress(_)) => {}
                Err(e) => return Err(e),
            },
            phase @ RolloutPhase::RollingBack { .. } => {
                return Err(RolloutError::RolloutInProgress {
                    hostname: hostname.to_string(),
                    phase: phase.to_string(),
                });
            }
            phase @ (RolloutPhase::Promoting { .. } | RolloutPhase::Draining { .. }) => {
                return Err(RolloutError::CannotCancel {
                    hostname: hostname.to_string(),
                    phase: phase.to_string(),
                });
            }
            RolloutPhase::Idle | RolloutPhase::Failed { .. } => {}
        }
        self.inner.begin(hostname, version, RolloutKind::Rollback)
    }

    /// Cancel a rollout whose candidate is not live yet.
    ///
    /// Returns the `aborted` record. On a failed hostname this only
    /// acknowledges the failure and returns `None`.
    pub async fn abort(&self, hostname: &str) -> Result<Option<RolloutRecord>, RolloutError> {
        let done = {
            let mut slots = self.inner.slots.lock().expect("slots lock");
            let Some(slot) = slots.get_mut(hostname) else {
                return Err(RolloutError::NotInProgress(hostname.to_string()));
            };
            match &slot.phase {
                RolloutPhase::Idle => {
                    return Err(RolloutError::NotInProgress(hostname.to_string()));
                }
                RolloutPhase::Failed { .. } => {
                    slot.phase = RolloutPhase::Idle;
                    info!(%hostname, "failure acknowledged");
                    return Ok(None);
                }
                phase if !phase.is_cancellable() => {
                    return Err(RolloutError::CannotCancel {
                        hostname: hostname.to_string(),
                        phase: phase.to_string(),
                    });
                }
                phase => {
                    info!(%hostname, %phase, "abort requested");
                    if let Some(cancel) = &slot.cancel {
                        cancel.send_replace(true);
                    }
                    slot.done.clone()
                }
            }
        };

        let Some(done) = done else {
            return Err(RolloutError::NotInProgress(hostname.to_string()));
        };
        wait_record(hostname, done).await.map(Some)
    }

    pub fn phase(&self, hostname: &str) -> RolloutPhase {
        self.inner.phase(hostname)
    }

    /// Phase, instances and recent history of one hostname.
    pub fn status(&self, hostname: &str) -> Result<HostStatus, RolloutError> {
        let inner = &self.inner;
        Ok(HostStatus {
            hostname: hostname.to_string(),
            phase: inner.phase(hostname),
            live: inner.registry.live(hostname),
            instances: inner.registry.instances(hostname),
            history: inner.history.tail(hostname, inner.config.status_history)?,
        })
    }

    /// Status of every hostname the controller or registry knows about.
    pub fn statuses(&self) -> Result<Vec<HostStatus>, RolloutError> {
        let mut hostnames: BTreeSet<String> = self.inner.registry.hostnames().into_iter().collect();
        hostnames.extend(self.inner.slots.lock().expect("slots lock").keys().cloned());
        hostnames.iter().map(|h| self.status(h)).collect()
    }
}

/// One rollout attempt, owned by its task.
struct Attempt {
    hostname: String,
    version: String,
    kind: RolloutKind,
    from_version: Option<String>,
    candidate_id: String,
    cancel: watch::Receiver<bool>,
    done: watch::Sender<Option<RolloutRecord>>,
}

enum HealthWait {
    Healthy,
    Cancelled,
    TimedOut(HealthState),
    Lost,
}

impl ControllerInner {
    fn phase(&self, hostname: &str) -> RolloutPhase {
        self.slots
            .lock()
            .expect("slots lock")
            .get(hostname)
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    fn set_phase(&self, hostname: &str, phase: RolloutPhase) {
        debug!(%hostname, %phase, "rollout phase");
        self.slots
            .lock()
            .expect("slots lock")
            .entry(hostname.to_string())
            .or_default()
            .phase = phase;
    }

    fn begin(
        self: &Arc<Self>,
        hostname: &str,
        version: &str,
        kind: RolloutKind,
    ) -> Result<RolloutHandle, RolloutError> {
        let mut slots = self.slots.lock().expect("slots lock");
        if let Some(slot) = slots.get(hostname)
            && slot.phase.is_active()
        {
            return Err(RolloutError::RolloutInProgress {
                hostname: hostname.to_string(),
                phase: slot.phase.to_string(),
            });
        }

        let from_version = self.registry.live(hostname).map(|i| i.version);
        let candidate = self.registry.register(hostname, version)?;

        let slot = slots.entry(hostname.to_string()).or_default();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);
        slot.phase = match kind {
            RolloutKind::Deploy => RolloutPhase::Deploying {
                version: version.to_string(),
            },
            RolloutKind::Rollback => RolloutPhase::RollingBack {
                version: version.to_string(),
            },
        };
        slot.cancel = Some(cancel_tx);
        slot.done = Some(done_rx.clone());
        drop(slots);

        info!(
            %hostname,
            from = ?from_version,
            to = %version,
            ?kind,
            instance = %candidate.id,
            "rollout started"
        );

        let attempt = Attempt {
            hostname: hostname.to_string(),
            version: version.to_string(),
            kind,
            from_version,
            candidate_id: candidate.id.clone(),
            cancel: cancel_rx,
            done: done_tx,
        };
        tokio::spawn(Arc::clone(self).run(attempt));

        Ok(RolloutHandle {
            hostname: hostname.to_string(),
            version: version.to_string(),
            kind,
            instance_id: candidate.id,
            done: done_rx,
        })
    }

    async fn run(self: Arc<Self>, mut attempt: Attempt) {
        let outcome = self.execute(&mut attempt).await;

        let record = RolloutRecord {
            hostname: attempt.hostname.clone(),
            kind: attempt.kind,
            from_version: attempt.from_version.clone(),
            to_version: attempt.version.clone(),
            timestamp: epoch_secs(),
            outcome,
        };
        self.record(&record);

        let next = match &record.outcome {
            RolloutOutcome::Failed { reason } => RolloutPhase::Failed {
                reason: reason.clone(),
            },
            RolloutOutcome::Succeeded | RolloutOutcome::Aborted => RolloutPhase::Idle,
        };
        {
            let mut slots = self.slots.lock().expect("slots lock");
            let slot = slots.entry(attempt.hostname.clone()).or_default();
            slot.phase = next;
            slot.cancel = None;
            slot.done = None;
        }

        match &record.outcome {
            RolloutOutcome::Succeeded => info!(
                hostname = %record.hostname,
                from = ?record.from_version,
                to = %record.to_version,
                "rollout succeeded"
            ),
            RolloutOutcome::Aborted => info!(hostname = %record.hostname, to = %record.to_version, "rollout aborted"),
            RolloutOutcome::Failed { reason } => warn!(
                hostname = %record.hostname,
                to = %record.to_version,
                %reason,
                "rollout failed"
            ),
        }
        attempt.done.send_replace(Some(record));
    }

    /// Append to history and apply retention. Store failures are logged;
    /// the rollout's outcome stands regardless.
    fn record(&self, record: &RolloutRecord) {
        if let Err(e) = self.history.append(record) {
            error!(hostname = %record.hostname, error = %e, "failed to append rollout record");
            return;
        }
        if let Err(e) = self
            .history
            .truncate(&record.hostname, self.config.history_retention)
        {
            warn!(hostname = %record.hostname, error = %e, "failed to truncate rollout history");
        }
    }

    async fn execute(&self, a: &mut Attempt) -> RolloutOutcome {
        let deadline = Instant::now() + self.config.deploy_timeout;
        let id = a.candidate_id.clone();

        // ── Start ──
        let started = tokio::select! {
            r = tokio::time::timeout_at(deadline, self.runtime.start(&a.hostname, &a.version)) => Some(r),
            _ = cancelled(&mut a.cancel) => None,
        };
        let handle = match started {
            None => {
                self.abandon(&id, None).await;
                return RolloutOutcome::Aborted;
            }
            Some(Ok(Ok(handle))) => handle,
            Some(Ok(Err(e))) => {
                self.abandon(&id, None).await;
                return failed(format!("runtime could not start {}: {e}", a.version));
            }
            Some(Err(_)) => {
                self.abandon(&id, None).await;
                return failed(format!(
                    "runtime did not start {} within {:?}",
                    a.version, self.config.deploy_timeout
                ));
            }
        };

        // ── Wait for health ──
        if let Err(e) = self.registry.bind_endpoint(&id, &handle.address) {
            self.abandon(&id, Some(&handle)).await;
            return failed(e.to_string());
        }
        let mut events = self.prober.subscribe();
        let watching = match self.registry.get(&id) {
            Some(inst) => self.prober.watch(&inst).await,
            None => false,
        };
        if !watching {
            self.abandon(&id, Some(&handle)).await;
            return failed(format!("candidate {id} could not be probed"));
        }

        match self.await_healthy(&id, deadline, &mut events, &mut a.cancel).await {
            HealthWait::Healthy => {}
            HealthWait::Cancelled => {
                self.abandon(&id, Some(&handle)).await;
                return RolloutOutcome::Aborted;
            }
            HealthWait::TimedOut(health) => {
                self.abandon(&id, Some(&handle)).await;
                return failed(format!(
                    "candidate {id} not healthy within {:?} (last health: {health})",
                    self.config.deploy_timeout
                ));
            }
            HealthWait::Lost => {
                self.abandon(&id, Some(&handle)).await;
                return failed("health events stopped".to_string());
            }
        }

        // ── Promote ──
        // Checked under the slot lock so an abort either lands before this
        // point or is refused with CannotCancel.
        let cancelled_before_promotion = {
            let mut slots = self.slots.lock().expect("slots lock");
            if *a.cancel.borrow() {
                true
            } else {
                slots.entry(a.hostname.clone()).or_default().phase = RolloutPhase::Promoting {
                    version: a.version.clone(),
                };
                false
            }
        };
        if cancelled_before_promotion {
            self.abandon(&id, Some(&handle)).await;
            return RolloutOutcome::Aborted;
        }

        let promotion = match self.registry.promote(&id) {
            Ok(p) => p,
            Err(e) => {
                self.abandon(&id, Some(&handle)).await;
                return failed(format!("promotion refused: {e}"));
            }
        };
        let live = promotion.live;

        let mut entries = vec![routing_entry(&live, &handle.address, FULL_WEIGHT)];
        if let Some(old) = &promotion.demoted
            && let Some(endpoint) = &old.endpoint
        {
            entries[0].weight = SPLIT_WEIGHT;
            entries.push(routing_entry(old, endpoint, SPLIT_WEIGHT));
        }

        if let Err(e) = self.publisher.reconcile_host(&a.hostname, entries).await {
            let previous = promotion.demoted.as_ref().map(|d| d.id.as_str());
            if let Err(revert) = self.registry.revert_promotion(&id, previous) {
                error!(hostname = %a.hostname, error = %revert, "failed to revert promotion");
            }
            self.abandon(&id, Some(&handle)).await;
            return failed(format!("routing publish failed: {e}"));
        }
        self.gatekeeper
            .on_live_set_changed(std::slice::from_ref(&live), &[]);

        let Some(old) = promotion.demoted else {
            return RolloutOutcome::Succeeded;
        };

        // ── Dual-serve, then unpublish and drain the old instance ──
        tokio::time::sleep(self.config.grace_period).await;
        self.set_phase(
            &a.hostname,
            RolloutPhase::Draining {
                version: a.version.clone(),
            },
        );

        let entries = vec![routing_entry(&live, &handle.address, FULL_WEIGHT)];
        let unpublished = self.unpublish(&a.hostname, &old, entries).await;

        // Drained and retired even if unpublishing gave up.
        let drain_deadline = Instant::now() + self.config.drain_period;
        if let Err(e) = self.registry.begin_drain(&old.id, drain_deadline) {
            return failed(format!("failed to drain {}: {e}", old.id));
        }
        self.gatekeeper
            .on_live_set_changed(&[], std::slice::from_ref(&old));
        info!(hostname = %a.hostname, instance = %old.id, "draining previous instance");

        tokio::time::sleep_until(drain_deadline).await;
        if let Err(e) = self.registry.retire(&old.id) {
            return failed(format!("failed to retire {}: {e}", old.id));
        }
        self.prober.unwatch(&old.id).await;
        if let Some(old_handle) = InstanceHandle::of(&old)
            && let Err(e) = self.runtime.stop(&old_handle).await
        {
            warn!(instance = %old.id, error = %e, "runtime failed to stop retired instance");
        }

        match unpublished {
            Ok(()) => RolloutOutcome::Succeeded,
            Err(reason) => failed(reason),
        }
    }

    /// Publish the single-entry table that drops `old`, retrying with
    /// backoff for up to `deploy_timeout`.
    async fn unpublish(&self, hostname: &str, old: &Instance, entries: Vec<RoutingEntry>) -> Result<(), String> {
        let deadline = Instant::now() + self.config.deploy_timeout;
        let mut backoff = UNPUBLISH_RETRY;
        loop {
            let err = match self.publisher.reconcile_host(hostname, entries.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            if Instant::now() + backoff > deadline {
                error!(%hostname, instance = %old.id, error = %err, "giving up unpublishing previous instance");
                return Err(format!(
                    "failed to unpublish {} within {:?}: {err}",
                    old.id, self.config.deploy_timeout
                ));
            }
            warn!(%hostname, instance = %old.id, error = %err, retry_in = ?backoff, "unpublish rejected");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_UNPUBLISH_RETRY);
        }
    }

    async fn await_healthy(
        &self,
        id: &str,
        deadline: Instant,
        events: &mut broadcast::Receiver<HealthEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> HealthWait {
        loop {
            let health = self
                .registry
                .get(id)
                .map(|i| i.health)
                .unwrap_or(HealthState::Unknown);
            if health == HealthState::Healthy {
                return HealthWait::Healthy;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return HealthWait::TimedOut(health),
                _ = cancelled(cancel) => return HealthWait::Cancelled,
                event = events.recv() => match event {
                    Ok(event) if event.instance_id == id => {
                        debug!(instance = %id, from = %event.from, to = %event.to, "candidate health changed");
                    }
                    Ok(_) => {}
                    // Missed events; the registry is re-read above.
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(instance = %id, skipped, "health events lagged");
                    }
                    Err(RecvError::Closed) => return HealthWait::Lost,
                },
            }
        }
    }

    /// Tear down a candidate that never became (or no longer is) live.
    async fn abandon(&self, id: &str, handle: Option<&InstanceHandle>) {
        self.prober.unwatch(id).await;
        match self.registry.discard(id) {
            Ok(_) => {}
            Err(e) => debug!(instance = %id, error = %e, "candidate already gone"),
        }
        if let Some(handle) = handle
            && let Err(e) = self.runtime.stop(handle).await
        {
            warn!(instance = %id, error = %e, "runtime failed to stop candidate");
        }
    }
}

fn failed(reason: String) -> RolloutOutcome {
    RolloutOutcome::Failed { reason }
}

fn routing_entry(instance: &Instance, endpoint: &str, weight: u32) -> RoutingEntry {
    RoutingEntry {
        hostname: instance.hostname.clone(),
        instance_id: instance.id.clone(),
        endpoint: endpoint.to_string(),
        weight,
    }
}

/// Resolves once cancellation is requested. Never resolves if the slot
/// dropped its sender.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
