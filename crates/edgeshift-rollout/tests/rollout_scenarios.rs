//! End-to-end rollout scenarios against in-memory collaborators.
//!
//! All tests run on a paused clock: probe intervals, grace periods and
//! drain timers advance as soon as every task is idle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edgeshift_health::{BoxFuture as ProbeFuture, HealthProber, LivenessProbe, ProbeConfig, ProbeResult};
use edgeshift_proxy::{
    BoxFuture as ProxyFuture, CertificateCatalog, ProxyBackend, PublishError, RoutingTable,
    RoutingTablePublisher, SnapshotProxy,
};
use edgeshift_rollout::runtime::BoxFuture as RuntimeFuture;
use edgeshift_rollout::{
    ContainerRuntime, InstanceHandle, RolloutConfig, RolloutController, RolloutError, RolloutPhase,
    RuntimeError,
};
use edgeshift_state::{HistoryStore, InstanceRegistry, Role, RolloutKind, RolloutOutcome};
use edgeshift_telemetry::{TelemetryGatekeeper, TracingSink};
use tokio::time::Instant;

const HOST: &str = "a.example";

fn address(hostname: &str, version: &str) -> String {
    format!("{version}.{hostname}:8080")
}

// ── Collaborators ─────────────────────────────────────────────────

/// Answers per address; unknown addresses are healthy.
#[derive(Default)]
struct AddressProbe {
    results: Mutex<HashMap<String, ProbeResult>>,
}

impl AddressProbe {
    fn set(&self, address: &str, result: ProbeResult) {
        self.results
            .lock()
            .unwrap()
            .insert(address.to_string(), result);
    }
}

impl LivenessProbe for AddressProbe {
    fn check<'a>(&'a self, address: &'a str) -> ProbeFuture<'a, ProbeResult> {
        let result = self
            .results
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(ProbeResult::Healthy);
        Box::pin(async move { result })
    }
}

#[derive(Default)]
struct FakeRuntime {
    started: Mutex<Vec<InstanceHandle>>,
    stopped: Mutex<Vec<InstanceHandle>>,
    broken: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    fn break_version(&self, version: &str) {
        self.broken.lock().unwrap().insert(version.to_string());
    }

    fn was_stopped(&self, version: &str) -> bool {
        self.stopped
            .lock()
            .unwrap()
            .iter()
            .any(|h| h.version == version)
    }
}

impl ContainerRuntime for FakeRuntime {
    fn start<'a>(
        &'a self,
        hostname: &'a str,
        version: &'a str,
    ) -> RuntimeFuture<'a, Result<InstanceHandle, RuntimeError>> {
        Box::pin(async move {
            if self.broken.lock().unwrap().contains(version) {
                return Err(RuntimeError::Start("image pull failed".to_string()));
            }
            let handle = InstanceHandle {
                hostname: hostname.to_string(),
                version: version.to_string(),
                address: address(hostname, version),
            };
            self.started.lock().unwrap().push(handle.clone());
            Ok(handle)
        })
    }

    fn stop<'a>(&'a self, handle: &'a InstanceHandle) -> RuntimeFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.stopped.lock().unwrap().push(handle.clone());
            Ok(())
        })
    }

    fn list(&self) -> RuntimeFuture<'_, Result<Vec<InstanceHandle>, RuntimeError>> {
        Box::pin(async move {
            let stopped = self.stopped.lock().unwrap().clone();
            Ok(self
                .started
                .lock()
                .unwrap()
                .iter()
                .filter(|h| !stopped.contains(h))
                .cloned()
                .collect())
        })
    }
}

/// One acknowledged publication, plus which instances were draining when
/// the proxy accepted it.
#[derive(Clone)]
struct Published {
    table: RoutingTable,
    draining: Vec<String>,
}

struct RecordingProxy {
    inner: SnapshotProxy,
    registry: InstanceRegistry,
    log: Mutex<Vec<Published>>,
    /// How many of the next publications to refuse.
    rejecting: AtomicUsize,
}

impl RecordingProxy {
    fn reject_next(&self, n: usize) {
        self.rejecting.store(n, Ordering::SeqCst);
    }
}

impl ProxyBackend for RecordingProxy {
    fn apply<'a>(&'a self, table: &'a RoutingTable) -> ProxyFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            let refused = self
                .rejecting
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(PublishError::Rejected {
                    hostname: HOST.to_string(),
                    reason: "reload failed".to_string(),
                });
            }
            self.inner.apply(table).await?;
            let draining = self
                .registry
                .list()
                .into_iter()
                .filter(|i| i.drain_deadline.is_some())
                .map(|i| i.id)
                .collect();
            self.log.lock().unwrap().push(Published {
                table: table.clone(),
                draining,
            });
            Ok(())
        })
    }
}

// ── Harness ───────────────────────────────────────────────────────

struct Harness {
    registry: InstanceRegistry,
    history: HistoryStore,
    proxy: Arc<RecordingProxy>,
    runtime: Arc<FakeRuntime>,
    probe: Arc<AddressProbe>,
    controller: RolloutController,
}

fn config() -> RolloutConfig {
    RolloutConfig {
        deploy_timeout: Duration::from_secs(30),
        grace_period: Duration::from_secs(10),
        drain_period: Duration::from_secs(20),
        ..Default::default()
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_config(config())
    }

    fn with_config(config: RolloutConfig) -> Self {
        let registry = InstanceRegistry::new();
        let history = HistoryStore::open_in_memory().unwrap();
        let proxy = Arc::new(RecordingProxy {
            inner: SnapshotProxy::new(),
            registry: registry.clone(),
            log: Mutex::new(Vec::new()),
            rejecting: AtomicUsize::new(0),
        });
        let certs = Arc::new(CertificateCatalog::new());
        certs.insert("*.example", false);
        let publisher = Arc::new(RoutingTablePublisher::new(
            proxy.clone(),
            certs,
            Duration::from_secs(5),
        ));
        let probe = Arc::new(AddressProbe::default());
        let prober = HealthProber::new(
            registry.clone(),
            probe.clone(),
            ProbeConfig {
                interval: Duration::from_secs(1),
                max_backoff: Duration::from_secs(4),
                ..Default::default()
            },
        );
        let gatekeeper = TelemetryGatekeeper::new(
            registry.clone(),
            Arc::new(TracingSink),
            config.drain_period,
        );
        let runtime = Arc::new(FakeRuntime::default());
        let controller = RolloutController::new(
            registry.clone(),
            history.clone(),
            prober,
            publisher,
            gatekeeper,
            runtime.clone(),
            config,
        );
        Self {
            registry,
            history,
            proxy,
            runtime,
            probe,
            controller,
        }
    }

    /// Deploy a version and require it to succeed.
    async fn roll_to(&self, version: &str) {
        let record = self.controller.deploy(HOST, version).unwrap().wait().await.unwrap();
        assert_eq!(record.outcome, RolloutOutcome::Succeeded, "deploy {version}");
    }

    fn live_version(&self) -> Option<String> {
        self.registry.live(HOST).map(|i| i.version)
    }

    /// (address, weight) pairs currently routed for HOST.
    fn routed(&self) -> Vec<(String, u32)> {
        routes(&self.proxy.inner.snapshot(), HOST)
    }

    fn publications(&self) -> Vec<Published> {
        self.proxy.log.lock().unwrap().clone()
    }

    /// Wait until old and new are both routed.
    async fn wait_for_dual_serving(&self) {
        for _ in 0..100 {
            if self.routed().len() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("never dual-served");
    }

    async fn wait_for_phase(&self, name: &str) {
        for _ in 0..100 {
            if self.controller.phase(HOST).name() == name {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("never reached phase {name}");
    }
}

fn routes(table: &RoutingTable, hostname: &str) -> Vec<(String, u32)> {
    let mut routes: Vec<(String, u32)> = table
        .entries(hostname)
        .iter()
        .map(|e| (e.endpoint.clone(), e.weight))
        .collect();
    routes.sort();
    routes
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn healthy_candidate_replaces_live_instance() {
    let h = Harness::new();
    h.roll_to("v1").await;
    assert_eq!(h.routed(), vec![(address(HOST, "v1"), 100)]);

    let record = h.controller.deploy(HOST, "v2").unwrap().wait().await.unwrap();

    assert_eq!(record.outcome, RolloutOutcome::Succeeded);
    assert_eq!(record.kind, RolloutKind::Deploy);
    assert_eq!(record.from_version.as_deref(), Some("v1"));
    assert_eq!(record.to_version, "v2");

    let published = h.publications();
    assert_eq!(published.len(), 3);
    let dual = routes(&published[1].table, HOST);
    assert_eq!(dual.len(), 2);
    assert!(dual.iter().all(|(_, w)| *w > 0));
    assert_eq!(
        routes(&published[2].table, HOST),
        vec![(address(HOST, "v2"), 100)]
    );

    assert_eq!(h.live_version().as_deref(), Some("v2"));
    assert_eq!(h.registry.instances(HOST).len(), 1);
    assert!(h.registry.live(HOST).unwrap().shipping);
    assert!(h.runtime.was_stopped("v1"));
    assert_eq!(h.controller.phase(HOST), RolloutPhase::Idle);

    let history = h.history.list(HOST).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1], record);
}

#[tokio::test(start_paused = true)]
async fn routing_is_published_before_drain_starts() {
    let h = Harness::new();
    h.roll_to("v1").await;
    let old = h.registry.live(HOST).unwrap();

    let handle = h.controller.deploy(HOST, "v2").unwrap();
    h.wait_for_phase("draining").await;

    // The old instance is unpublished but still registered while it drains.
    assert_eq!(h.routed(), vec![(address(HOST, "v2"), 100)]);
    let draining = h.registry.get(&old.id).unwrap();
    assert_eq!(draining.role, Role::Retiring);
    assert!(draining.drain_deadline.is_some());
    assert_eq!(h.registry.live_count(HOST), 1);

    handle.wait().await.unwrap();

    // When the proxy acknowledged each table, nothing had started draining.
    for publication in h.publications() {
        assert!(publication.draining.is_empty());
    }
    assert!(h.registry.get(&old.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn candidate_that_never_turns_healthy_fails() {
    let h = Harness::new();
    h.roll_to("v1").await;
    h.probe.set(&address(HOST, "v2"), ProbeResult::Failed);
    let generation = h.proxy.inner.snapshot().generation;

    let started = Instant::now();
    let record = h.controller.deploy(HOST, "v2").unwrap().wait().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(matches!(&record.outcome, RolloutOutcome::Failed { reason } if reason.contains("not healthy")));
    assert!(matches!(h.controller.phase(HOST), RolloutPhase::Failed { .. }));

    // Live instance and routing table untouched.
    assert_eq!(h.live_version().as_deref(), Some("v1"));
    assert_eq!(h.routed(), vec![(address(HOST, "v1"), 100)]);
    assert_eq!(h.proxy.inner.snapshot().generation, generation);
    assert_eq!(h.registry.instances(HOST).len(), 1);
    assert!(h.runtime.was_stopped("v2"));

    let failures: Vec<_> = h
        .history
        .list(HOST)
        .unwrap()
        .into_iter()
        .filter(|r| !r.outcome.is_success())
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].to_version, "v2");
    assert_eq!(failures[0].from_version.as_deref(), Some("v1"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_deploys_admit_exactly_one() {
    let h = Harness::new();
    h.roll_to("v1").await;

    let (first, second) = tokio::join!(async { h.controller.deploy(HOST, "v2") }, async {
        h.controller.deploy(HOST, "v3")
    });

    let (winner, loser) = match (first, second) {
        (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
        _ => panic!("exactly one deploy must proceed"),
    };
    assert!(matches!(loser, RolloutError::RolloutInProgress { .. }));
    assert!(loser.is_conflict());

    winner.wait().await.unwrap();
    // The rejected version was never registered.
    assert_eq!(h.registry.instances(HOST).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn deploying_the_live_version_is_a_conflict() {
    let h = Harness::new();
    h.roll_to("v1").await;

    let err = h.controller.deploy(HOST, "v1").unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.controller.phase(HOST), RolloutPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn rollback_returns_to_previous_version() {
    let h = Harness::new();
    h.roll_to("v1").await;
    h.roll_to("v2").await;

    let handle = h.controller.rollback(HOST).await.unwrap();
    assert_eq!(handle.version, "v1");
    assert!(matches!(h.controller.phase(HOST), RolloutPhase::RollingBack { .. }));

    let record = handle.wait().await.unwrap();
    assert_eq!(record.kind, RolloutKind::Rollback);
    assert_eq!(record.from_version.as_deref(), Some("v2"));
    assert_eq!(record.to_version, "v1");
    assert_eq!(record.outcome, RolloutOutcome::Succeeded);
    assert_eq!(h.live_version().as_deref(), Some("v1"));
    assert_eq!(h.routed(), vec![(address(HOST, "v1"), 100)]);
}

#[tokio::test(start_paused = true)]
async fn rollback_without_history_changes_nothing() {
    let h = Harness::new();
    h.roll_to("v1").await;
    h.roll_to("v2").await;
    let generation = h.proxy.inner.snapshot().generation;

    let err = h.controller.rollback_to(HOST, "v9").await.unwrap_err();
    assert!(matches!(err, RolloutError::NoRollbackTarget { version: Some(v), .. } if v == "v9"));

    let err = h.controller.rollback("fresh.example").await.unwrap_err();
    assert!(matches!(err, RolloutError::NoRollbackTarget { version: None, .. }));

    assert_eq!(h.history.list(HOST).unwrap().len(), 2);
    assert_eq!(h.registry.instances(HOST).len(), 1);
    assert_eq!(h.proxy.inner.snapshot().generation, generation);
    assert_eq!(h.controller.phase(HOST), RolloutPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn rollback_preempts_a_deploying_candidate() {
    let h = Harness::new();
    h.roll_to("v1").await;
    h.roll_to("v2").await;
    h.probe.set(&address(HOST, "v3"), ProbeResult::Failed);

    let deploying = h.controller.deploy(HOST, "v3").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let rollback = h.controller.rollback(HOST).await.unwrap();
    assert_eq!(rollback.version, "v1");
    assert_eq!(deploying.wait().await.unwrap().outcome, RolloutOutcome::Aborted);

    rollback.wait().await.unwrap();
    assert_eq!(h.live_version().as_deref(), Some("v1"));
    assert!(h.runtime.was_stopped("v3"));
}

#[tokio::test(start_paused = true)]
async fn abort_tears_down_candidate_only() {
    let h = Harness::new();
    h.roll_to("v1").await;
    h.probe.set(&address(HOST, "v2"), ProbeResult::Failed);

    let handle = h.controller.deploy(HOST, "v2").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let record = h.controller.abort(HOST).await.unwrap().unwrap();
    assert_eq!(record.outcome, RolloutOutcome::Aborted);
    assert_eq!(handle.wait().await.unwrap(), record);

    assert_eq!(h.controller.phase(HOST), RolloutPhase::Idle);
    assert_eq!(h.live_version().as_deref(), Some("v1"));
    assert_eq!(h.registry.instances(HOST).len(), 1);
    assert_eq!(h.routed(), vec![(address(HOST, "v1"), 100)]);
    assert!(h.runtime.was_stopped("v2"));
}

#[tokio::test(start_paused = true)]
async fn abort_after_promotion_is_refused() {
    let h = Harness::new();
    h.roll_to("v1").await;

    let handle = h.controller.deploy(HOST, "v2").unwrap();
    h.wait_for_phase("promoting").await;

    let err = h.controller.abort(HOST).await.unwrap_err();
    assert!(matches!(err, RolloutError::CannotCancel { .. }));
    let err = h.controller.rollback(HOST).await.unwrap_err();
    assert!(matches!(err, RolloutError::CannotCancel { .. }));

    assert_eq!(handle.wait().await.unwrap().outcome, RolloutOutcome::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn abort_acknowledges_failure() {
    let h = Harness::new();
    h.roll_to("v1").await;

    let err = h.controller.abort(HOST).await.unwrap_err();
    assert!(matches!(err, RolloutError::NotInProgress(_)));

    h.runtime.break_version("v2");
    let record = h.controller.deploy(HOST, "v2").unwrap().wait().await.unwrap();
    assert!(matches!(&record.outcome, RolloutOutcome::Failed { reason } if reason.contains("image pull failed")));
    assert!(matches!(h.controller.phase(HOST), RolloutPhase::Failed { .. }));

    assert!(h.controller.abort(HOST).await.unwrap().is_none());
    assert_eq!(h.controller.phase(HOST), RolloutPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn failed_hostname_accepts_a_new_deploy() {
    let h = Harness::new();
    h.roll_to("v1").await;
    h.runtime.break_version("v2");
    h.controller.deploy(HOST, "v2").unwrap().wait().await.unwrap();

    h.roll_to("v3").await;
    assert_eq!(h.live_version().as_deref(), Some("v3"));
}

#[tokio::test(start_paused = true)]
async fn uncovered_hostname_fails_before_going_live() {
    let h = Harness::new();

    let record = h
        .controller
        .deploy("shop.test", "v1")
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(matches!(&record.outcome, RolloutOutcome::Failed { reason } if reason.contains("no certificate")));
    assert!(h.registry.instances("shop.test").is_empty());
    assert!(h.proxy.inner.lookup("shop.test").is_empty());
    assert!(h.runtime.was_stopped("v1"));
}

#[tokio::test(start_paused = true)]
async fn rejected_dual_publication_keeps_previous_live() {
    let h = Harness::new();
    h.roll_to("v1").await;
    h.proxy.reject_next(1);

    let record = h.controller.deploy(HOST, "v2").unwrap().wait().await.unwrap();

    assert!(matches!(&record.outcome, RolloutOutcome::Failed { reason } if reason.contains("reload failed")));
    assert!(matches!(h.controller.phase(HOST), RolloutPhase::Failed { .. }));
    assert_eq!(h.live_version().as_deref(), Some("v1"));
    assert_eq!(h.routed(), vec![(address(HOST, "v1"), 100)]);

    let instances = h.registry.instances(HOST);
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].role, Role::Live);
    assert!(h.runtime.was_stopped("v2"));
    assert!(!h.runtime.was_stopped("v1"));

    let history = h.history.list(HOST).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1], record);
}

#[tokio::test(start_paused = true)]
async fn rejected_unpublish_is_retried() {
    let h = Harness::new();
    h.roll_to("v1").await;

    let handle = h.controller.deploy(HOST, "v2").unwrap();
    h.wait_for_dual_serving().await;
    h.proxy.reject_next(2);

    let record = handle.wait().await.unwrap();
    assert_eq!(record.outcome, RolloutOutcome::Succeeded);
    assert_eq!(h.routed(), vec![(address(HOST, "v2"), 100)]);
    assert_eq!(h.registry.instances(HOST).len(), 1);
    assert!(h.runtime.was_stopped("v1"));
}

#[tokio::test(start_paused = true)]
async fn unpublish_that_keeps_failing_still_retires_previous() {
    let h = Harness::new();
    h.roll_to("v1").await;

    let handle = h.controller.deploy(HOST, "v2").unwrap();
    h.wait_for_dual_serving().await;
    h.proxy.reject_next(usize::MAX);

    let record = handle.wait().await.unwrap();
    assert!(matches!(&record.outcome, RolloutOutcome::Failed { reason } if reason.contains("failed to unpublish")));
    assert_eq!(h.live_version().as_deref(), Some("v2"));
    let instances = h.registry.instances(HOST);
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].version, "v2");
    assert!(h.runtime.was_stopped("v1"));

    // Once the proxy accepts tables again, v1 is a valid rollback target.
    h.proxy.reject_next(0);
    assert!(h.controller.abort(HOST).await.unwrap().is_none());
    let record = h.controller.rollback(HOST).await.unwrap().wait().await.unwrap();
    assert_eq!(record.outcome, RolloutOutcome::Succeeded);
    assert_eq!(record.to_version, "v1");
    assert_eq!(h.live_version().as_deref(), Some("v1"));
    assert_eq!(h.routed(), vec![(address(HOST, "v1"), 100)]);
}

#[tokio::test(start_paused = true)]
async fn queries_for_unknown_hostnames_leave_no_trace() {
    let h = Harness::new();
    h.roll_to("v1").await;

    let status = h.controller.status("ghost.example").unwrap();
    assert!(status.live.is_none() && status.instances.is_empty());
    assert!(matches!(
        h.controller.rollback("never.example").await,
        Err(RolloutError::NoRollbackTarget { .. })
    ));
    assert!(h.controller.abort("never.example").await.is_err());

    let hostnames: Vec<String> = h
        .controller
        .statuses()
        .unwrap()
        .into_iter()
        .map(|s| s.hostname)
        .collect();
    assert_eq!(hostnames, vec![HOST]);
}

#[tokio::test(start_paused = true)]
async fn history_respects_retention() {
    let h = Harness::with_config(RolloutConfig {
        history_retention: 2,
        ..config()
    });
    h.roll_to("v1").await;
    h.roll_to("v2").await;
    h.roll_to("v3").await;

    let history = h.history.list(HOST).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].to_version, "v2");
    assert_eq!(history[1].to_version, "v3");
}

#[tokio::test(start_paused = true)]
async fn status_reports_phase_instances_and_history() {
    let h = Harness::new();
    h.roll_to("v1").await;

    let status = h.controller.status(HOST).unwrap();
    assert_eq!(status.phase, RolloutPhase::Idle);
    assert_eq!(status.live.unwrap().version, "v1");
    assert_eq!(status.instances.len(), 1);
    assert_eq!(status.history.len(), 1);

    let all = h.controller.statuses().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].hostname, HOST);
}
