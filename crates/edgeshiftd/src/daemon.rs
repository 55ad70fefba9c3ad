//! Subsystem wiring: config in, running API router out.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tracing::info;

use edgeshift_api::{ApiState, build_router};
use edgeshift_core::EdgeshiftConfig;
use edgeshift_health::{HealthProber, HttpProbe, ProbeConfig};
use edgeshift_proxy::{
    CertificateCatalog, FileProxy, ProxyBackend, RoutingTablePublisher, SnapshotProxy,
};
use edgeshift_rollout::{RolloutConfig, RolloutController, StaticRuntime};
use edgeshift_state::{HistoryStore, InstanceRegistry};
use edgeshift_telemetry::{TelemetryGatekeeper, TracingSink};

/// File name of the rollout history database inside `server.data_dir`.
pub const HISTORY_FILE: &str = "edgeshift.redb";

/// Every long-lived subsystem of one edgeshift process.
pub struct Daemon {
    pub registry: InstanceRegistry,
    pub prober: HealthProber,
    pub publisher: Arc<RoutingTablePublisher>,
    pub controller: RolloutController,
}

impl Daemon {
    /// Wire the subsystems described by `config` around an opened history store.
    pub fn assemble(config: &EdgeshiftConfig, history: HistoryStore) -> Self {
        let registry = InstanceRegistry::new();

        let probe_config = probe_config(config);
        let probe = Arc::new(HttpProbe::from_config(&probe_config));
        let prober = HealthProber::new(registry.clone(), probe, probe_config);

        let certs = Arc::new(certificate_catalog(config));
        let publisher = Arc::new(RoutingTablePublisher::new(
            proxy_backend(config),
            certs,
            config.publish_timeout(),
        ));

        let gatekeeper = TelemetryGatekeeper::new(
            registry.clone(),
            Arc::new(TracingSink),
            config.drain_period(),
        );

        let runtime = Arc::new(StaticRuntime::from_hosts(&config.hosts));

        let controller = RolloutController::new(
            registry.clone(),
            history,
            prober.clone(),
            publisher.clone(),
            gatekeeper,
            runtime,
            RolloutConfig::from_config(config),
        );

        info!(hosts = config.hosts.len(), "subsystems assembled");

        Self {
            registry,
            prober,
            publisher,
            controller,
        }
    }

    pub fn router(&self) -> Router {
        build_router(ApiState {
            controller: self.controller.clone(),
            registry: self.registry.clone(),
            publisher: self.publisher.clone(),
        })
    }

    /// Stop every probe loop.
    pub async fn shutdown(&self) {
        self.prober.stop_all().await;
        info!("health probes stopped");
    }
}

/// Create `server.data_dir` if needed and open the history database in it.
pub fn open_history(config: &EdgeshiftConfig) -> anyhow::Result<(HistoryStore, PathBuf)> {
    std::fs::create_dir_all(&config.server.data_dir)?;
    let path = config.server.data_dir.join(HISTORY_FILE);
    let store = HistoryStore::open(&path)?;
    info!(path = ?path, "history store opened");
    Ok((store, path))
}

fn probe_config(config: &EdgeshiftConfig) -> ProbeConfig {
    ProbeConfig {
        endpoint: config.health.endpoint.clone(),
        interval: config.probe_interval(),
        timeout: config.probe_timeout(),
        healthy_threshold: config.health.healthy_threshold,
        unhealthy_threshold: config.health.unhealthy_threshold,
        max_backoff: config.max_backoff(),
    }
}

fn certificate_catalog(config: &EdgeshiftConfig) -> CertificateCatalog {
    let catalog = CertificateCatalog::new();
    for cert in &config.certificates {
        catalog.insert(&cert.server_name, cert.default);
    }
    catalog
}

fn proxy_backend(config: &EdgeshiftConfig) -> Arc<dyn ProxyBackend> {
    match &config.proxy.routes_file {
        Some(path) => {
            info!(path = ?path, "publishing routes to file");
            Arc::new(FileProxy::new(path))
        }
        None => {
            info!("no routes_file configured, keeping routes in memory");
            Arc::new(SnapshotProxy::new())
        }
    }
}

/// Human-readable digest printed by `edgeshiftd check`.
pub fn summary(config: &EdgeshiftConfig) -> String {
    let mut out = format!(
        "listen {}\ndata_dir {}\n",
        config.server.listen,
        config.server.data_dir.display()
    );
    out.push_str(&format!(
        "rollout: deploy_timeout {:?}, grace {:?}, drain {:?}, publish_timeout {:?}\n",
        config.deploy_timeout(),
        config.grace_period(),
        config.drain_period(),
        config.publish_timeout()
    ));
    out.push_str(&format!(
        "health: GET {} every {:?} (healthy after {}, unhealthy after {})\n",
        config.health.endpoint,
        config.probe_interval(),
        config.health.healthy_threshold,
        config.health.unhealthy_threshold
    ));
    for cert in &config.certificates {
        let marker = if cert.default { " (default)" } else { "" };
        out.push_str(&format!("certificate {}{marker}\n", cert.server_name));
    }
    for host in &config.hosts {
        let versions: Vec<&str> = host.versions.iter().map(|v| v.version.as_str()).collect();
        out.push_str(&format!("host {} [{}]\n", host.hostname, versions.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[server]
listen = "127.0.0.1:0"

[health]
endpoint = "/ready"
interval = "500ms"
healthy_threshold = 2

[[certificates]]
server_name = "*.example.com"

[[certificates]]
server_name = "fallback.test"
default = true

[[hosts]]
hostname = "api.example.com"
versions = [
  { version = "v1", address = "127.0.0.1:9001" },
  { version = "v2", address = "127.0.0.1:9002" },
]
"#;

    #[test]
    fn probe_config_follows_health_section() {
        let config = EdgeshiftConfig::from_toml(CONFIG).unwrap();
        let probe = probe_config(&config);
        assert_eq!(probe.endpoint, "/ready");
        assert_eq!(probe.interval, std::time::Duration::from_millis(500));
        assert_eq!(probe.healthy_threshold, 2);
        assert_eq!(probe.unhealthy_threshold, 3);
    }

    #[test]
    fn catalog_holds_configured_certificates() {
        let config = EdgeshiftConfig::from_toml(CONFIG).unwrap();
        let catalog = certificate_catalog(&config);
        let mut names = catalog.server_names();
        names.sort();
        assert_eq!(names, vec!["*.example.com", "fallback.test"]);
        assert_eq!(
            catalog.resolve("api.example.com").as_deref(),
            Some("*.example.com")
        );
    }

    #[test]
    fn summary_lists_hosts_and_certificates() {
        let config = EdgeshiftConfig::from_toml(CONFIG).unwrap();
        let text = summary(&config);
        assert!(text.contains("host api.example.com [v1, v2]"));
        assert!(text.contains("certificate fallback.test (default)"));
        assert!(text.contains("GET /ready"));
    }

    #[test]
    fn open_history_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EdgeshiftConfig::default();
        config.server.data_dir = dir.path().join("nested").join("state");

        let (_store, path) = open_history(&config).unwrap();
        assert!(config.server.data_dir.is_dir());
        assert_eq!(path, config.server.data_dir.join(HISTORY_FILE));
    }
}
