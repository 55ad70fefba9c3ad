//! Routing table publisher.
//!
//! Derives the proxy's desired table from live-set changes, diffs it
//! against the last acknowledged table and publishes full snapshots.
//! Publications are serialized: the last-published table is locked for the
//! whole apply, so two hostnames publishing concurrently cannot overwrite
//! each other's entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use edgeshift_state::RoutingEntry;

use crate::certs::CertificateSource;
use crate::error::PublishError;
use crate::routing::{ProxyBackend, RoutingDiff, RoutingTable};

pub struct RoutingTablePublisher {
    proxy: Arc<dyn ProxyBackend>,
    certs: Arc<dyn CertificateSource>,
    /// Last table the proxy acknowledged.
    published: Mutex<RoutingTable>,
    publish_timeout: Duration,
}

impl RoutingTablePublisher {
    pub fn new(
        proxy: Arc<dyn ProxyBackend>,
        certs: Arc<dyn CertificateSource>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            proxy,
            certs,
            published: Mutex::new(RoutingTable::default()),
            publish_timeout,
        }
    }

    /// Make the proxy's table equal `desired` (every hostname).
    pub async fn reconcile(&self, desired: Vec<RoutingEntry>) -> Result<RoutingDiff, PublishError> {
        let mut published = self.published.lock().await;
        let desired = RoutingTable::from_entries(desired);
        self.publish_locked(&mut published, desired).await
    }

    /// Replace the entries of one hostname, leaving the others untouched.
    pub async fn reconcile_host(
        &self,
        hostname: &str,
        entries: Vec<RoutingEntry>,
    ) -> Result<RoutingDiff, PublishError> {
        let mut published = self.published.lock().await;
        let desired = published.with_host(hostname, entries);
        self.publish_locked(&mut published, desired).await
    }

    async fn publish_locked(
        &self,
        published: &mut RoutingTable,
        mut desired: RoutingTable,
    ) -> Result<RoutingDiff, PublishError> {
        let diff = published.diff(&desired);
        if diff.is_empty() {
            debug!("routing table unchanged, nothing to publish");
            return Ok(diff);
        }

        for hostname in diff.hostnames() {
            if !desired.entries(hostname).is_empty() && !self.certs.covers(hostname) {
                warn!(%hostname, "refusing to route hostname without a certificate");
                return Err(PublishError::Uncovered(hostname.to_string()));
            }
        }

        desired.generation = published.generation + 1;
        match tokio::time::timeout(self.publish_timeout, self.proxy.apply(&desired)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, generation = desired.generation, "proxy rejected routing table");
                return Err(e);
            }
            Err(_) => {
                warn!(generation = desired.generation, "proxy publish timed out");
                return Err(PublishError::Timeout(self.publish_timeout));
            }
        }

        info!(
            generation = desired.generation,
            added = diff.added.len(),
            removed = diff.removed.len(),
            reweighted = diff.reweighted.len(),
            "routing table published"
        );
        *published = desired;
        Ok(diff)
    }

    /// Copy of the last acknowledged table.
    pub async fn published(&self) -> RoutingTable {
        self.published.lock().await.clone()
    }

    /// Last acknowledged entries for one hostname.
    pub async fn entries(&self, hostname: &str) -> Vec<RoutingEntry> {
        self.published.lock().await.entries(hostname).to_vec()
    }
}
