//! Routing table snapshots and the proxy backends that consume them.
//!
//! A [`RoutingTable`] is always handed to the proxy whole. `SnapshotProxy`
//! swaps it in with a single atomic pointer store; `FileProxy` writes a
//! temp file and renames it over the previous one.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use edgeshift_core::is_valid_hostname;
use edgeshift_state::RoutingEntry;

use crate::error::PublishError;

/// Boxed future returned by [`ProxyBackend`] implementations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A downstream proxy that accepts full routing-table snapshots.
pub trait ProxyBackend: Send + Sync {
    /// Apply `table` as the complete routing configuration. Returns once the
    /// proxy has acknowledged it.
    fn apply<'a>(&'a self, table: &'a RoutingTable) -> BoxFuture<'a, Result<(), PublishError>>;
}

/// Complete routing configuration: hostname → weighted targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Bumped on every publication.
    pub generation: u64,
    pub hosts: BTreeMap<String, Vec<RoutingEntry>>,
}

impl RoutingTable {
    /// Build a table from a flat list of entries. Zero-weight entries are dropped.
    pub fn from_entries(entries: impl IntoIterator<Item = RoutingEntry>) -> Self {
        let mut hosts: BTreeMap<String, Vec<RoutingEntry>> = BTreeMap::new();
        for entry in entries.into_iter().filter(|e| e.weight > 0) {
            hosts.entry(entry.hostname.clone()).or_default().push(entry);
        }
        for entries in hosts.values_mut() {
            entries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        }
        Self {
            generation: 0,
            hosts,
        }
    }

    /// Copy of this table with one hostname's entries replaced.
    pub fn with_host(&self, hostname: &str, entries: Vec<RoutingEntry>) -> Self {
        let mut next = self.clone();
        let mut entries: Vec<RoutingEntry> = entries.into_iter().filter(|e| e.weight > 0).collect();
        entries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        if entries.is_empty() {
            next.hosts.remove(hostname);
        } else {
            next.hosts.insert(hostname.to_string(), entries);
        }
        next
    }

    pub fn entries(&self, hostname: &str) -> &[RoutingEntry] {
        self.hosts.get(hostname).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn all_entries(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.hosts.values().flatten()
    }

    /// Entries that differ between `self` (published) and `desired`.
    pub fn diff(&self, desired: &RoutingTable) -> RoutingDiff {
        let current: BTreeMap<(&str, &str), &RoutingEntry> = self
            .all_entries()
            .map(|e| ((e.hostname.as_str(), e.instance_id.as_str()), e))
            .collect();
        let wanted: BTreeMap<(&str, &str), &RoutingEntry> = desired
            .all_entries()
            .map(|e| ((e.hostname.as_str(), e.instance_id.as_str()), e))
            .collect();

        let mut diff = RoutingDiff::default();
        for (key, entry) in &wanted {
            match current.get(key) {
                None => diff.added.push((*entry).clone()),
                Some(old) if *old != *entry => diff.reweighted.push((*entry).clone()),
                Some(_) => {}
            }
        }
        for (key, entry) in &current {
            if !wanted.contains_key(key) {
                diff.removed.push((*entry).clone());
            }
        }
        diff
    }
}

/// Minimal set of changes between two routing tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingDiff {
    pub added: Vec<RoutingEntry>,
    pub removed: Vec<RoutingEntry>,
    /// Present in both, with a different weight or endpoint.
    pub reweighted: Vec<RoutingEntry>,
}

impl RoutingDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reweighted.is_empty()
    }

    /// Hostnames touched by this diff.
    pub fn hostnames(&self) -> BTreeSet<&str> {
        self.added
            .iter()
            .chain(&self.removed)
            .chain(&self.reweighted)
            .map(|e| e.hostname.as_str())
            .collect()
    }
}

/// Reject tables the proxy cannot load.
pub fn validate_table(table: &RoutingTable) -> Result<(), PublishError> {
    for (hostname, entries) in &table.hosts {
        if !is_valid_hostname(hostname) {
            return Err(PublishError::Rejected {
                hostname: hostname.clone(),
                reason: "malformed hostname".to_string(),
            });
        }
        for entry in entries {
            if entry.hostname != *hostname {
                return Err(PublishError::Rejected {
                    hostname: hostname.clone(),
                    reason: format!("entry {} filed under the wrong hostname", entry.instance_id),
                });
            }
            if entry.endpoint.is_empty() {
                return Err(PublishError::Rejected {
                    hostname: hostname.clone(),
                    reason: format!("entry {} has no endpoint", entry.instance_id),
                });
            }
        }
    }
    Ok(())
}

// ── In-process proxy ──────────────────────────────────────────────

/// In-process proxy view: readers load the current snapshot lock-free and
/// always see a complete table.
pub struct SnapshotProxy {
    table: ArcSwap<RoutingTable>,
}

impl SnapshotProxy {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RoutingTable::default()),
        }
    }

    /// The currently active table.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Current targets for a hostname.
    pub fn lookup(&self, hostname: &str) -> Vec<RoutingEntry> {
        self.table.load().entries(hostname).to_vec()
    }
}

impl Default for SnapshotProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyBackend for SnapshotProxy {
    fn apply<'a>(&'a self, table: &'a RoutingTable) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            validate_table(table)?;
            self.table.store(Arc::new(table.clone()));
            debug!(generation = table.generation, "snapshot proxy swapped table");
            Ok(())
        })
    }
}

// ── File provider ─────────────────────────────────────────────────

/// Publishes the table as a JSON file for a file-watching proxy.
///
/// The file is replaced by rename, so a watcher never reads a partial write.
pub struct FileProxy {
    path: PathBuf,
}

impl FileProxy {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ProxyBackend for FileProxy {
    fn apply<'a>(&'a self, table: &'a RoutingTable) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            validate_table(table)?;
            let body =
                serde_json::to_vec_pretty(table).map_err(|e| PublishError::Io(e.to_string()))?;
            let tmp = self.temp_path();
            tokio::fs::write(&tmp, &body)
                .await
                .map_err(|e| PublishError::Io(e.to_string()))?;
            tokio::fs::rename(&tmp, &self.path)
                .await
                .map_err(|e| PublishError::Io(e.to_string()))?;
            debug!(path = ?self.path, generation = table.generation, "routing file written");
            Ok(())
        })
    }
}
