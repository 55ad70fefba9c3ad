//! HistoryStore: redb-backed, append-only rollout history.
//!
//! Every promotion, failure, abort and rollback decision is appended as a
//! JSON-serialized [`RolloutRecord`]. Records are never rewritten; the only
//! deletion path is retention truncation of the oldest entries.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe rollout history backed by redb.
#[derive(Clone)]
pub struct HistoryStore {
    db: Arc<Database>,
}

impl HistoryStore {
    /// Open (or create) a persistent history store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "history store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory history store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory history store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Append a record; returns its sequence number within the hostname.
    pub fn append(&self, record: &RolloutRecord) -> StateResult<u64> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let (start, end) = hostname_range(&record.hostname);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let sequence;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let last = table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .next_back()
                .transpose()
                .map_err(map_err!(Read))?
                .and_then(|(key, _)| sequence_of(key.value()));
            sequence = last.map_or(1, |s| s + 1);

            let key = rollout_key(&record.hostname, sequence);
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(
            hostname = %record.hostname,
            sequence,
            to = %record.to_version,
            outcome = ?record.outcome,
            "rollout record appended"
        );
        Ok(sequence)
    }

    /// All records for a hostname, oldest first.
    pub fn list(&self, hostname: &str) -> StateResult<Vec<RolloutRecord>> {
        let (start, end) = hostname_range(hostname);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: RolloutRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// The newest `n` records for a hostname, oldest first.
    pub fn tail(&self, hostname: &str, n: usize) -> StateResult<Vec<RolloutRecord>> {
        let mut records = self.list(hostname)?;
        let skip = records.len().saturating_sub(n);
        Ok(records.split_off(skip))
    }

    /// Most recent successful rollout *to* `version`.
    pub fn last_successful_to(
        &self,
        hostname: &str,
        version: &str,
    ) -> StateResult<Option<RolloutRecord>> {
        Ok(self
            .list(hostname)?
            .into_iter()
            .rev()
            .find(|r| r.outcome.is_success() && r.to_version == version))
    }

    /// Most recent successful rollout whose target differs from `current`.
    ///
    /// This is the version a plain rollback returns to.
    pub fn rollback_target(
        &self,
        hostname: &str,
        current: Option<&str>,
    ) -> StateResult<Option<RolloutRecord>> {
        Ok(self
            .list(hostname)?
            .into_iter()
            .rev()
            .find(|r| r.outcome.is_success() && Some(r.to_version.as_str()) != current))
    }

    /// Drop the oldest records so that at most `keep` remain. Returns the
    /// number removed.
    pub fn truncate(&self, hostname: &str, keep: usize) -> StateResult<u32> {
        let (start, end) = hostname_range(hostname);
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut all = Vec::new();
            for entry in table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                let (key, _) = entry.map_err(map_err!(Read))?;
                all.push(key.value().to_string());
            }
            let excess = all.len().saturating_sub(keep);
            all.into_iter().take(excess).collect()
        };
        if keys.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%hostname, removed = keys.len(), "rollout history truncated");
        Ok(keys.len() as u32)
    }
}
