//! redb table definitions for the rollout history store.
//!
//! Keys are `{hostname}:{sequence}` with a zero-padded sequence so that a
//! range scan over one hostname yields records in append order.

use redb::TableDefinition;

/// Rollout records keyed by `{hostname}:{sequence:020}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Build the table key for a record.
pub fn rollout_key(hostname: &str, sequence: u64) -> String {
    format!("{hostname}:{sequence:020}")
}

/// Half-open key range `[start, end)` covering every record of a hostname.
///
/// `;` sorts directly after `:`, and hostnames never contain either.
pub fn hostname_range(hostname: &str) -> (String, String) {
    (format!("{hostname}:"), format!("{hostname};"))
}

/// Extract the sequence number from a table key.
pub fn sequence_of(key: &str) -> Option<u64> {
    key.rsplit_once(':').and_then(|(_, seq)| seq.parse().ok())
}
