//! Error types for the registry and the history store.

use thiserror::Error;

use crate::types::{HealthState, Role};

/// Result type alias for history store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during history store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// Errors returned by [`InstanceRegistry`](crate::InstanceRegistry) mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("version {version} is already running for {hostname}")]
    DuplicateVersion { hostname: String, version: String },

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("instance {id} is not healthy (health={health})")]
    NoHealthyCandidate { id: String, health: HealthState },

    #[error("instance {id} has role {role}, expected {expected}")]
    InvalidRole {
        id: String,
        role: Role,
        expected: Role,
    },

    #[error("instance {0} has not finished draining")]
    DrainPending(String),
}

impl RegistryError {
    /// Conflict errors are rejected with no state change and may be retried later.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::DuplicateVersion { .. })
    }
}
