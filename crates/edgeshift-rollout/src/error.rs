use thiserror::Error;

use edgeshift_state::{RegistryError, StateError};

/// Errors returned synchronously by [`RolloutController`](crate::RolloutController)
/// commands. Failures inside a running rollout end up in its record instead.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("a rollout is already in progress for {hostname} ({phase})")]
    RolloutInProgress { hostname: String, phase: String },

    #[error("rollout for {hostname} can no longer be cancelled ({phase})")]
    CannotCancel { hostname: String, phase: String },

    #[error("no rollout in progress for {0}")]
    NotInProgress(String),

    #[error("no successful rollout to roll back to for {hostname}{}", version_suffix(.version))]
    NoRollbackTarget {
        hostname: String,
        version: Option<String>,
    },

    #[error("rollout task for {0} ended without a result")]
    Interrupted(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("history store: {0}")]
    State(#[from] StateError),
}

fn version_suffix(version: &Option<String>) -> String {
    version
        .as_ref()
        .map(|v| format!(" (version {v})"))
        .unwrap_or_default()
}

impl RolloutError {
    /// Rejected with no state change; retry later or pick another target.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::RolloutInProgress { .. } => true,
            Self::Registry(e) => e.is_conflict(),
            _ => false,
        }
    }
}
