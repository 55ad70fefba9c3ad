//! Errors surfaced while publishing a routing table.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("proxy rejected routes for {hostname}: {reason}")]
    Rejected { hostname: String, reason: String },

    #[error("no certificate covers {0}")]
    Uncovered(String),

    #[error("proxy did not acknowledge the routing table within {0:?}")]
    Timeout(Duration),

    #[error("failed to write routing table: {0}")]
    Io(String),
}
