//! Domain types shared by the registry, the prober, the publisher and the
//! controller.
//!
//! Instances are owned by the registry; everything else refers to them by
//! [`InstanceId`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a backend instance.
pub type InstanceId = String;

// ── Instance ──────────────────────────────────────────────────────

/// A running, versioned backend instance serving one hostname.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub hostname: String,
    /// Image version tag (e.g. "v2").
    pub version: String,
    /// Unix timestamp (seconds) when the instance was registered.
    pub created_at: u64,
    pub health: HealthState,
    pub role: Role,
    /// Liveness address (`ip:port`) reported by the runtime.
    pub endpoint: Option<String>,
    /// Whether logs and metrics of this instance are being shipped.
    pub shipping: bool,
    /// Earliest moment a retiring instance may be removed.
    #[serde(skip)]
    pub drain_deadline: Option<tokio::time::Instant>,
}

/// Health as determined by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic role of an instance within its hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Started, awaiting health confirmation.
    Candidate,
    /// Receiving production traffic.
    Live,
    /// Replaced; draining in-flight requests.
    Retiring,
    /// Removed from the registry.
    Retired,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Live => "live",
            Self::Retiring => "retiring",
            Self::Retired => "retired",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Routing ───────────────────────────────────────────────────────

/// One weighted target in the proxy's routing table.
///
/// Derived from the registry's live set, never edited by hand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingEntry {
    pub hostname: String,
    pub instance_id: InstanceId,
    /// Address the proxy forwards to.
    pub endpoint: String,
    /// Relative traffic share; zero-weight entries are never published.
    pub weight: u32,
}

// ── Rollout history ───────────────────────────────────────────────

/// What triggered a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutKind {
    Deploy,
    Rollback,
}

/// How a rollout ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RolloutOutcome {
    Succeeded,
    Failed { reason: String },
    Aborted,
}

impl RolloutOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Append-only history entry, immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutRecord {
    pub hostname: String,
    pub kind: RolloutKind,
    /// Live version before the rollout, if any.
    pub from_version: Option<String>,
    pub to_version: String,
    /// Unix timestamp (seconds) when the outcome was decided.
    pub timestamp: u64,
    pub outcome: RolloutOutcome,
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_with_status_tag() {
        let failed = RolloutOutcome::Failed {
            reason: "deadline".to_string(),
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"status":"failed","reason":"deadline"}"#);
        assert!(!failed.is_success());
        assert!(RolloutOutcome::Succeeded.is_success());
    }

    #[test]
    fn drain_deadline_is_not_serialized() {
        let inst = Instance {
            id: "a-v1-1".to_string(),
            hostname: "a.example".to_string(),
            version: "v1".to_string(),
            created_at: 1000,
            health: HealthState::Healthy,
            role: Role::Retiring,
            endpoint: Some("10.0.0.1:8080".to_string()),
            shipping: true,
            drain_deadline: Some(tokio::time::Instant::now()),
        };
        let json = serde_json::to_value(&inst).unwrap();
        assert!(json.get("drain_deadline").is_none());
        assert_eq!(json["role"], "retiring");

        let back: Instance = serde_json::from_value(json).unwrap();
        assert!(back.drain_deadline.is_none());
    }
}
