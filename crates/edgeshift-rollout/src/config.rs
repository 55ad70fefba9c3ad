//! Rollout timing.

use std::time::Duration;

use edgeshift_core::EdgeshiftConfig;

/// Deadlines and windows applied to every rollout.
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// How long a candidate may take to start and become healthy.
    pub deploy_timeout: Duration,
    /// Dual-serving window between promotion and unpublishing the old instance.
    pub grace_period: Duration,
    /// Time between unpublishing the old instance and retiring it.
    pub drain_period: Duration,
    /// Rollout records kept per hostname.
    pub history_retention: usize,
    /// Records included in a status report.
    pub status_history: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            deploy_timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(10),
            drain_period: Duration::from_secs(30),
            history_retention: 50,
            status_history: 10,
        }
    }
}

impl RolloutConfig {
    pub fn from_config(config: &EdgeshiftConfig) -> Self {
        Self {
            deploy_timeout: config.deploy_timeout(),
            grace_period: config.grace_period(),
            drain_period: config.drain_period(),
            history_retention: config.rollout.history_retention,
            ..Default::default()
        }
    }
}
