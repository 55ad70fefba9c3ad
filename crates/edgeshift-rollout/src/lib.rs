//! edgeshift rollouts: zero-downtime version swaps per hostname.
//!
//! Each hostname runs at most one rollout at a time. A rollout starts a
//! candidate through the [`ContainerRuntime`], waits for the health prober
//! to call it healthy, promotes it, dual-serves for a grace period, and
//! then unpublishes and drains the previous instance.
//!
//! # Components
//!
//! - **`config`**: rollout timing (deploy deadline, grace, drain, retention)
//! - **`runtime`**: container runtime seam and the static address catalog
//! - **`controller`**: the per-hostname state machine

pub mod config;
pub mod controller;
pub mod error;
pub mod runtime;

pub use config::RolloutConfig;
pub use controller::{HostStatus, RolloutController, RolloutHandle, RolloutPhase};
pub use error::RolloutError;
pub use runtime::{ContainerRuntime, InstanceHandle, RuntimeError, StaticRuntime};
