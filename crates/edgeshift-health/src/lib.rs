//! edgeshift-health: liveness probing for backend instances.
//!
//! Every non-retired instance gets its own background probe task. The
//! task feeds probe results into a [`HealthTracker`], which debounces them:
//! an instance only flips to healthy after `healthy_threshold` consecutive
//! successes, and only flips to unhealthy after `unhealthy_threshold`
//! consecutive failures. A single dropped packet never moves the live set.
//!
//! # Architecture
//!
//! ```text
//! HealthProber
//!   ├── Per-instance background task
//!   │   ├── HealthTracker (streaks, transient-error backoff)
//!   │   ├── LivenessProbe::check() → ProbeResult
//!   │   └── InstanceRegistry::set_health() on transition
//!   └── broadcast::Sender<HealthEvent> → rollout controller
//! ```
//!
//! Transient errors (connection refused, timeouts) are retried with
//! exponential backoff capped at `max_backoff`. They still count toward the
//! failure streak, so an instance that stays unreachable does go unhealthy.

pub mod checker;
pub mod prober;

pub use checker::{http_probe, BoxFuture, HealthTracker, HttpProbe, LivenessProbe, ProbeConfig, ProbeResult};
pub use prober::{HealthEvent, HealthProber};
