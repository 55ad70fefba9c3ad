//! edgeshift-state: who is running, and what happened before.
//!
//! Two pieces of state back the rollout orchestrator:
//!
//! - **`registry`**: the in-memory [`InstanceRegistry`]. It exclusively
//!   owns every [`Instance`] and serializes mutations per hostname, so two
//!   promotions for the same hostname can never both succeed.
//! - **`store`**: the [`HistoryStore`], an append-only log of
//!   [`RolloutRecord`]s persisted in [redb](https://docs.rs/redb). Rollback
//!   targets are selected from it.
//!
//! Both handles are `Clone` + `Send` + `Sync` and can be shared across
//! async tasks.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, RegistryResult, StateError, StateResult};
pub use registry::{InstanceRegistry, Promotion};
pub use store::HistoryStore;
pub use types::*;
