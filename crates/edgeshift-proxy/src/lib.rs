//! edgeshift-proxy: keeps the reverse proxy's routing table in step with
//! the live set.
//!
//! The proxy itself is a collaborator: it consumes whole routing-table
//! snapshots through the [`ProxyBackend`] trait. This crate computes the
//! desired table, diffs it against what was last published, and hands the
//! proxy a full replacement so readers never see a half-applied update.
//!
//! # Components
//!
//! - **`routing`**: `RoutingTable` snapshots, diffs, and the two bundled
//!   backends (`SnapshotProxy` in-process, `FileProxy` on disk)
//! - **`publisher`**: `RoutingTablePublisher::reconcile` and friends
//! - **`certs`**: which hostnames have TLS material available

pub mod certs;
pub mod error;
pub mod publisher;
pub mod routing;

pub use certs::{CertificateCatalog, CertificateSource};
pub use error::PublishError;
pub use publisher::RoutingTablePublisher;
pub use routing::{BoxFuture, FileProxy, ProxyBackend, RoutingDiff, RoutingTable, SnapshotProxy};
