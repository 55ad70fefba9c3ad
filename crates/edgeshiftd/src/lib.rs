//! edgeshiftd: process assembly for the edgeshift daemon.
//!
//! The binary in `main.rs` only parses arguments and installs logging;
//! everything it wires together lives in [`daemon`] so tests can build the
//! same stack.

pub mod daemon;

pub use daemon::{Daemon, open_history, summary};
