#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Core model for `repack`: run requests, kits and their targets, and the
//! durable per-target status store.

/// Kit and target model.
pub mod kit;
/// Per-run configuration.
pub mod request;
/// Durable run state (full vs. incremental runs).
pub mod state;

pub use kit::{Kit, KitTarget, ALL_PVT};
pub use request::Request;
pub use state::{StateManager, TargetStatus};
