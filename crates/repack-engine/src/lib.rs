#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Scheduling engine for `repack`: target-graph construction, topological
//! dispatch, and the executors that run targets (in-process worker pool or
//! LSF-style batch scheduler).

/// Cluster-batch executor.
pub mod batch;
/// The engine: expansion, graph, dispatch, events.
pub mod engine;
/// The executor interface and its job type.
pub mod executor;
/// In-process worker-pool executor.
pub mod local;

pub use batch::{BatchJobState, BatchScheduler, BsubScheduler, LsfExecutor, SiteFlags, StaticSiteFlags};
pub use engine::{Engine, EngineError, EngineEvent, RunSummary};
pub use executor::{Executor, Job, OnComplete};
pub use local::LocalExecutor;
