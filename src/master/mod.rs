// src/master/mod.rs

//! The scheduler side of the cluster.
//!
//! - [`host`]: per-machine resource envelope and per-worker slots.
//! - [`cluster`]: registration, admission control, allocate/release.
//! - [`queue`]: priority + arrival ordered pending list.
//! - [`runtime`]: the [`Master`] run loop.
//! - [`abort`]: abort flag raised by signals and the wall-time budget.
//! - [`resource_log`], [`summary`], [`stdio`]: what the run leaves behind.

pub mod abort;
pub mod cluster;
pub mod host;
pub mod queue;
pub mod resource_log;
pub mod runtime;
pub mod stdio;
pub mod summary;

pub use abort::AbortFlag;
pub use cluster::Cluster;
pub use host::{Assignment, CpuTopology, Host, Slot};
pub use queue::ReadyQueue;
pub use runtime::{Master, MasterOptions, RunReport};
pub use stdio::WorkerStdio;
pub use summary::{ClusterSummary, RunStats};
