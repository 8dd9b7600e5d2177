// src/dag/mod.rs

//! Workflow model.
//!
//! - [`task`] holds the [`Task`] record.
//! - [`parser`] turns workflow text into tasks and edge declarations.
//! - [`graph`] owns every task in a petgraph arena and answers readiness
//!   queries; it also takes the workflow lock and replays rescue files.
//! - [`rescue`] reads `DONE` records.

pub mod graph;
pub mod parser;
pub mod rescue;
pub mod task;

pub use graph::{Dag, DagOptions, TaskId};
pub use parser::{EdgeDecl, Workflow, parse_workflow};
pub use task::Task;
