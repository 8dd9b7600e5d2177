// src/dag/task.rs

use crate::types::Forward;

/// One unit of work in the workflow.
///
/// Everything except `success` and `failures` is fixed at parse time. The
/// engine flips `success` and bumps `failures` as results come in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    /// Raw command line; the worker splits it into an argument vector.
    pub command: String,
    /// Requested memory in MB.
    pub memory: u32,
    /// Requested logical CPUs.
    pub cpus: u32,
    /// Per-task retry budget. `None` falls back to the engine default.
    pub tries: Option<u32>,
    /// Higher runs first.
    pub priority: i32,
    pub opaque_id: Option<String>,
    pub transformation: Option<String>,
    pub pipe_forwards: Vec<Forward>,
    pub file_forwards: Vec<Forward>,

    pub success: bool,
    pub failures: u32,
}

impl Task {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            memory: 0,
            cpus: 1,
            tries: None,
            priority: 0,
            opaque_id: None,
            transformation: None,
            pipe_forwards: Vec::new(),
            file_forwards: Vec::new(),
            success: false,
            failures: 0,
        }
    }

    /// Retry budget after applying the engine default.
    pub fn effective_tries(&self, default: u32) -> u32 {
        self.tries.unwrap_or(default).max(1)
    }
}
