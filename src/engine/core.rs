// src/engine/core.rs

//! Readiness engine.
//!
//! Readiness is derived from the DAG: a task enters the FIFO ready queue the
//! moment its last parent succeeds. The engine never does IO besides
//! appending to the rescue log, and it knows nothing about workers or hosts.

use std::collections::VecDeque;

use tracing::{debug, error, info, warn};

use crate::dag::{Dag, TaskId};
use crate::engine::rescue_log::RescueLog;
use crate::errors::{ClusterError, Result};

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Stop offering work after this many terminal failures. 0 = unlimited.
    pub max_failures: u32,
    /// Retry budget for tasks that do not set their own.
    pub tries: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_failures: 0,
            tries: 1,
        }
    }
}

#[derive(Debug)]
pub struct Engine {
    dag: Dag,
    ready: VecDeque<TaskId>,
    /// Queued plus dispatched tasks.
    outstanding: usize,
    failures: u32,
    options: EngineOptions,
    rescue: Option<RescueLog>,
}

impl Engine {
    pub fn new(dag: Dag, options: EngineOptions, rescue: Option<RescueLog>) -> Self {
        let ready: VecDeque<TaskId> = dag
            .task_ids()
            .filter(|&id| !dag.task(id).success && dag.is_ready(id))
            .collect();

        info!(
            tasks = dag.len(),
            done = dag.tasks().filter(|t| t.success).count(),
            ready = ready.len(),
            "engine initialised"
        );

        Self {
            outstanding: ready.len(),
            dag,
            ready,
            failures: 0,
            options,
            rescue,
        }
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn has_ready_task(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn next_ready_task(&mut self) -> Result<TaskId> {
        self.ready.pop_front().ok_or(ClusterError::EmptyReadyQueue)
    }

    /// Fold a task's exit code into the DAG.
    ///
    /// Only rescue-log write failures are returned as errors.
    pub fn mark_task_finished(&mut self, id: TaskId, exit_code: i32) -> Result<()> {
        if exit_code == 0 {
            self.task_succeeded(id)
        } else {
            self.task_failed(id, exit_code);
            Ok(())
        }
    }

    fn task_succeeded(&mut self, id: TaskId) -> Result<()> {
        let name = {
            let task = self.dag.task_mut(id);
            task.success = true;
            task.name.clone()
        };
        debug!(task = %name, "task succeeded");

        if let Some(log) = self.rescue.as_mut() {
            log.append(&name)?;
        }
        self.outstanding = self.outstanding.saturating_sub(1);

        if self.max_failures_reached() {
            return Ok(());
        }

        let released: Vec<TaskId> = self
            .dag
            .children(id)
            .filter(|&child| !self.dag.task(child).success && self.dag.is_ready(child))
            .collect();
        for child in released {
            debug!(task = %self.dag.task(child).name, parent = %name, "task is ready");
            self.enqueue(child);
        }
        Ok(())
    }

    fn task_failed(&mut self, id: TaskId, exit_code: i32) {
        let default_tries = self.options.tries;
        let (name, failures, tries) = {
            let task = self.dag.task_mut(id);
            task.failures += 1;
            (task.name.clone(), task.failures, task.effective_tries(default_tries))
        };

        if failures < tries && !self.max_failures_reached() {
            warn!(task = %name, exit_code, failures, tries, "task failed; retrying");
            // Still counted as outstanding; it just goes back in line.
            self.ready.push_back(id);
            return;
        }

        error!(task = %name, exit_code, failures, "task failed permanently");
        self.failures += 1;
        self.outstanding = self.outstanding.saturating_sub(1);

        if self.max_failures_reached() && !self.ready.is_empty() {
            let dropped = self.ready.len();
            self.ready.clear();
            self.outstanding = self.outstanding.saturating_sub(dropped);
            error!(
                failures = self.failures,
                max_failures = self.options.max_failures,
                dropped,
                "maximum failures reached; no further tasks will be started"
            );
        }
    }

    fn enqueue(&mut self, id: TaskId) {
        self.ready.push_back(id);
        self.outstanding += 1;
    }

    /// Terminal task failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_failures_reached(&self) -> bool {
        self.options.max_failures > 0 && self.failures >= self.options.max_failures
    }

    /// True once nothing is queued or dispatched.
    pub fn is_finished(&self) -> bool {
        self.outstanding == 0
    }

    /// True if any task has not succeeded. Meaningful once [`Self::is_finished`].
    pub fn is_failed(&self) -> bool {
        self.dag.tasks().any(|t| !t.success)
    }
}
