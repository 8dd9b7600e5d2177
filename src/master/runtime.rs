// src/master/runtime.rs

//! The scheduler process.
//!
//! [`Master::run`] drives one workflow to completion:
//! register workers, check every task fits somewhere, then loop
//! `queue_ready_tasks` -> `schedule_tasks` -> `wait_for_results` until the
//! engine is finished or the abort flag is raised. All scheduler state is
//! touched from this one task only.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info, trace, warn};

use crate::engine::Engine;
use crate::errors::{ClusterError, Result};
use crate::master::abort::{AbortFlag, AbortTriggers};
use crate::master::cluster::Cluster;
use crate::master::queue::ReadyQueue;
use crate::master::resource_log::ResourceLog;
use crate::master::stdio::{OutputSink, WorkerStdio, write_forwarded};
use crate::master::summary::{ClusterSummary, RunStats, utilization};
use crate::protocol::{Channel, Message, Rank, Registration, TaskCommand, TaskResult};

const POLL_MIN: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct MasterOptions {
    /// Program name recorded in the cluster summary.
    pub program: String,
    /// Task stdout sink; `None` is the master's own stdout.
    pub stdout: Option<PathBuf>,
    /// Task stderr sink; `None` is the master's own stderr.
    pub stderr: Option<PathBuf>,
    /// Workers run a host script and meet at a barrier before scheduling.
    pub host_script: bool,
    /// Wall-time budget in minutes. 0 disables it.
    pub max_wall_time: f64,
    pub resource_log: Option<PathBuf>,
    /// Send each task the CPU ids reserved for it.
    pub set_affinity: bool,
    /// Per-worker output files to merge into the sinks at the end.
    pub worker_stdio: Option<WorkerStdio>,
    /// Raise the abort flag on SIGTERM/SIGINT.
    pub handle_signals: bool,
}

/// Outcome of [`Master::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub failed: bool,
    pub aborted: bool,
    pub stats: RunStats,
    pub wall_time: Duration,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.failed || self.aborted { 1 } else { 0 }
    }
}

pub struct Master<C: Channel> {
    channel: C,
    workers: u32,
    engine: Engine,
    options: MasterOptions,
    abort: AbortFlag,
    cluster: Cluster,
    queue: ReadyQueue,
    stats: RunStats,
    stdout: OutputSink,
    stderr: OutputSink,
}

impl<C: Channel> Master<C> {
    pub fn new(channel: C, workers: u32, engine: Engine, options: MasterOptions) -> Result<Self> {
        if workers == 0 {
            return Err(ClusterError::ConfigError("need at least 1 worker".to_string()));
        }
        let stdout = OutputSink::open(options.stdout.as_deref(), OutputSink::Stdout)?;
        let stderr = OutputSink::open(options.stderr.as_deref(), OutputSink::Stderr)?;

        Ok(Self {
            channel,
            workers,
            engine,
            options,
            abort: AbortFlag::new(),
            cluster: Cluster::default(),
            queue: ReadyQueue::new(),
            stats: RunStats::default(),
            stdout,
            stderr,
        })
    }

    /// Handle for raising the abort flag from outside the run loop.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub async fn run(mut self) -> Result<RunReport> {
        info!(workers = self.workers, "master starting");
        let start = Instant::now();
        let started_at = Local::now();

        let mut triggers = AbortTriggers::default();
        if self.options.handle_signals {
            triggers = triggers.on_signals(&self.abort)?;
        }
        let _triggers = triggers.on_wall_time(&self.abort, self.options.max_wall_time);

        self.register_workers().await?;
        self.check_satisfiable()?;

        if self.options.host_script {
            debug!("waiting for host scripts");
            self.channel.barrier().await?;
        }

        info!("starting workflow");
        if let Err(e) = self.schedule_loop().await {
            // Workers going away is expected once an abort signal has
            // reached the whole process group.
            if !self.abort.is_raised() {
                return Err(e);
            }
            warn!(error = %e, "error while aborting");
        }

        let aborted = self.abort.is_raised();
        if aborted {
            error!("aborting workflow");
        } else {
            info!("workflow finished");
        }
        if self.engine.max_failures_reached() {
            error!("max failures reached: workflow stopped early");
        }

        self.shutdown_workers().await;
        self.cluster.flush_log()?;

        if let Some(stdio) = &self.options.worker_stdio {
            stdio.merge(self.workers, &mut self.stdout, &mut self.stderr)?;
        }

        let wall_time = start.elapsed();
        info!(minutes = wall_time.as_secs_f64() / 60.0, "wall time");

        let failed = aborted || self.engine.is_failed();
        let summary = ClusterSummary {
            failed,
            stats: self.stats.clone(),
            start: started_at,
            duration: wall_time,
            pid: std::process::id(),
            app: self.options.program.clone(),
            slots: self.cluster.worker_count(),
            cpus: self.cluster.total_cpus(),
        };
        self.write_summary(&summary)?;

        let workers = self.cluster.worker_count();
        info!(
            utilization = utilization(self.stats.runtime, wall_time, workers + 1),
            "resource utilization (with master)"
        );
        info!(
            utilization = utilization(self.stats.runtime, wall_time, workers),
            "resource utilization (without master)"
        );
        info!(runtime = self.stats.runtime, "total runtime of tasks");

        if aborted {
            error!("workflow aborted");
        } else if failed {
            error!("workflow failed");
        } else {
            info!("workflow succeeded");
        }

        Ok(RunReport {
            failed,
            aborted,
            stats: self.stats,
            wall_time,
        })
    }

    async fn schedule_loop(&mut self) -> Result<()> {
        while !self.engine.is_finished() && !self.abort.is_raised() {
            self.queue_ready_tasks()?;
            self.schedule_tasks()?;
            if self.cluster.busy_slot_count() == 0 {
                return Err(ClusterError::Stalled(format!(
                    "{} task(s) pending but none could be placed on an idle cluster",
                    self.queue.len()
                )));
            }
            self.wait_for_results().await?;
        }
        Ok(())
    }

    async fn register_workers(&mut self) -> Result<()> {
        let mut registrations: Vec<(Rank, Registration)> = Vec::with_capacity(self.workers as usize);

        while registrations.len() < self.workers as usize {
            let (rank, msg) = self.channel.recv().await?;
            let Message::Registration(reg) = msg else {
                return Err(ClusterError::protocol(format!(
                    "expected REGISTRATION from rank {rank}, got {}",
                    msg.kind()
                )));
            };
            if registrations.iter().any(|(r, _)| *r == rank) {
                return Err(ClusterError::protocol(format!(
                    "rank {rank} registered twice"
                )));
            }
            debug!(rank, host = %reg.hostname, memory = reg.memory, cpus = reg.cpus, "worker registered");
            registrations.push((rank, reg));
        }

        let resource_log = self
            .options
            .resource_log
            .as_ref()
            .map(ResourceLog::open)
            .transpose()?;
        self.cluster = Cluster::from_registrations(&registrations, resource_log)?;

        for slot in self.cluster.slots() {
            self.channel.send(slot.rank, &Message::HostRank(slot.host_rank))?;
        }

        info!(
            workers = self.cluster.worker_count(),
            hosts = self.cluster.hosts().len(),
            cpus = self.cluster.total_cpus(),
            "all workers registered"
        );
        Ok(())
    }

    fn check_satisfiable(&self) -> Result<()> {
        for task in self.engine.dag().tasks() {
            if !self.cluster.can_satisfy(task.memory, task.cpus) {
                return Err(ClusterError::Unsatisfiable {
                    task: task.name.clone(),
                    memory: task.memory,
                    cpus: task.cpus,
                });
            }
        }
        Ok(())
    }

    /// Move everything the engine has ready into the pending list.
    fn queue_ready_tasks(&mut self) -> Result<()> {
        while self.engine.has_ready_task() {
            let id = self.engine.next_ready_task()?;
            let task = self.engine.dag().task(id);
            debug!(task = %task.name, priority = task.priority, "queueing task");
            self.queue.push(id, task.priority);
        }
        Ok(())
    }

    /// Place pending tasks on idle slots, highest priority first.
    ///
    /// A task that fits nowhere right now is set aside and put back after
    /// the pass with its original position.
    fn schedule_tasks(&mut self) -> Result<()> {
        debug!(
            pending = self.queue.len(),
            free_slots = self.cluster.free_slot_count(),
            "scheduling tasks"
        );

        let mut scheduled = 0usize;
        let mut deferred = Vec::new();

        while self.cluster.free_slot_count() > 0 {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            let task = self.engine.dag().task(entry.task);
            let (memory, cpus) = (task.memory, task.cpus);

            let Some(rank) = self.cluster.find_slot(memory, cpus) else {
                trace!(task = %task.name, "no slot found");
                deferred.push(entry);
                continue;
            };

            let mut command = TaskCommand {
                name: task.name.clone(),
                command: task.command.clone(),
                opaque_id: task.opaque_id.clone().unwrap_or_default(),
                memory,
                cpus,
                pipe_forwards: task.pipe_forwards.clone(),
                file_forwards: task.file_forwards.clone(),
                affinity: Vec::new(),
            };

            let binding = self.cluster.allocate(rank, entry.task, memory, cpus)?;
            if self.options.set_affinity {
                command.affinity = binding;
            }

            debug!(task = %command.name, rank, "submitting task");
            self.channel.send(rank, &Message::Command(command))?;
            self.stats.submitted += 1;
            scheduled += 1;
        }

        debug!(scheduled, deferred = deferred.len(), "scheduling pass done");
        for entry in deferred {
            self.queue.defer(entry);
        }
        Ok(())
    }

    /// Wait for at least one result, then drain every result already here.
    ///
    /// Polls with a bounded backoff so the abort flag is noticed promptly.
    async fn wait_for_results(&mut self) -> Result<()> {
        let mut processed = 0usize;
        loop {
            let mut backoff = POLL_MIN;
            while !self.abort.is_raised() && !self.channel.message_waiting()? {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(POLL_MAX);
            }
            if self.abort.is_raised() {
                return Ok(());
            }

            self.process_result().await?;
            processed += 1;

            if !self.channel.message_waiting()? {
                break;
            }
        }
        trace!(processed, "processed results this cycle");
        Ok(())
    }

    async fn process_result(&mut self) -> Result<()> {
        let (rank, msg) = self.channel.recv().await?;
        let Message::Result(result) = msg else {
            return Err(ClusterError::protocol(format!(
                "expected RESULT from rank {rank}, got {}",
                msg.kind()
            )));
        };
        let TaskResult {
            name,
            exit_code,
            runtime,
            outputs,
        } = result;

        self.stats.record_result(exit_code, runtime);

        let assignment = self.cluster.release(rank)?;
        let expected = &self.engine.dag().task(assignment.task).name;
        if *expected != name {
            return Err(ClusterError::protocol(format!(
                "rank {rank} reported task {name} but was running {expected}"
            )));
        }

        if exit_code == 0 {
            debug!(task = %name, rank, runtime, "task finished");
        } else {
            error!(task = %name, rank, exit_code, "task failed");
        }

        if let Err(e) = write_forwarded(&outputs) {
            error!(task = %name, error = %e, "unable to write forwarded output");
        }

        self.engine.mark_task_finished(assignment.task, exit_code)
    }

    async fn shutdown_workers(&mut self) {
        trace!("sending workers shutdown messages");
        for rank in 1..=self.workers {
            if let Err(e) = self.channel.send(rank, &Message::Shutdown) {
                warn!(rank, error = %e, "unable to send shutdown");
            }
        }
        self.channel.close().await;
    }

    fn write_summary(&mut self, summary: &ClusterSummary) -> Result<()> {
        use std::io::Write;

        info!("{summary}");
        writeln!(self.stdout, "{summary}")?;
        self.stdout.flush()?;
        Ok(())
    }
}
