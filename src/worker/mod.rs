// src/worker/mod.rs

//! The worker side of the cluster.
//!
//! A worker registers its host's resources, learns its host rank, optionally
//! runs the host script, then executes one COMMAND at a time until told to
//! shut down. Concurrency comes from running many workers, never from one
//! worker running several tasks.

pub mod args;
pub mod forward;
pub mod host_info;
pub mod host_script;
pub mod task_runner;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{debug, info, trace};

use crate::errors::{ClusterError, Result};
use crate::protocol::{
    Channel, MASTER, MAX_FORWARDED_BYTES, Message, Registration, TaskCommand, TaskResult,
};
use crate::worker::forward::cap_outputs;
use crate::worker::host_info::HostOverrides;
use crate::worker::host_script::{HostScriptGroup, run_host_script};
use crate::worker::task_runner::{Execution, RunnerOptions, TaskOutput, run_task};

pub use task_runner::KILL_GRACE;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub overrides: HostOverrides,
    pub strict_limits: bool,
    /// Run by host-rank 0 workers; every worker meets at a barrier after.
    pub host_script: Option<PathBuf>,
    pub host_script_timeout: Duration,
    /// Task stdout file, opened for append. `None` is the worker's stdout.
    pub task_stdout: Option<PathBuf>,
    /// Task stderr file, opened for append. `None` is the worker's stderr.
    pub task_stderr: Option<PathBuf>,
    /// Listen for SIGTERM/SIGINT and pass them on to the running task.
    pub handle_signals: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            overrides: HostOverrides::default(),
            strict_limits: false,
            host_script: None,
            host_script_timeout: host_script::DEFAULT_TIMEOUT,
            task_stdout: None,
            task_stderr: None,
            handle_signals: false,
        }
    }
}

/// SIGTERM/SIGINT listener. When disabled, [`Termination::recv`] never fires.
#[derive(Debug)]
pub struct Termination {
    signals: Option<(Signal, Signal)>,
}

impl Termination {
    pub fn listen() -> Result<Self> {
        let term = signal(SignalKind::terminate())?;
        let int = signal(SignalKind::interrupt())?;
        Ok(Self {
            signals: Some((term, int)),
        })
    }

    pub fn disabled() -> Self {
        Self { signals: None }
    }

    pub async fn recv(&mut self) {
        match &mut self.signals {
            Some((term, int)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
            }
            None => std::future::pending().await,
        }
    }
}

pub struct Worker<C: Channel> {
    channel: C,
    options: WorkerOptions,
    registration: Option<Registration>,
}

impl<C: Channel> Worker<C> {
    pub fn new(channel: C, options: WorkerOptions) -> Self {
        Self {
            channel,
            options,
            registration: None,
        }
    }

    /// Report these resources instead of detecting them.
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub async fn run(mut self) -> Result<()> {
        let rank = self.channel.rank();
        debug!(rank, "worker starting");

        let mut termination = if self.options.handle_signals {
            Termination::listen()?
        } else {
            Termination::disabled()
        };

        let registration = match self.registration.take() {
            Some(reg) => reg,
            None => host_info::detect(self.options.overrides)?,
        };
        trace!(
            rank,
            host = %registration.hostname,
            memory = registration.memory,
            cpus = registration.cpus,
            "registering"
        );
        self.channel
            .send(MASTER, &Message::Registration(registration.clone()))?;

        let host_rank = match self.channel.recv().await? {
            (MASTER, Message::HostRank(host_rank)) => host_rank,
            (from, msg) => {
                return Err(ClusterError::protocol(format!(
                    "expected HOSTRANK from master, got {} from rank {from}",
                    msg.kind()
                )));
            }
        };
        trace!(rank, host_rank, "got host rank");

        let mut output = TaskOutput {
            stdout: open_output(self.options.task_stdout.as_deref(), io::stdout().as_fd())?,
            stderr: open_output(self.options.task_stderr.as_deref(), io::stderr().as_fd())?,
        };

        let mut host_group: Option<HostScriptGroup> = None;
        if let Some(script) = self.options.host_script.clone() {
            if host_rank == 0 {
                host_group =
                    Some(run_host_script(&script, self.options.host_script_timeout).await?);
            }
            self.channel.barrier().await?;
        }

        let runner = RunnerOptions {
            strict_limits: self.options.strict_limits,
        };

        loop {
            trace!(rank, "waiting for request");
            let msg = tokio::select! {
                received = self.channel.recv() => received?,
                _ = termination.recv() => {
                    info!(rank, "terminated while idle");
                    break;
                }
            };

            let cmd = match msg {
                (_, Message::Shutdown) => {
                    trace!(rank, "got shutdown message");
                    break;
                }
                (_, Message::Command(cmd)) => cmd,
                (from, other) => {
                    return Err(ClusterError::protocol(format!(
                        "unexpected {} from rank {from}",
                        other.kind()
                    )));
                }
            };

            debug!(rank, task = %cmd.name, "running task");
            let exec = run_task(&cmd, &mut output, runner, &mut termination).await?;
            write_task_record(&mut output.stdout, &cmd, &exec, &registration.hostname, rank)?;

            let interrupted = exec.interrupted;
            let outputs = cap_outputs(&cmd.name, exec.outputs, MAX_FORWARDED_BYTES);
            self.channel.send(
                MASTER,
                &Message::Result(TaskResult {
                    name: cmd.name,
                    exit_code: exec.exit_code,
                    runtime: exec.runtime.as_secs_f64(),
                    outputs,
                }),
            )?;

            if interrupted {
                info!(rank, "terminated while running a task");
                break;
            }
        }

        if let Some(group) = host_group {
            group.terminate(host_script::GRACE_PERIOD).await;
        }
        self.channel.close().await;
        debug!(rank, "worker exiting");
        Ok(())
    }
}

fn open_output(path: Option<&Path>, fallback: std::os::fd::BorrowedFd<'_>) -> Result<File> {
    match path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening task output file {}", path.display()))?;
            Ok(file)
        }
        None => Ok(File::from(fallback.try_clone_to_owned()?)),
    }
}

/// Provenance line appended to the task stdout after every task.
fn write_task_record(
    out: &mut File,
    cmd: &TaskCommand,
    exec: &Execution,
    hostname: &str,
    rank: u32,
) -> Result<()> {
    let id = if cmd.opaque_id.is_empty() {
        String::new()
    } else {
        format!("id={}, ", cmd.opaque_id)
    };
    writeln!(
        out,
        "[cluster-task {id}name={}, start=\"{}\", duration={:.3}, status={}, app=\"{}\", \
         hostname=\"{hostname}\", slot={rank}, cpus={}, memory={}]",
        cmd.name,
        exec.start.to_rfc3339_opts(chrono::SecondsFormat::Millis, false),
        exec.runtime.as_secs_f64(),
        exec.exit_code,
        exec.app,
        cmd.cpus,
        cmd.memory,
    )?;
    Ok(())
}
