// src/worker/task_runner.rs

//! Run one task to completion.
//!
//! The child's stdout/stderr go to the worker's shared output files, each
//! forwarding pipe's write end is exposed through its environment variable,
//! and the parent drains every pipe while waiting for the child. A
//! termination signal reaching the worker is passed on to the child, with
//! SIGKILL following after a grace period.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sched::{CpuSet, sched_setaffinity};
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::errors::{ClusterError, Result};
use crate::protocol::{ForwardedOutput, TaskCommand};
use crate::worker::Termination;
use crate::worker::args::split_args;
use crate::worker::forward::{ForwardPipe, drain_pipes, open_pipes, read_files};

/// Time between forwarding SIGTERM to a task and sending SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// The worker's task output descriptors, opened once and shared by every task.
#[derive(Debug)]
pub struct TaskOutput {
    pub stdout: File,
    pub stderr: File,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerOptions {
    /// Apply memory rlimits equal to the task's request.
    pub strict_limits: bool,
}

/// What happened when a task ran.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Exit code, or the negated signal number if the task was killed.
    pub exit_code: i32,
    pub start: DateTime<Local>,
    pub runtime: Duration,
    pub outputs: Vec<ForwardedOutput>,
    /// First argument of the command line, empty if there was none.
    pub app: String,
    /// A termination signal arrived while the task was running.
    pub interrupted: bool,
}

pub async fn run_task(
    cmd: &TaskCommand,
    output: &mut TaskOutput,
    options: RunnerOptions,
    termination: &mut Termination,
) -> Result<Execution> {
    let start = Local::now();
    let clock = Instant::now();

    let argv = match split_args(&cmd.command) {
        Ok(argv) if !argv.is_empty() => argv,
        Ok(_) => return exec_failure(cmd, output, start, clock, String::new(), "empty command"),
        Err(msg) => return exec_failure(cmd, output, start, clock, String::new(), &msg),
    };
    let app = argv[0].clone();

    let mut pipes = open_pipes(&cmd.name, &cmd.pipe_forwards)?;
    let limited = options.strict_limits && cmd.memory > 0;
    let mut child = match spawn(cmd, &argv, &pipes, output, options) {
        Ok(child) => child,
        Err(e) if is_exec_failure(&e, limited) => {
            return exec_failure(cmd, output, start, clock, app, &e.to_string());
        }
        Err(source) => {
            return Err(ClusterError::Spawn {
                task: cmd.name.clone(),
                source,
            });
        }
    };
    for p in &mut pipes {
        p.close_write();
    }

    debug!(task = %cmd.name, pid = ?child.id(), "task started");

    let (waited, mut outputs) = tokio::join!(
        wait_for_exit(&cmd.name, &mut child, termination),
        drain_pipes(&cmd.name, pipes),
    );
    let (status, interrupted) = waited?;
    outputs.extend(read_files(&cmd.name, &cmd.file_forwards).await);

    let runtime = clock.elapsed();
    let exit_code = exit_code(status);
    match status.signal() {
        None => debug!(task = %cmd.name, exit_code, runtime = runtime.as_secs_f64(), "task exited"),
        Some(sig) => debug!(task = %cmd.name, signal = sig, runtime = runtime.as_secs_f64(), "task exited on signal"),
    }

    Ok(Execution {
        exit_code,
        start,
        runtime,
        outputs,
        app,
        interrupted,
    })
}

fn spawn(
    cmd: &TaskCommand,
    argv: &[String],
    pipes: &[ForwardPipe],
    output: &TaskOutput,
    options: RunnerOptions,
) -> io::Result<Child> {
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(output.stdout.try_clone()?))
        .stderr(Stdio::from(output.stderr.try_clone()?))
        .kill_on_drop(true);

    let mut inherit: Vec<RawFd> = Vec::with_capacity(pipes.len());
    for p in pipes {
        if let Some(fd) = p.child_fd() {
            command.env(&p.var, fd.to_string());
            inherit.push(fd);
        }
    }

    let limit = (options.strict_limits && cmd.memory > 0).then(|| u64::from(cmd.memory) * 1024 * 1024);

    let cpuset = if cmd.affinity.is_empty() {
        None
    } else {
        let mut set = CpuSet::new();
        for &cpu in &cmd.affinity {
            set.set(cpu as usize).map_err(io::Error::from)?;
        }
        Some(set)
    };

    // SAFETY: the closure runs between fork and exec and only makes
    // async-signal-safe system calls on values prepared before the fork.
    // An error here surfaces from spawn as the exec failure of the task.
    unsafe {
        command.pre_exec(move || {
            for &fd in &inherit {
                fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(io::Error::from)?;
            }
            if let Some(bytes) = limit {
                for resource in [
                    Resource::RLIMIT_DATA,
                    Resource::RLIMIT_STACK,
                    Resource::RLIMIT_RSS,
                    Resource::RLIMIT_AS,
                ] {
                    setrlimit(resource, bytes, bytes).map_err(io::Error::from)?;
                }
            }
            if let Some(set) = &cpuset {
                sched_setaffinity(Pid::from_raw(0), set).map_err(io::Error::from)?;
            }
            Ok(())
        });
    }

    command.spawn()
}

/// Wait for the child, forwarding a termination signal to it if one arrives.
///
/// Returns the exit status and whether the task was interrupted.
async fn wait_for_exit(
    task: &str,
    child: &mut Child,
    termination: &mut Termination,
) -> Result<(ExitStatus, bool)> {
    let mut interrupted = false;
    let mut kill_at: Option<tokio::time::Instant> = None;

    loop {
        let deadline = kill_at;
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| ClusterError::Spawn {
                    task: task.to_string(),
                    source,
                })?;
                return Ok((status, interrupted));
            }
            _ = termination.recv(), if !interrupted => {
                interrupted = true;
                info!(task, "forwarding termination signal to task");
                if let Some(pid) = child.id() {
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        warn!(task, error = %e, "unable to signal task");
                    }
                }
                kill_at = Some(tokio::time::Instant::now() + KILL_GRACE);
            }
            _ = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                warn!(task, "task ignored SIGTERM; killing it");
                if let Err(e) = child.start_kill() {
                    warn!(task, error = %e, "unable to kill task");
                }
                kill_at = None;
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => -sig,
        (None, None) => 1,
    }
}

/// Spawn errors that mean "this command cannot be executed" rather than
/// "the worker cannot start processes".
///
/// Under memory rlimits, ENOMEM comes from exec hitting the task's own limit.
fn is_exec_failure(e: &io::Error, limited: bool) -> bool {
    match e.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ENOMEM) => limited,
        Some(Errno::EAGAIN | Errno::EMFILE | Errno::ENFILE) => false,
        _ => true,
    }
}

/// Report a task that never started as exit code 1, with a note on its stderr.
fn exec_failure(
    cmd: &TaskCommand,
    output: &mut TaskOutput,
    start: DateTime<Local>,
    clock: Instant,
    app: String,
    reason: &str,
) -> Result<Execution> {
    error!(task = %cmd.name, reason, "unable to execute task");
    writeln!(output.stderr, "Unable to exec command for task {}: {reason}", cmd.name)?;
    Ok(Execution {
        exit_code: 1,
        start,
        runtime: clock.elapsed(),
        outputs: Vec::new(),
        app,
        interrupted: false,
    })
}
