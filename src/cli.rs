// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `dagcluster`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagcluster",
    version,
    about = "Run a DAG of shell commands across a cluster of worker processes.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGCLUSTER_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Settings file (TOML) with defaults for master and worker flags.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the scheduler plus N local worker processes.
    Run(RunArgs),
    /// Run only the scheduler; workers connect over TCP.
    Master(MasterArgs),
    /// Run one worker connected to a master.
    Worker(WorkerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub scheduler: SchedulerArgs,

    /// Number of worker processes to start.
    #[arg(short = 'n', long, value_name = "N")]
    pub workers: u32,

    #[command(flatten)]
    pub host: HostArgs,
}

#[derive(Debug, Clone, Args)]
pub struct MasterArgs {
    #[command(flatten)]
    pub scheduler: SchedulerArgs,

    /// Address to accept worker connections on.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:7733")]
    pub listen: String,

    /// Number of workers to wait for.
    #[arg(short = 'n', long, value_name = "N")]
    pub workers: u32,
}

/// Flags shared by `run` and `master`.
#[derive(Debug, Clone, Args)]
pub struct SchedulerArgs {
    /// Workflow file.
    #[arg(value_name = "DAG")]
    pub dag: PathBuf,

    /// File for task stdout (default: this process's stdout).
    #[arg(short = 'o', long = "stdout", value_name = "PATH")]
    pub stdout: Option<PathBuf>,

    /// File for task stderr (default: this process's stderr).
    #[arg(short = 'e', long = "stderr", value_name = "PATH")]
    pub stderr: Option<PathBuf>,

    /// Rescue file to resume from (default: `<DAG>.rescue`).
    #[arg(short = 'r', long, value_name = "PATH")]
    pub rescue: Option<PathBuf>,

    /// Rescue file to write (default: the `--rescue` path).
    #[arg(long, value_name = "PATH")]
    pub rescue_log: Option<PathBuf>,

    /// Do not resume from the rescue file.
    #[arg(long)]
    pub skip_rescue: bool,

    /// Stop starting new tasks after this many failures (0 = unlimited).
    #[arg(short = 'm', long, value_name = "N")]
    pub max_failures: Option<u32>,

    /// Default number of attempts per task.
    #[arg(short = 't', long, value_name = "N")]
    pub tries: Option<u32>,

    /// Do not lock the workflow file.
    #[arg(long)]
    pub no_lock: bool,

    /// Script run once per host before any task starts.
    #[arg(long, value_name = "PATH")]
    pub host_script: Option<PathBuf>,

    /// Abort the workflow after this many minutes.
    #[arg(long, value_name = "MINUTES")]
    pub max_wall_time: Option<f64>,

    /// Record free resources over time in `<DAG>.resource`.
    #[arg(long)]
    pub resource_log: bool,

    /// Pin each task to the CPUs reserved for it.
    #[arg(long)]
    pub set_affinity: bool,
}

/// Per-host resource flags for workers.
#[derive(Debug, Clone, Args)]
pub struct HostArgs {
    /// Memory available to tasks on this host, in MB (default: detect).
    #[arg(long, value_name = "MB")]
    pub host_memory: Option<u32>,

    /// CPUs available to tasks on this host (default: detect).
    #[arg(long, value_name = "N")]
    pub host_cpus: Option<u32>,

    /// Enforce each task's memory request with rlimits.
    #[arg(long)]
    pub strict_limits: bool,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Master address.
    #[arg(long, value_name = "ADDR")]
    pub connect: String,

    /// This worker's rank (1..=N).
    #[arg(long, value_name = "K")]
    pub rank: u32,

    #[command(flatten)]
    pub host: HostArgs,

    /// Script run once per host before any task starts.
    #[arg(long, value_name = "PATH")]
    pub host_script: Option<PathBuf>,

    /// Append task stdout to this file (default: this process's stdout).
    #[arg(long, value_name = "PATH")]
    pub task_stdout: Option<PathBuf>,

    /// Append task stderr to this file (default: this process's stderr).
    #[arg(long, value_name = "PATH")]
    pub task_stderr: Option<PathBuf>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
