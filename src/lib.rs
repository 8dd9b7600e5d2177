// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod launch;
pub mod logging;
pub mod master;
pub mod protocol;
pub mod types;
pub mod worker;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tracing::info;

use crate::cli::{CliArgs, Command, HostArgs, MasterArgs, SchedulerArgs, WorkerArgs};
use crate::config::Settings;
use crate::dag::{Dag, DagOptions};
use crate::engine::{Engine, EngineOptions, RescueLog};
use crate::master::{Master, MasterOptions, WorkerStdio};
use crate::worker::host_info::HostOverrides;
use crate::worker::{Worker, WorkerOptions};

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let settings = config::load_optional(args.config.as_deref())?;

    match &args.command {
        Command::Run(run_args) => launch::run_local(run_args, &settings, &args).await,
        Command::Master(master_args) => run_master(master_args, &settings).await,
        Command::Worker(worker_args) => run_worker(worker_args, &settings).await,
    }
}

async fn run_master(args: &MasterArgs, settings: &Settings) -> Result<i32> {
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }
    let engine = build_engine(&args.scheduler, settings)?;
    let options = master_options(&args.scheduler, settings, None);

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("listening on {}", args.listen))?;
    info!(addr = %listener.local_addr()?, workers = args.workers, "waiting for workers");
    let channel = protocol::tcp::accept_workers(listener, args.workers).await?;

    let report = Master::new(channel, args.workers, engine, options)?.run().await?;
    Ok(report.exit_code())
}

async fn run_worker(args: &WorkerArgs, settings: &Settings) -> Result<i32> {
    let channel = protocol::tcp::connect(&args.connect, args.rank).await?;
    let options = worker_options(
        &args.host,
        args.host_script.clone().or_else(|| settings.worker.host_script.clone()),
        args.task_stdout.clone(),
        args.task_stderr.clone(),
        settings,
    );
    Worker::new(channel, options).run().await?;
    Ok(0)
}

/// `<DAG>.<suffix>`, e.g. `diamond.dag.rescue`.
pub fn sibling_path(dag: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{suffix}", dag.display()))
}

/// Load the workflow, replay the rescue file and open the new rescue log.
pub fn build_engine(args: &SchedulerArgs, settings: &Settings) -> Result<Engine> {
    let tries = args.tries.or(settings.master.tries).unwrap_or(1);
    if tries == 0 {
        bail!("--tries must be at least 1");
    }
    let max_failures = args.max_failures.or(settings.master.max_failures).unwrap_or(0);

    let rescue = args
        .rescue
        .clone()
        .unwrap_or_else(|| sibling_path(&args.dag, "rescue"));
    let rescue_log = args.rescue_log.clone().unwrap_or_else(|| rescue.clone());
    let replay = (!args.skip_rescue).then(|| rescue.clone());

    let dag_options = DagOptions {
        lock: !args.no_lock && settings.master.lock.unwrap_or(true),
        rescue: replay.clone(),
    };
    let dag = Dag::load(&args.dag, &dag_options)
        .with_context(|| format!("loading workflow {}", args.dag.display()))?;

    let log = RescueLog::open(&rescue_log, replay.as_deref(), &dag)?;
    info!(path = %log.path().display(), "writing rescue log");

    Ok(Engine::new(
        dag,
        EngineOptions {
            max_failures,
            tries,
        },
        Some(log),
    ))
}

pub fn master_options(
    args: &SchedulerArgs,
    settings: &Settings,
    worker_stdio: Option<WorkerStdio>,
) -> MasterOptions {
    let resource_log = args.resource_log || settings.master.resource_log.unwrap_or(false);
    MasterOptions {
        program: std::env::args().next().unwrap_or_else(|| "dagcluster".to_string()),
        stdout: args.stdout.clone(),
        stderr: args.stderr.clone(),
        host_script: args.host_script.is_some() || settings.master.host_script.is_some(),
        max_wall_time: args
            .max_wall_time
            .or(settings.master.max_wall_time)
            .unwrap_or(0.0),
        resource_log: resource_log.then(|| sibling_path(&args.dag, "resource")),
        set_affinity: args.set_affinity || settings.master.set_affinity.unwrap_or(false),
        worker_stdio,
        handle_signals: true,
    }
}

pub fn worker_options(
    host: &HostArgs,
    host_script: Option<PathBuf>,
    task_stdout: Option<PathBuf>,
    task_stderr: Option<PathBuf>,
    settings: &Settings,
) -> WorkerOptions {
    WorkerOptions {
        overrides: HostOverrides {
            memory: host.host_memory.or(settings.worker.host_memory).unwrap_or(0),
            cpus: host.host_cpus.or(settings.worker.host_cpus).unwrap_or(0),
        },
        strict_limits: host.strict_limits || settings.worker.strict_limits.unwrap_or(false),
        host_script,
        host_script_timeout: settings
            .worker
            .host_script_timeout
            .map(Duration::from_secs)
            .unwrap_or(worker::host_script::DEFAULT_TIMEOUT),
        task_stdout,
        task_stderr,
        handle_signals: true,
    }
}
