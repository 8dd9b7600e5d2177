// src/launch.rs

//! `dagcluster run`: the scheduler plus N worker processes on this machine.
//!
//! Workers are this same binary re-executed as `dagcluster worker`,
//! connected over loopback TCP. Each writes task output to
//! `<DAG>.<pid>.out.<rank>` / `.err.<rank>`; the master merges those into
//! its own sinks at the end.

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use futures::future::select_all;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, RunArgs};
use crate::config::Settings;
use crate::logging::level_name;
use crate::master::{Master, WorkerStdio};
use crate::protocol::tcp::accept_workers;
use crate::{build_engine, master_options};

pub async fn run_local(args: &RunArgs, settings: &Settings, cli: &CliArgs) -> Result<i32> {
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }
    let engine = build_engine(&args.scheduler, settings)?;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("binding loopback listener")?;
    let addr = listener.local_addr()?;
    let stdio = WorkerStdio::for_dag(&args.scheduler.dag, std::process::id());

    let mut children = spawn_workers(args, settings, cli, &addr.to_string(), &stdio)?;
    info!(workers = args.workers, %addr, "started local workers");

    let channel = tokio::select! {
        channel = accept_workers(listener, args.workers) => channel?,
        (status, idx, _) = select_all(children.iter_mut().map(|c| Box::pin(c.wait()))) => {
            bail!("worker {} exited before connecting ({:?})", idx + 1, status);
        }
    };

    let options = master_options(&args.scheduler, settings, Some(stdio));
    let report = Master::new(channel, args.workers, engine, options)?.run().await?;

    for (idx, mut child) in children.into_iter().enumerate() {
        match child.wait().await {
            Ok(status) if status.success() => debug!(rank = idx + 1, "worker exited"),
            Ok(status) => warn!(rank = idx + 1, %status, "worker exited abnormally"),
            Err(e) => warn!(rank = idx + 1, error = %e, "unable to wait for worker"),
        }
    }

    Ok(report.exit_code())
}

fn spawn_workers(
    args: &RunArgs,
    settings: &Settings,
    cli: &CliArgs,
    addr: &str,
    stdio: &WorkerStdio,
) -> Result<Vec<Child>> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let host_script = args
        .scheduler
        .host_script
        .clone()
        .or_else(|| settings.master.host_script.clone());

    let mut children = Vec::with_capacity(args.workers as usize);
    for rank in 1..=args.workers {
        let mut cmd = Command::new(&exe);
        if let Some(level) = cli.log_level {
            cmd.arg("--log-level").arg(level_name(level));
        }
        if let Some(config) = &cli.config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("worker")
            .arg("--connect")
            .arg(addr)
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--task-stdout")
            .arg(stdio.out_path(rank))
            .arg("--task-stderr")
            .arg(stdio.err_path(rank));

        if let Some(memory) = args.host.host_memory {
            cmd.arg("--host-memory").arg(memory.to_string());
        }
        if let Some(cpus) = args.host.host_cpus {
            cmd.arg("--host-cpus").arg(cpus.to_string());
        }
        if args.host.strict_limits {
            cmd.arg("--strict-limits");
        }
        if let Some(script) = &host_script {
            cmd.arg("--host-script").arg(script);
        }

        cmd.stdin(Stdio::null()).kill_on_drop(true);
        let child = cmd
            .spawn()
            .with_context(|| format!("starting worker {rank}"))?;
        children.push(child);
    }
    Ok(children)
}
