// src/worker/host_script.rs

//! Per-host bootstrap script.
//!
//! Started by the host-rank 0 worker before any task runs, in its own
//! process group so anything it leaves behind can be cleaned up when the
//! worker exits.

use std::io;
use std::os::fd::AsFd;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{ClusterError, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The process group of a host script that has run.
#[derive(Debug)]
pub struct HostScriptGroup {
    pgid: Pid,
}

/// Run `script` and wait for it. A non-zero exit, death by signal, or
/// running past `timeout` is fatal for the worker.
pub async fn run_host_script(script: &Path, timeout: Duration) -> Result<HostScriptGroup> {
    info!(script = %script.display(), "launching host script");

    let stdout = io::stderr().as_fd().try_clone_to_owned()?;
    let mut child = Command::new(script)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .process_group(0)
        .spawn()
        .map_err(|e| {
            ClusterError::HostScript(format!("unable to start {}: {e}", script.display()))
        })?;

    let pid = child
        .id()
        .ok_or_else(|| ClusterError::HostScript("host script exited before it was tracked".to_string()))?;
    let pgid = Pid::from_raw(pid as i32);

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            let _ = killpg(pgid, Signal::SIGKILL);
            return Err(ClusterError::HostScript(format!(
                "timed out after {} seconds",
                timeout.as_secs()
            )));
        }
    };

    info!(status = %status, "host script exited");
    if !status.success() {
        return Err(ClusterError::HostScript(format!("failed: {status}")));
    }
    Ok(HostScriptGroup { pgid })
}

impl HostScriptGroup {
    /// SIGTERM the group, then SIGKILL whatever is still there after `grace`.
    pub async fn terminate(self, grace: Duration) {
        debug!(pgid = %self.pgid, "terminating host script process group");
        match killpg(self.pgid, Signal::SIGTERM) {
            Err(Errno::ESRCH) => return,
            Err(e) => {
                warn!(error = %e, "unable to terminate host script process group");
                return;
            }
            Ok(()) => {}
        }

        tokio::time::sleep(grace).await;
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) => warn!("sent SIGKILL to remaining host script processes"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(error = %e, "unable to kill host script process group"),
        }
    }
}
