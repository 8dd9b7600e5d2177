// src/worker/forward.rs

//! Output forwarding.
//!
//! Pipe forwards hand the task the write end of a pipe through an
//! environment variable; whatever the task writes is buffered here and
//! returned to the master. File forwards are read once the task has exited.
//! Everything collected for one task must fit in a single RESULT frame;
//! [`cap_outputs`] drops what does not.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bytes::Bytes;
use futures::future::join_all;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::{error, trace, warn};

use crate::errors::{ClusterError, Result};
use crate::protocol::ForwardedOutput;
use crate::types::Forward;

/// One pipe forward, before and while the task runs.
#[derive(Debug)]
pub struct ForwardPipe {
    pub var: String,
    pub dest: String,
    read: OwnedFd,
    write: Option<OwnedFd>,
}

impl ForwardPipe {
    /// Descriptor number the child sees, while the parent still holds it.
    pub fn child_fd(&self) -> Option<RawFd> {
        self.write.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Drop the parent's copy of the write end after the child is spawned.
    pub fn close_write(&mut self) {
        self.write = None;
    }
}

/// Create one close-on-exec pipe per forward. The child clears the flag on
/// its write ends just before exec.
pub fn open_pipes(task: &str, forwards: &[Forward]) -> Result<Vec<ForwardPipe>> {
    forwards
        .iter()
        .map(|fwd| {
            let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(|source| ClusterError::Pipe {
                task: task.to_string(),
                source,
            })?;
            trace!(task, var = %fwd.key, dest = %fwd.dest, "created forwarding pipe");
            Ok(ForwardPipe {
                var: fwd.key.clone(),
                dest: fwd.dest.clone(),
                read,
                write: Some(write),
            })
        })
        .collect()
}

/// Read every pipe to EOF concurrently.
///
/// A pipe that fails mid-read is closed early; the task then gets SIGPIPE
/// on its next write instead of blocking forever. Write ends must already be
/// closed in the parent.
pub async fn drain_pipes(task: &str, pipes: Vec<ForwardPipe>) -> Vec<ForwardedOutput> {
    let reads = pipes.into_iter().map(|p| async move {
        let ForwardPipe { var, dest, read, .. } = p;
        match read_pipe(read).await {
            Ok(data) => {
                trace!(task, var = %var, bytes = data.len(), "forwarding pipe closed");
                Some(ForwardedOutput {
                    dest,
                    data: Bytes::from(data),
                })
            }
            Err(e) => {
                error!(task, var = %var, error = %e, "error reading forwarding pipe");
                None
            }
        }
    });
    join_all(reads).await.into_iter().flatten().collect()
}

async fn read_pipe(fd: OwnedFd) -> io::Result<Vec<u8>> {
    let mut rx = pipe::Receiver::from_owned_fd(fd)?;
    let mut data = Vec::new();
    rx.read_to_end(&mut data).await?;
    Ok(data)
}

/// Collect file forwards left behind by the task. Missing files are logged
/// and skipped.
pub async fn read_files(task: &str, forwards: &[Forward]) -> Vec<ForwardedOutput> {
    let mut outputs = Vec::with_capacity(forwards.len());
    for fwd in forwards {
        match tokio::fs::read(&fwd.key).await {
            Ok(data) => outputs.push(ForwardedOutput {
                dest: fwd.dest.clone(),
                data: Bytes::from(data),
            }),
            Err(e) => warn!(task, src = %fwd.key, error = %e, "unable to read forwarded file"),
        }
    }
    outputs
}

/// Bytes an output occupies in an encoded RESULT.
fn wire_size(out: &ForwardedOutput) -> usize {
    8 + out.dest.len() + out.data.len()
}

/// Keep outputs, in order, while their total encoded size stays within
/// `limit`. Each output that does not fit is logged and dropped; later,
/// smaller outputs are still kept.
pub fn cap_outputs(task: &str, outputs: Vec<ForwardedOutput>, limit: usize) -> Vec<ForwardedOutput> {
    let mut used = 0usize;
    outputs
        .into_iter()
        .filter(|out| {
            let size = wire_size(out);
            if size > limit - used {
                error!(task, dest = %out.dest, bytes = out.data.len(), limit, "forwarded output too large; dropped");
                return false;
            }
            used += size;
            true
        })
        .collect()
}
