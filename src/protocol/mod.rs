// src/protocol/mod.rs

//! Master <-> worker wire protocol.
//!
//! - [`Message`] is the closed set of messages exchanged between the
//!   scheduler (rank 0) and its workers (ranks 1..=N).
//! - [`codec`] turns messages into length-prefixed big-endian payloads and
//!   back.
//! - [`channel`] defines the [`Channel`] trait the master and workers talk
//!   through, plus the [`Endpoint`] that implements it.
//! - [`local`] wires endpoints together in-process (tests, embedding).
//! - [`tcp`] carries the same frames over TCP between processes and hosts.

use bytes::Bytes;

use crate::types::Forward;

pub mod channel;
pub mod codec;
pub mod local;
pub mod tcp;

pub use channel::{Channel, Endpoint};
pub use codec::{decode, encode};

/// Process rank. The master is always rank 0.
pub type Rank = u32;

/// Rank of the scheduler process.
pub const MASTER: Rank = 0;

/// Upper bound on one encoded message; forwarded outputs are the only large
/// payload.
pub const MAX_FRAME: u32 = 1 << 30;

/// Forwarded output a single RESULT may carry. The rest of the frame is
/// reserved for the task name and per-output headers.
pub const MAX_FORWARDED_BYTES: usize = MAX_FRAME as usize - (1 << 20);

/// Resource envelope a worker reports about the host it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub hostname: String,
    /// Usable memory in MB.
    pub memory: u32,
    /// Logical CPUs (hardware threads).
    pub cpus: u32,
    pub cores: u32,
    pub sockets: u32,
}

/// A task dispatched to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCommand {
    pub name: String,
    pub command: String,
    /// Pass-through identifier; empty when the workflow did not supply one.
    pub opaque_id: String,
    pub memory: u32,
    pub cpus: u32,
    pub pipe_forwards: Vec<Forward>,
    pub file_forwards: Vec<Forward>,
    /// Logical CPU ids the task should be pinned to. Empty means unpinned.
    pub affinity: Vec<u32>,
}

/// Bytes collected for one forwarding destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedOutput {
    pub dest: String,
    pub data: Bytes,
}

/// Outcome of one task, sent back to the master.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub name: String,
    /// Process exit code, or the negated signal number on signal death.
    pub exit_code: i32,
    /// Wall-clock runtime in seconds.
    pub runtime: f64,
    pub outputs: Vec<ForwardedOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Shutdown,
    Command(TaskCommand),
    Result(TaskResult),
    Registration(Registration),
    HostRank(u32),
}

impl Message {
    /// Short name used in logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Shutdown => "SHUTDOWN",
            Message::Command(_) => "COMMAND",
            Message::Result(_) => "RESULT",
            Message::Registration(_) => "REGISTRATION",
            Message::HostRank(_) => "HOSTRANK",
        }
    }
}
