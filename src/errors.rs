// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Task failures are not errors: they travel as exit codes. Everything in
//! here either stops the run before scheduling starts (bad workflow, bad
//! rescue file, unsatisfiable resources) or means the scheduler itself can
//! no longer make progress.

use thiserror::Error;

use crate::protocol::Rank;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Workflow parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Rescue file error on line {line}: {message}")]
    Rescue { line: usize, message: String },

    #[error("No host is capable of running task {task} ({memory} MB, {cpus} CPUs)")]
    Unsatisfiable {
        task: String,
        memory: u32,
        cpus: u32,
    },

    #[error("Unable to lock workflow file {0}: another scheduler may be running this workflow")]
    Lock(String),

    #[error("Ready queue is empty")]
    EmptyReadyQueue,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection to rank {0} closed")]
    ChannelClosed(Rank),

    #[error("Unable to start task {task}: {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to create forwarding pipe for task {task}: {source}")]
    Pipe {
        task: String,
        #[source]
        source: nix::Error,
    },

    #[error("Host script error: {0}")]
    HostScript(String),

    #[error("Scheduler stalled: {0}")]
    Stalled(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClusterError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        ClusterError::Parse {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ClusterError::Protocol(message.into())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ClusterError>;
