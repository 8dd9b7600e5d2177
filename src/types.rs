// src/types.rs

use std::fmt;
use std::str::FromStr;

/// One forwarding request attached to a task.
///
/// For a pipe forwarding (`-f VAR=PATH`), `key` is the environment variable
/// that receives the pipe's write descriptor and `dest` is the file on the
/// master that collects whatever the task writes into it.
///
/// For a file forwarding (`-F SRC=DEST`), `key` is the file the task leaves
/// behind on the worker and `dest` is where its contents land on the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub key: String,
    pub dest: String,
}

impl Forward {
    pub fn new(key: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            dest: dest.into(),
        }
    }
}

impl FromStr for Forward {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, dest)) if !key.is_empty() && !dest.is_empty() => {
                Ok(Forward::new(key, dest))
            }
            _ => Err(format!("invalid forward '{s}' (expected KEY=VALUE)")),
        }
    }
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.dest)
    }
}
