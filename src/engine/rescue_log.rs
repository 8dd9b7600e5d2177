// src/engine/rescue_log.rs

//! Append-only writer for `DONE <name>` records.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::dag::Dag;
use crate::errors::Result;

#[derive(Debug)]
pub struct RescueLog {
    path: PathBuf,
    file: File,
}

impl RescueLog {
    /// Open the live rescue log.
    ///
    /// When `path` is the file the DAG was seeded from, new records are
    /// appended to it. Otherwise the file is truncated and every task that
    /// already succeeded is written first, so the new log stands on its own.
    pub fn open(path: impl AsRef<Path>, seeded_from: Option<&Path>, dag: &Dag) -> Result<Self> {
        let path = path.as_ref();
        let append = seeded_from.is_some_and(|src| same_file(src, path));

        let file = if append {
            OpenOptions::new().create(true).append(true).open(path)
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
        }
        .with_context(|| format!("opening rescue log {}", path.display()))?;

        let mut log = Self {
            path: path.to_path_buf(),
            file,
        };

        if !append {
            let mut rewritten = 0usize;
            for task in dag.tasks().filter(|t| t.success) {
                writeln!(log.file, "DONE {}", task.name)?;
                rewritten += 1;
            }
            log.file.flush()?;
            log.file.sync_data()?;
            debug!(path = %log.path.display(), rewritten, "started fresh rescue log");
        }

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one successful task. The line is on disk before this returns.
    pub fn append(&mut self, name: &str) -> Result<()> {
        writeln!(self.file, "DONE {name}")
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data())
            .with_context(|| format!("writing rescue log {}", self.path.display()))?;
        Ok(())
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
