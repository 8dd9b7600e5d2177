// src/master/stdio.rs

//! Master-side output handling: task stdout/stderr sinks, merging of
//! per-worker output files, and forwarded bytes returned in results.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{trace, warn};

use crate::errors::Result;
use crate::protocol::{ForwardedOutput, Rank};

/// Where task output ends up on the master.
#[derive(Debug)]
pub enum OutputSink {
    Stdout,
    Stderr,
    File(File),
}

impl OutputSink {
    /// A file created (truncated) at `path`, or `default` when `path` is `None`.
    pub fn open(path: Option<&Path>, default: OutputSink) -> Result<Self> {
        match path {
            None => Ok(default),
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("opening task output file {}", path.display()))?;
                Ok(OutputSink::File(file))
            }
        }
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputSink::Stdout => io::stdout().write(buf),
            OutputSink::Stderr => io::stderr().write(buf),
            OutputSink::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Stdout => io::stdout().flush(),
            OutputSink::Stderr => io::stderr().flush(),
            OutputSink::File(file) => file.flush(),
        }
    }
}

/// Path prefixes of the files workers write task output to. Worker `k`
/// writes `<out>.<k>` and `<err>.<k>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStdio {
    pub out_prefix: PathBuf,
    pub err_prefix: PathBuf,
}

impl WorkerStdio {
    /// `<dag>.<pid>.out` / `<dag>.<pid>.err`.
    pub fn for_dag(dag: &Path, pid: u32) -> Self {
        let base = dag.display().to_string();
        Self {
            out_prefix: PathBuf::from(format!("{base}.{pid}.out")),
            err_prefix: PathBuf::from(format!("{base}.{pid}.err")),
        }
    }

    pub fn out_path(&self, rank: Rank) -> PathBuf {
        with_rank(&self.out_prefix, rank)
    }

    pub fn err_path(&self, rank: Rank) -> PathBuf {
        with_rank(&self.err_prefix, rank)
    }

    /// Append every worker's files to the sinks and delete them.
    pub fn merge(&self, workers: u32, stdout: &mut OutputSink, stderr: &mut OutputSink) -> Result<()> {
        for rank in 1..=workers {
            merge_file(&self.out_path(rank), stdout, "stdout")?;
            merge_file(&self.err_path(rank), stderr, "stderr")?;
        }
        stdout.flush()?;
        stderr.flush()?;
        Ok(())
    }
}

fn with_rank(prefix: &Path, rank: Rank) -> PathBuf {
    PathBuf::from(format!("{}.{rank}", prefix.display()))
}

fn merge_file(src: &Path, dest: &mut OutputSink, stream: &str) -> Result<()> {
    trace!(path = %src.display(), stream, "merging worker output");
    let mut file = match File::open(src) {
        Ok(file) => file,
        // A worker that never ran a task may not have created its file.
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %src.display(), stream, "no worker output file");
            return Ok(());
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("opening worker {stream} file {}", src.display()))
                .into());
        }
    };
    io::copy(&mut file, dest)
        .with_context(|| format!("merging worker {stream} file {}", src.display()))?;
    fs::remove_file(src)
        .with_context(|| format!("deleting worker {stream} file {}", src.display()))?;
    Ok(())
}

/// Append forwarded task output to its destination files on the master.
pub fn write_forwarded(outputs: &[ForwardedOutput]) -> Result<()> {
    for out in outputs {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&out.dest)
            .with_context(|| format!("opening forward destination {}", out.dest))?;
        file.write_all(&out.data)
            .with_context(|| format!("writing forward destination {}", out.dest))?;
        trace!(dest = %out.dest, bytes = out.data.len(), "wrote forwarded output");
    }
    Ok(())
}
