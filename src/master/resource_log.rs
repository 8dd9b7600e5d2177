// src/master/resource_log.rs

//! Resource usage time series.
//!
//! One CSV line per snapshot: `timestamp,slots,cpus,memory,host`, where the
//! numbers are what is *free* and host `*` is the cluster-wide aggregate.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;

use crate::errors::Result;

/// The aggregate pseudo-host name.
pub const AGGREGATE: &str = "*";

#[derive(Debug)]
pub struct ResourceLog {
    out: BufWriter<File>,
}

impl ResourceLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening resource log {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    pub fn record(&mut self, slots: u32, cpus: u32, memory: u32, host: &str) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        writeln!(self.out, "{timestamp:.6},{slots},{cpus},{memory},{host}")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
