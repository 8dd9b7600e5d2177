// src/worker/host_info.rs

//! Detect the resources of the machine a worker runs on.

use std::fs;
use std::thread;

use anyhow::Context;
use nix::unistd::gethostname;
use tracing::debug;

use crate::errors::{ClusterError, Result};
use crate::protocol::Registration;

/// Operator overrides; 0 means "detect".
#[derive(Debug, Clone, Copy, Default)]
pub struct HostOverrides {
    pub memory: u32,
    pub cpus: u32,
}

pub fn detect(overrides: HostOverrides) -> Result<Registration> {
    let hostname = gethostname()
        .context("reading hostname")?
        .to_string_lossy()
        .into_owned();

    let memory = if overrides.memory > 0 {
        overrides.memory
    } else {
        let text = fs::read_to_string("/proc/meminfo").context("reading /proc/meminfo")?;
        parse_meminfo(&text).ok_or_else(|| {
            ClusterError::ConfigError(
                "unable to detect host memory; pass --host-memory".to_string(),
            )
        })?
    };

    let (cpus, cores, sockets) = if overrides.cpus > 0 {
        (overrides.cpus, overrides.cpus, 1)
    } else {
        let threads = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let (cores, sockets) = fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|text| parse_cpuinfo(&text))
            .unwrap_or((threads, 1));
        (threads, cores.min(threads).max(1), sockets.max(1))
    };

    debug!(host = %hostname, memory, cpus, cores, sockets, "detected host resources");
    Ok(Registration {
        hostname,
        memory,
        cpus,
        cores,
        sockets,
    })
}

/// `MemTotal` from `/proc/meminfo`, converted from kB to MB rounding up.
pub fn parse_meminfo(text: &str) -> Option<u32> {
    let line = text.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    u32::try_from(kb.div_ceil(1024)).ok()
}

/// Physical cores and sockets from `/proc/cpuinfo`.
///
/// Cores are distinct `(physical id, core id)` pairs. Returns `None` when the
/// file carries no topology (some VMs and non-x86 kernels).
pub fn parse_cpuinfo(text: &str) -> Option<(u32, u32)> {
    let mut cores = std::collections::HashSet::new();
    let mut sockets = std::collections::HashSet::new();
    let mut physical: Option<String> = None;
    let mut core: Option<String> = None;

    let mut flush = |physical: &mut Option<String>, core: &mut Option<String>| {
        if let (Some(p), Some(c)) = (physical.take(), core.take()) {
            sockets.insert(p.clone());
            cores.insert((p, c));
        }
    };

    for line in text.lines() {
        if line.trim().is_empty() {
            flush(&mut physical, &mut core);
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "physical id" => physical = Some(value.trim().to_string()),
            "core id" => core = Some(value.trim().to_string()),
            _ => {}
        }
    }
    flush(&mut physical, &mut core);

    if cores.is_empty() {
        return None;
    }
    Some((cores.len() as u32, sockets.len() as u32))
}
