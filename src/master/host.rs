// src/master/host.rs

use std::fmt;

use crate::dag::TaskId;
use crate::protocol::Rank;

/// CPU layout of one machine as reported by its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopology {
    pub threads: u32,
    pub cores: u32,
    pub sockets: u32,
}

impl CpuTopology {
    pub fn new(threads: u32, cores: u32, sockets: u32) -> Self {
        Self {
            threads,
            cores,
            sockets,
        }
    }
}

impl fmt::Display for CpuTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} threads/{} cores/{} sockets",
            self.threads, self.cores, self.sockets
        )
    }
}

/// One machine's resource envelope.
///
/// The free counters start at the registered totals and are only changed by
/// [`Host::allocate`] and [`Host::release`].
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub memory: u32,
    pub topology: CpuTopology,
    pub slots: u32,

    free_memory: u32,
    free_cpus: u32,
    free_slots: u32,
    /// `cpu_free[i]` is true while logical CPU `i` is unbound.
    cpu_free: Vec<bool>,
}

impl Host {
    pub fn new(name: impl Into<String>, memory: u32, topology: CpuTopology) -> Self {
        Self {
            name: name.into(),
            memory,
            topology,
            slots: 0,
            free_memory: memory,
            free_cpus: topology.threads,
            free_slots: 0,
            cpu_free: vec![true; topology.threads as usize],
        }
    }

    pub fn cpus(&self) -> u32 {
        self.topology.threads
    }

    pub fn free_memory(&self) -> u32 {
        self.free_memory
    }

    pub fn free_cpus(&self) -> u32 {
        self.free_cpus
    }

    pub fn free_slots(&self) -> u32 {
        self.free_slots
    }

    /// Logical CPU ids that are currently unbound, ascending.
    pub fn free_cpu_ids(&self) -> Vec<u32> {
        self.cpu_free
            .iter()
            .enumerate()
            .filter(|(_, free)| **free)
            .map(|(id, _)| id as u32)
            .collect()
    }

    pub(crate) fn add_slot(&mut self) {
        self.slots += 1;
        self.free_slots += 1;
    }

    /// Could this host ever run a task of this size?
    pub fn can_run(&self, memory: u32, cpus: u32) -> bool {
        self.memory >= memory && self.cpus() >= cpus
    }

    /// Does a task of this size fit in what is free right now?
    pub fn fits(&self, memory: u32, cpus: u32) -> bool {
        self.free_memory >= memory && self.free_cpus >= cpus
    }

    /// Reserve resources for one task and return the CPU ids bound to it.
    ///
    /// Callers check [`Host::fits`] first.
    pub fn allocate(&mut self, memory: u32, cpus: u32) -> Vec<u32> {
        debug_assert!(self.fits(memory, cpus));
        self.free_memory -= memory;
        self.free_cpus -= cpus;
        self.free_slots = self.free_slots.saturating_sub(1);

        let binding = self.pick_cpus(cpus as usize);
        for &cpu in &binding {
            self.cpu_free[cpu as usize] = false;
        }
        binding
    }

    /// Return exactly what [`Host::allocate`] handed out.
    pub fn release(&mut self, memory: u32, cpus: u32, binding: &[u32]) {
        self.free_memory += memory;
        self.free_cpus += cpus;
        self.free_slots += 1;
        for &cpu in binding {
            if let Some(free) = self.cpu_free.get_mut(cpu as usize) {
                *free = true;
            }
        }
    }

    /// Lowest contiguous run of `n` free CPUs, else the `n` lowest free ones.
    fn pick_cpus(&self, n: usize) -> Vec<u32> {
        if n == 0 {
            return Vec::new();
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for (id, free) in self.cpu_free.iter().enumerate() {
            if *free {
                if run_len == 0 {
                    run_start = id;
                }
                run_len += 1;
                if run_len == n {
                    return (run_start..run_start + n).map(|id| id as u32).collect();
                }
            } else {
                run_len = 0;
            }
        }

        self.free_cpu_ids().into_iter().take(n).collect()
    }
}

/// What a busy slot is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task: TaskId,
    pub memory: u32,
    pub cpus: u32,
    pub binding: Vec<u32>,
}

/// One worker process bound to a host.
#[derive(Debug, Clone)]
pub struct Slot {
    pub rank: Rank,
    /// Index into the cluster's host list.
    pub host: usize,
    pub host_rank: u32,
    pub running: Option<Assignment>,
}
