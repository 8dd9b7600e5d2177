// src/master/cluster.rs

//! Host and slot bookkeeping for the scheduler.
//!
//! The [`Cluster`] is the single source of truth for free resources. Every
//! allocation goes through [`Cluster::allocate`] and is undone exactly by
//! [`Cluster::release`].

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::dag::TaskId;
use crate::errors::{ClusterError, Result};
use crate::master::host::{Assignment, CpuTopology, Host, Slot};
use crate::master::resource_log::{AGGREGATE, ResourceLog};
use crate::protocol::{Rank, Registration};

#[derive(Debug, Default)]
pub struct Cluster {
    hosts: Vec<Host>,
    /// Indexed by `rank - 1`.
    slots: Vec<Slot>,
    /// Idle ranks in the order they became idle.
    free_slots: Vec<Rank>,

    total_cpus: u32,
    free_memory: u32,
    free_cpus: u32,

    resource_log: Option<ResourceLog>,
}

impl Cluster {
    /// Build hosts and slots from every worker's registration.
    ///
    /// Workers reporting the same hostname share a [`Host`]; its envelope is
    /// taken from the first registration seen for that name. Host ranks are
    /// handed out per host in ascending global rank, starting at 0.
    pub fn from_registrations(
        registrations: &[(Rank, Registration)],
        resource_log: Option<ResourceLog>,
    ) -> Result<Self> {
        let mut cluster = Cluster {
            resource_log,
            ..Default::default()
        };
        let mut host_index: HashMap<&str, usize> = HashMap::new();
        let mut host_of_rank: HashMap<Rank, usize> = HashMap::new();

        for (rank, reg) in registrations {
            let idx = match host_index.get(reg.hostname.as_str()) {
                Some(&idx) => idx,
                None => {
                    let topology = CpuTopology::new(reg.cpus, reg.cores, reg.sockets);
                    debug!(
                        host = %reg.hostname,
                        memory = reg.memory,
                        cpus = %topology,
                        "new host"
                    );
                    cluster
                        .hosts
                        .push(Host::new(reg.hostname.clone(), reg.memory, topology));
                    cluster.total_cpus += reg.cpus;
                    cluster.free_cpus += reg.cpus;
                    cluster.free_memory += reg.memory;
                    let idx = cluster.hosts.len() - 1;
                    host_index.insert(reg.hostname.as_str(), idx);
                    idx
                }
            };
            cluster.hosts[idx].add_slot();
            host_of_rank.insert(*rank, idx);
        }

        let workers = registrations.len() as Rank;
        let mut next_host_rank: HashMap<usize, u32> = HashMap::new();
        for rank in 1..=workers {
            let host = *host_of_rank.get(&rank).ok_or_else(|| {
                ClusterError::protocol(format!("worker rank {rank} never registered"))
            })?;
            let counter = next_host_rank.entry(host).or_insert(0);
            let host_rank = *counter;
            *counter += 1;

            debug!(rank, host = %cluster.hosts[host].name, host_rank, "slot registered");
            cluster.slots.push(Slot {
                rank,
                host,
                host_rank,
                running: None,
            });
            cluster.free_slots.push(rank);
        }

        cluster.log_all()?;
        Ok(cluster)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, rank: Rank) -> Option<&Slot> {
        rank.checked_sub(1)
            .and_then(|idx| self.slots.get(idx as usize))
    }

    pub fn host_of(&self, slot: &Slot) -> &Host {
        &self.hosts[slot.host]
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    pub fn total_cpus(&self) -> u32 {
        self.total_cpus
    }

    pub fn free_slot_count(&self) -> usize {
        self.free_slots.len()
    }

    pub fn busy_slot_count(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    /// Is there a host big enough for this task, ignoring current load?
    pub fn can_satisfy(&self, memory: u32, cpus: u32) -> bool {
        self.hosts.iter().any(|h| h.can_run(memory, cpus))
    }

    /// First idle slot whose host currently has room for the task.
    pub fn find_slot(&self, memory: u32, cpus: u32) -> Option<Rank> {
        self.free_slots.iter().copied().find(|&rank| {
            self.slot(rank)
                .is_some_and(|slot| self.hosts[slot.host].fits(memory, cpus))
        })
    }

    /// Reserve `rank`'s slot and its host's resources for `task`.
    ///
    /// Returns the CPU ids bound to the task.
    pub fn allocate(&mut self, rank: Rank, task: TaskId, memory: u32, cpus: u32) -> Result<Vec<u32>> {
        let pos = self
            .free_slots
            .iter()
            .position(|&r| r == rank)
            .ok_or_else(|| ClusterError::protocol(format!("slot {rank} is not idle")))?;
        let host_idx = self.slots[(rank - 1) as usize].host;
        if !self.hosts[host_idx].fits(memory, cpus) {
            return Err(ClusterError::protocol(format!(
                "host {} cannot fit {memory} MB / {cpus} CPUs",
                self.hosts[host_idx].name
            )));
        }

        self.free_slots.remove(pos);
        let binding = self.hosts[host_idx].allocate(memory, cpus);
        self.free_memory -= memory;
        self.free_cpus -= cpus;

        self.slots[(rank - 1) as usize].running = Some(Assignment {
            task,
            memory,
            cpus,
            binding: binding.clone(),
        });

        self.trace_host(host_idx);
        self.log_host(host_idx)?;
        Ok(binding)
    }

    /// Give back whatever `rank` was running and mark the slot idle.
    pub fn release(&mut self, rank: Rank) -> Result<Assignment> {
        let slot = rank
            .checked_sub(1)
            .and_then(|idx| self.slots.get_mut(idx as usize))
            .ok_or_else(|| ClusterError::protocol(format!("unknown worker rank {rank}")))?;
        let assignment = slot
            .running
            .take()
            .ok_or_else(|| ClusterError::protocol(format!("worker {rank} reported a result while idle")))?;
        let host_idx = slot.host;

        self.hosts[host_idx].release(assignment.memory, assignment.cpus, &assignment.binding);
        self.free_memory += assignment.memory;
        self.free_cpus += assignment.cpus;
        self.free_slots.push(rank);

        self.trace_host(host_idx);
        self.log_host(host_idx)?;
        Ok(assignment)
    }

    pub fn flush_log(&mut self) -> Result<()> {
        match self.resource_log.as_mut() {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }

    fn trace_host(&self, idx: usize) {
        let host = &self.hosts[idx];
        trace!(
            host = %host.name,
            memory = host.free_memory(),
            cpus = host.free_cpus(),
            slots = host.free_slots(),
            "host resources free"
        );
    }

    fn log_host(&mut self, idx: usize) -> Result<()> {
        let Some(log) = self.resource_log.as_mut() else {
            return Ok(());
        };
        let host = &self.hosts[idx];
        log.record(host.free_slots(), host.free_cpus(), host.free_memory(), &host.name)?;
        log.record(
            self.free_slots.len() as u32,
            self.free_cpus,
            self.free_memory,
            AGGREGATE,
        )
    }

    fn log_all(&mut self) -> Result<()> {
        let Some(log) = self.resource_log.as_mut() else {
            return Ok(());
        };
        for host in &self.hosts {
            log.record(host.free_slots(), host.free_cpus(), host.free_memory(), &host.name)?;
        }
        log.record(
            self.free_slots.len() as u32,
            self.free_cpus,
            self.free_memory,
            AGGREGATE,
        )
    }
}
