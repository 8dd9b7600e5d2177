// src/protocol/local.rs

//! In-process transport: a star of endpoints wired by channels.

use std::collections::HashMap;

use tokio::sync::mpsc;

use super::channel::{Endpoint, Envelope};
use super::MASTER;

/// Build a master endpoint and `workers` worker endpoints (ranks `1..=workers`).
///
/// Workers can only talk to the master, mirroring the network transport.
pub fn network(workers: u32) -> (Endpoint, Vec<Endpoint>) {
    let (master_tx, master_rx) = mpsc::unbounded_channel::<Envelope>();

    let mut master_peers = HashMap::new();
    let mut worker_ends = Vec::with_capacity(workers as usize);

    for rank in 1..=workers {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        master_peers.insert(rank, tx);

        let mut peers = HashMap::new();
        peers.insert(MASTER, master_tx.clone());
        worker_ends.push(Endpoint::new(rank, peers, rx));
    }

    let master = Endpoint::new(MASTER, master_peers, master_rx);
    (master, worker_ends)
}
