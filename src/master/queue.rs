// src/master/queue.rs

//! Pending list between the engine and the slots.
//!
//! Ordered by priority (higher first), then by arrival. A task deferred
//! during a scheduling pass goes back in with its original arrival number,
//! so it keeps its place relative to everything else.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::dag::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub task: TaskId,
    pub priority: i32,
    seq: u64,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskId, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Pending {
            task,
            priority,
            seq,
        });
    }

    /// Put back an entry taken with [`ReadyQueue::pop`] without losing its place.
    pub fn defer(&mut self, entry: Pending) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<Pending> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
