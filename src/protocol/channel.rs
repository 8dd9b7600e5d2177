// src/protocol/channel.rs

//! Point-to-point channel between ranks.
//!
//! The master and the workers only ever see the [`Channel`] trait. The one
//! production implementation, [`Endpoint`], is transport-agnostic: every
//! outgoing destination is an unbounded queue (drained either directly into
//! a peer's inbox or by a socket writer task) and every incoming packet lands
//! in a single inbox. Per-destination queues keep per-rank send order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{MASTER, Message, Rank, codec};
use crate::errors::{ClusterError, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What travels between endpoints.
#[derive(Debug, Clone)]
pub(crate) enum Packet {
    /// An encoded [`Message`].
    Message(Bytes),
    /// Barrier arrival (worker -> master) or release (master -> worker).
    Barrier,
    /// The sending side went away.
    Hangup,
}

#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub from: Rank,
    pub packet: Packet,
}

pub(crate) type Outbox = mpsc::UnboundedSender<Envelope>;
pub(crate) type Inbox = mpsc::UnboundedReceiver<Envelope>;

/// Message channel used by the master and the workers.
pub trait Channel: Send {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Queue `msg` for delivery to `to`. Messages to the same destination
    /// are delivered in send order.
    fn send(&mut self, to: Rank, msg: &Message) -> Result<()>;

    /// Wait for the next message from any rank.
    fn recv(&mut self) -> BoxFuture<'_, Result<(Rank, Message)>>;

    /// Non-blocking probe: is a message ready to be received?
    fn message_waiting(&mut self) -> Result<bool>;

    /// Block until every rank connected to the master has reached the
    /// barrier. Messages that arrive meanwhile are kept for `recv`.
    fn barrier(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Flush everything queued so far and hang up on every peer.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub struct Endpoint {
    rank: Rank,
    peers: HashMap<Rank, Outbox>,
    inbox: Inbox,
    stash: VecDeque<(Rank, Message)>,
    barriers_seen: usize,
    writers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut peers: Vec<_> = self.peers.keys().copied().collect();
        peers.sort_unstable();
        f.debug_struct("Endpoint")
            .field("rank", &self.rank)
            .field("peers", &peers)
            .field("stashed", &self.stash.len())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub(crate) fn new(rank: Rank, peers: HashMap<Rank, Outbox>, inbox: Inbox) -> Self {
        Self {
            rank,
            peers,
            inbox,
            stash: VecDeque::new(),
            barriers_seen: 0,
            writers: Vec::new(),
        }
    }

    /// Attach transport tasks that drain the outboxes; `close` waits on them.
    pub(crate) fn with_writers(mut self, writers: Vec<JoinHandle<()>>) -> Self {
        self.writers = writers;
        self
    }

    /// Number of ranks this endpoint can send to.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn push(&self, to: Rank, packet: Packet) -> Result<()> {
        let outbox = self
            .peers
            .get(&to)
            .ok_or_else(|| ClusterError::protocol(format!("rank {to} is not a known peer")))?;
        outbox
            .send(Envelope {
                from: self.rank,
                packet,
            })
            .map_err(|_| ClusterError::ChannelClosed(to))
    }

    /// Absorb one envelope. Returns a decoded message if it carried one.
    fn accept(&mut self, env: Envelope) -> Result<Option<(Rank, Message)>> {
        match env.packet {
            Packet::Message(bytes) => {
                let msg = codec::decode(bytes)?;
                trace!(rank = self.rank, from = env.from, kind = msg.kind(), "received message");
                Ok(Some((env.from, msg)))
            }
            Packet::Barrier => {
                self.barriers_seen += 1;
                Ok(None)
            }
            Packet::Hangup => Err(ClusterError::ChannelClosed(env.from)),
        }
    }

    async fn next_envelope(&mut self) -> Result<Envelope> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| ClusterError::protocol("all peers disconnected"))
    }

    async fn recv_inner(&mut self) -> Result<(Rank, Message)> {
        loop {
            if let Some(msg) = self.stash.pop_front() {
                return Ok(msg);
            }
            let env = self.next_envelope().await?;
            if let Some(msg) = self.accept(env)? {
                return Ok(msg);
            }
        }
    }

    /// Wait until `count` barrier packets have been seen, stashing messages.
    async fn await_barriers(&mut self, count: usize) -> Result<()> {
        while self.barriers_seen < count {
            let env = self.next_envelope().await?;
            if let Some(msg) = self.accept(env)? {
                self.stash.push_back(msg);
            }
        }
        self.barriers_seen -= count;
        Ok(())
    }

    fn hang_up(&mut self) {
        for (_, outbox) in self.peers.drain() {
            let _ = outbox.send(Envelope {
                from: self.rank,
                packet: Packet::Hangup,
            });
        }
    }

    async fn close_inner(&mut self) {
        self.hang_up();
        for writer in self.writers.drain(..) {
            let _ = writer.await;
        }
    }

    async fn barrier_inner(&mut self) -> Result<()> {
        if self.rank == MASTER {
            let expected = self.peers.len();
            debug!(expected, "master waiting at barrier");
            self.await_barriers(expected).await?;
            let mut ranks: Vec<Rank> = self.peers.keys().copied().collect();
            ranks.sort_unstable();
            for rank in ranks {
                self.push(rank, Packet::Barrier)?;
            }
        } else {
            debug!(rank = self.rank, "worker waiting at barrier");
            self.push(MASTER, Packet::Barrier)?;
            self.await_barriers(1).await?;
        }
        Ok(())
    }
}

impl Channel for Endpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn send(&mut self, to: Rank, msg: &Message) -> Result<()> {
        trace!(rank = self.rank, to, kind = msg.kind(), "sending message");
        self.push(to, Packet::Message(codec::encode(msg)))
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<(Rank, Message)>> {
        Box::pin(self.recv_inner())
    }

    fn message_waiting(&mut self) -> Result<bool> {
        if !self.stash.is_empty() {
            return Ok(true);
        }
        loop {
            match self.inbox.try_recv() {
                Ok(env) => {
                    if let Some(msg) = self.accept(env)? {
                        self.stash.push_back(msg);
                        return Ok(true);
                    }
                }
                Err(TryRecvError::Empty) => return Ok(false),
                Err(TryRecvError::Disconnected) => {
                    return Err(ClusterError::protocol("all peers disconnected"));
                }
            }
        }
    }

    fn barrier(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.barrier_inner())
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.close_inner())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.hang_up();
    }
}
