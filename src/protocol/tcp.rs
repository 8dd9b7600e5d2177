// src/protocol/tcp.rs

//! TCP transport.
//!
//! Each worker opens one connection to the master and announces its rank as a
//! big-endian `u32`. After that both directions carry frames:
//! `u32` length (kind byte + payload), `u8` kind, payload.
//!
//! Every connection gets a reader task (frames -> shared inbox) and a writer
//! task (outbox -> frames), so the [`Endpoint`] on top never touches a socket.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{Endpoint, Envelope, Packet};
use super::{MASTER, MAX_FRAME, Rank};
use crate::errors::{ClusterError, Result};

const KIND_MESSAGE: u8 = 1;
const KIND_BARRIER: u8 = 2;

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// Accept exactly `workers` connections (ranks `1..=workers`) and return the
/// master's endpoint.
pub async fn accept_workers(listener: TcpListener, workers: u32) -> Result<Endpoint> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<Envelope>();
    let mut peers = HashMap::new();
    let mut writers = Vec::new();

    while peers.len() < workers as usize {
        let (mut stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let rank = stream.read_u32().await?;

        if rank == MASTER || rank > workers {
            return Err(ClusterError::protocol(format!(
                "connection from {addr} announced rank {rank}, expected 1..={workers}"
            )));
        }
        if peers.contains_key(&rank) {
            return Err(ClusterError::protocol(format!(
                "rank {rank} connected twice (second connection from {addr})"
            )));
        }

        debug!(rank, %addr, "worker connected");
        let (outbox, writer) = attach(stream, rank, inbox_tx.clone());
        peers.insert(rank, outbox);
        writers.push(writer);
    }

    info!(workers, "all workers connected");
    Ok(Endpoint::new(MASTER, peers, inbox_rx).with_writers(writers))
}

/// Connect to the master as `rank`, retrying while the master is not yet
/// listening.
pub async fn connect(addr: &str, rank: Rank) -> Result<Endpoint> {
    let mut attempt = 0;
    let mut stream = loop {
        attempt += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                debug!(addr, attempt, error = %e, "master not reachable yet; retrying");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("connecting to master at {addr}"))
                    .into());
            }
        }
    };

    stream.set_nodelay(true)?;
    stream
        .write_u32(rank)
        .await
        .with_context(|| format!("announcing rank {rank} to master"))?;

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<Envelope>();
    let (outbox, writer) = attach(stream, MASTER, inbox_tx);

    let mut peers = HashMap::new();
    peers.insert(MASTER, outbox);
    Ok(Endpoint::new(rank, peers, inbox_rx).with_writers(vec![writer]))
}

/// Spawn the reader and writer tasks for one connection to `peer`.
fn attach(
    stream: TcpStream,
    peer: Rank,
    inbox: mpsc::UnboundedSender<Envelope>,
) -> (mpsc::UnboundedSender<Envelope>, JoinHandle<()>) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(packet)) => {
                    let env = Envelope { from: peer, packet };
                    if inbox.send(env).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer, "connection closed by peer");
                    let _ = inbox.send(Envelope {
                        from: peer,
                        packet: Packet::Hangup,
                    });
                    break;
                }
                Err(e) => {
                    warn!(peer, error = %e, "error reading from connection");
                    let _ = inbox.send(Envelope {
                        from: peer,
                        packet: Packet::Hangup,
                    });
                    break;
                }
            }
        }
    });

    let writer_task = tokio::spawn(async move {
        while let Some(env) = outbox_rx.recv().await {
            if let Packet::Hangup = env.packet {
                break;
            }
            if let Err(e) = write_frame(&mut writer, &env.packet).await {
                warn!(peer, error = %e, "error writing to connection");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    (outbox_tx, writer_task)
}

pub(crate) async fn write_frame<W>(writer: &mut W, packet: &Packet) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (kind, payload): (u8, &[u8]) = match packet {
        Packet::Message(bytes) => (KIND_MESSAGE, bytes.as_ref()),
        Packet::Barrier => (KIND_BARRIER, &[][..]),
        Packet::Hangup => return Ok(()),
    };
    let len = u32::try_from(payload.len() + 1)
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;

    writer.write_u32(len).await?;
    writer.write_u8(kind).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len == 0 || len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }

    let kind = reader.read_u8().await?;
    let mut payload = vec![0u8; (len - 1) as usize];
    reader.read_exact(&mut payload).await?;

    match kind {
        KIND_MESSAGE => Ok(Some(Packet::Message(Bytes::from(payload)))),
        KIND_BARRIER => Ok(Some(Packet::Barrier)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame kind {other}"),
        )),
    }
}
