// src/protocol/codec.rs

//! Binary encoding of [`Message`]s.
//!
//! Layout: one tag byte, then the variant's fields in declaration order.
//! Integers are fixed-width big-endian, strings and blobs carry a `u32`
//! length prefix, lists carry a `u32` element count.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ForwardedOutput, Message, Registration, TaskCommand, TaskResult};
use crate::errors::{ClusterError, Result};
use crate::types::Forward;

const TAG_SHUTDOWN: u8 = 1;
const TAG_COMMAND: u8 = 2;
const TAG_RESULT: u8 = 3;
const TAG_REGISTRATION: u8 = 4;
const TAG_HOSTRANK: u8 = 5;

pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    match msg {
        Message::Shutdown => buf.put_u8(TAG_SHUTDOWN),
        Message::Command(cmd) => {
            buf.put_u8(TAG_COMMAND);
            put_str(&mut buf, &cmd.name);
            put_str(&mut buf, &cmd.command);
            put_str(&mut buf, &cmd.opaque_id);
            buf.put_u32(cmd.memory);
            buf.put_u32(cmd.cpus);
            put_forwards(&mut buf, &cmd.pipe_forwards);
            put_forwards(&mut buf, &cmd.file_forwards);
            put_len(&mut buf, cmd.affinity.len());
            for cpu in &cmd.affinity {
                buf.put_u32(*cpu);
            }
        }
        Message::Result(res) => {
            buf.put_u8(TAG_RESULT);
            put_str(&mut buf, &res.name);
            buf.put_i32(res.exit_code);
            buf.put_f64(res.runtime);
            put_len(&mut buf, res.outputs.len());
            for out in &res.outputs {
                put_str(&mut buf, &out.dest);
                put_blob(&mut buf, &out.data);
            }
        }
        Message::Registration(reg) => {
            buf.put_u8(TAG_REGISTRATION);
            put_str(&mut buf, &reg.hostname);
            buf.put_u32(reg.memory);
            buf.put_u32(reg.cpus);
            buf.put_u32(reg.cores);
            buf.put_u32(reg.sockets);
        }
        Message::HostRank(rank) => {
            buf.put_u8(TAG_HOSTRANK);
            buf.put_u32(*rank);
        }
    }
    buf.freeze()
}

pub fn decode(mut buf: Bytes) -> Result<Message> {
    let tag = get_u8(&mut buf)?;
    let msg = match tag {
        TAG_SHUTDOWN => Message::Shutdown,
        TAG_COMMAND => {
            let name = get_str(&mut buf)?;
            let command = get_str(&mut buf)?;
            let opaque_id = get_str(&mut buf)?;
            let memory = get_u32(&mut buf)?;
            let cpus = get_u32(&mut buf)?;
            let pipe_forwards = get_forwards(&mut buf)?;
            let file_forwards = get_forwards(&mut buf)?;
            let count = get_u32(&mut buf)?;
            let mut affinity = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                affinity.push(get_u32(&mut buf)?);
            }
            Message::Command(TaskCommand {
                name,
                command,
                opaque_id,
                memory,
                cpus,
                pipe_forwards,
                file_forwards,
                affinity,
            })
        }
        TAG_RESULT => {
            let name = get_str(&mut buf)?;
            let exit_code = get_i32(&mut buf)?;
            let runtime = get_f64(&mut buf)?;
            let count = get_u32(&mut buf)?;
            let mut outputs = Vec::new();
            for _ in 0..count {
                let dest = get_str(&mut buf)?;
                let data = get_blob(&mut buf)?;
                outputs.push(ForwardedOutput { dest, data });
            }
            Message::Result(TaskResult {
                name,
                exit_code,
                runtime,
                outputs,
            })
        }
        TAG_REGISTRATION => Message::Registration(Registration {
            hostname: get_str(&mut buf)?,
            memory: get_u32(&mut buf)?,
            cpus: get_u32(&mut buf)?,
            cores: get_u32(&mut buf)?,
            sockets: get_u32(&mut buf)?,
        }),
        TAG_HOSTRANK => Message::HostRank(get_u32(&mut buf)?),
        other => {
            return Err(ClusterError::protocol(format!("unknown message tag {other}")));
        }
    };

    if buf.has_remaining() {
        return Err(ClusterError::protocol(format!(
            "{} message has {} trailing bytes",
            msg.kind(),
            buf.remaining()
        )));
    }
    Ok(msg)
}

fn put_len(buf: &mut BytesMut, len: usize) {
    // Field lengths beyond u32 cannot be produced by a workflow line.
    buf.put_u32(len as u32);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_blob(buf, s.as_bytes());
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    put_len(buf, data.len());
    buf.put_slice(data);
}

fn put_forwards(buf: &mut BytesMut, forwards: &[Forward]) {
    put_len(buf, forwards.len());
    for fwd in forwards {
        put_str(buf, &fwd.key);
        put_str(buf, &fwd.dest);
    }
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(ClusterError::protocol(format!(
            "truncated message: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_f64(buf: &mut Bytes) -> Result<f64> {
    need(buf, 8)?;
    Ok(buf.get_f64())
}

fn get_blob(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    let raw = get_blob(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| ClusterError::protocol(format!("invalid UTF-8 in string field: {e}")))
}

fn get_forwards(buf: &mut Bytes) -> Result<Vec<Forward>> {
    let count = get_u32(buf)?;
    let mut forwards = Vec::new();
    for _ in 0..count {
        let key = get_str(buf)?;
        let dest = get_str(buf)?;
        forwards.push(Forward { key, dest });
    }
    Ok(forwards)
}
