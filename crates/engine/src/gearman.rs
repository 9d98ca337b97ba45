//! Minimal Gearman wire-protocol client.
//!
//! Implements just the worker and submitter halves the engine needs:
//! `CAN_DO` registration, the `GRAB_JOB`/`NO_JOB`/`PRE_SLEEP`/`NOOP` poll
//! cycle, `WORK_COMPLETE`/`WORK_FAIL` completion, and background job
//! submission via `SUBMIT_JOB_BG`. Packets are the protocol's binary
//! framing: a 4-byte magic, a big-endian packet type and a big-endian
//! data length, with NUL-separated arguments.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::broker::{Broker, BrokerError, Connection, Delivery};

const MAGIC_REQ: &[u8; 4] = b"\0REQ";
const MAGIC_RES: &[u8; 4] = b"\0RES";

const CAN_DO: u32 = 1;
const PRE_SLEEP: u32 = 4;
const NOOP: u32 = 6;
const JOB_CREATED: u32 = 8;
const GRAB_JOB: u32 = 9;
const NO_JOB: u32 = 10;
const JOB_ASSIGN: u32 = 11;
const WORK_COMPLETE: u32 = 13;
const WORK_FAIL: u32 = 14;
const SUBMIT_JOB_BG: u32 = 18;
const ERROR: u32 = 19;

// Queue payloads are small text blobs; anything bigger is a broken peer.
const MAX_PACKET_LEN: usize = 8 * 1024 * 1024;

fn packet(magic: &[u8; 4], kind: u32, args: &[&[u8]]) -> Vec<u8> {
    let data_len: usize = args.iter().map(|a| a.len()).sum::<usize>() + args.len().saturating_sub(1);
    let mut buf = Vec::with_capacity(12 + data_len);
    buf.extend_from_slice(magic);
    buf.extend_from_slice(&kind.to_be_bytes());
    buf.extend_from_slice(&(data_len as u32).to_be_bytes());
    for (idx, arg) in args.iter().enumerate() {
        if idx > 0 {
            buf.push(0);
        }
        buf.extend_from_slice(arg);
    }
    buf
}

/// Split packet data into `count` NUL-separated arguments; the last
/// argument keeps any embedded NULs.
fn split_args(data: &[u8], count: usize) -> Result<Vec<Vec<u8>>, BrokerError> {
    let mut args = Vec::with_capacity(count);
    let mut rest = data;
    for _ in 0..count.saturating_sub(1) {
        let pos = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| BrokerError::Protocol("missing argument separator".to_string()))?;
        args.push(rest[..pos].to_vec());
        rest = &rest[pos + 1..];
    }
    args.push(rest.to_vec());
    Ok(args)
}

async fn write_packet(
    stream: &mut TcpStream,
    magic: &[u8; 4],
    kind: u32,
    args: &[&[u8]],
) -> Result<(), BrokerError> {
    stream.write_all(&packet(magic, kind, args)).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_packet(stream: &mut TcpStream, magic: &[u8; 4]) -> Result<(u32, Vec<u8>), BrokerError> {
    let mut header = [0u8; 12];
    stream.read_exact(&mut header).await?;
    if &header[..4] != magic {
        return Err(BrokerError::Protocol(format!("bad packet magic: {:?}", &header[..4])));
    }
    let kind = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if len > MAX_PACKET_LEN {
        return Err(BrokerError::Protocol(format!("oversized packet: {len} bytes")));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok((kind, data))
}

/// Connection factory for a set of gearmand endpoints.
///
/// Every `connect` starts at the next endpoint in the list, so retries
/// and multiple workers spread round-robin across the configured servers.
#[derive(Clone)]
pub struct GearmanBroker {
    servers: Arc<Vec<String>>,
    next: Arc<AtomicUsize>,
}

impl GearmanBroker {
    /// Build a factory over `host:port` endpoints, tried in order.
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: Arc::new(servers),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Broker for GearmanBroker {
    type Conn = GearmanConnection;

    async fn connect(&self) -> Result<Self::Conn, BrokerError> {
        if self.servers.is_empty() {
            return Err(BrokerError::Unavailable("no servers configured".to_string()));
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_err = String::new();
        for offset in 0..self.servers.len() {
            let server = &self.servers[(start + offset) % self.servers.len()];
            match TcpStream::connect(server.as_str()).await {
                Ok(stream) => {
                    return Ok(GearmanConnection { stream });
                }
                Err(err) => last_err = format!("{server}: {err}"),
            }
        }
        Err(BrokerError::Unavailable(last_err))
    }
}

/// An established connection to one gearmand.
pub struct GearmanConnection {
    stream: TcpStream,
}

impl GearmanConnection {
    /// Read packets until the submitted background job is confirmed.
    async fn await_job_created(&mut self) -> Result<(), BrokerError> {
        loop {
            let (kind, data) = read_packet(&mut self.stream, MAGIC_RES).await?;
            match kind {
                JOB_CREATED => return Ok(()),
                // A wakeup for queued work can interleave with submission.
                NOOP => continue,
                ERROR => return Err(protocol_error(&data)),
                other => {
                    return Err(BrokerError::Protocol(format!("unexpected packet {other} while submitting")));
                }
            }
        }
    }
}

fn protocol_error(data: &[u8]) -> BrokerError {
    BrokerError::Protocol(String::from_utf8_lossy(data).replace('\0', ": "))
}

#[async_trait]
impl Connection for GearmanConnection {
    async fn subscribe(&mut self, queue: &str, _priority: u32) -> Result<(), BrokerError> {
        // gearmand polls functions in registration order; callers register
        // high-priority queues first, which is as strong as the protocol gets.
        write_packet(&mut self.stream, MAGIC_REQ, CAN_DO, &[queue.as_bytes()]).await
    }

    async fn receive(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            write_packet(&mut self.stream, MAGIC_REQ, GRAB_JOB, &[]).await?;
            let (kind, data) = read_packet(&mut self.stream, MAGIC_RES).await?;
            match kind {
                JOB_ASSIGN => {
                    let mut args = split_args(&data, 3)?;
                    let payload = args.pop().unwrap_or_default();
                    let queue = args.pop().unwrap_or_default();
                    let handle = args.pop().unwrap_or_default();
                    return Ok(Delivery {
                        queue: String::from_utf8_lossy(&queue).into_owned(),
                        payload,
                        tag: String::from_utf8_lossy(&handle).into_owned(),
                    });
                }
                NO_JOB => {
                    write_packet(&mut self.stream, MAGIC_REQ, PRE_SLEEP, &[]).await?;
                    loop {
                        let (kind, data) = read_packet(&mut self.stream, MAGIC_RES).await?;
                        match kind {
                            NOOP => break,
                            ERROR => return Err(protocol_error(&data)),
                            _ => continue,
                        }
                    }
                }
                NOOP => continue,
                ERROR => return Err(protocol_error(&data)),
                other => {
                    return Err(BrokerError::Protocol(format!("unexpected packet {other} while polling")));
                }
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        write_packet(
            &mut self.stream,
            MAGIC_REQ,
            WORK_COMPLETE,
            &[delivery.tag.as_bytes(), b""],
        )
        .await
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        write_packet(&mut self.stream, MAGIC_REQ, WORK_FAIL, &[delivery.tag.as_bytes()]).await
    }

    async fn submit(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        write_packet(
            &mut self.stream,
            MAGIC_REQ,
            SUBMIT_JOB_BG,
            &[queue.as_bytes(), b"", payload],
        )
        .await?;
        self.await_job_created().await
    }
}
