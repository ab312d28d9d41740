//! Partitioned publication to a bank of downstream sink clients.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::Event;

/// Delay between reconnect attempts of a guaranteed publish.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to connect to any downstream host of {hosts:?}: {source}")]
    Connect {
        hosts: Vec<String>,
        source: io::Error,
    },
}

/// 32-bit FNV-1a over the raw bytes of a partition key.
///
/// Hand-rolled so the partition mapping stays stable across toolchains and
/// restarts.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}

/// The partition key of an event: first present of `container_tag`,
/// `logBufferingType`, `type`.
///
/// Hashing a stable logical identity (container or process) keeps all events
/// of one source on one downstream connection, so per-source ordering
/// survives on the aggregator side.
pub fn partition_key(event: &Event) -> Option<&str> {
    ["container_tag", "logBufferingType", "type"]
        .into_iter()
        .find_map(|key| event.get(key).and_then(Value::as_str))
}

/// The partition index of an event within a bank of `partitions` clients.
/// Events without any key field go to partition 0.
pub fn partition(event: &Event, partitions: usize) -> usize {
    partition_key(event).map_or(0, |key| fnv1a_32(key.as_bytes()) as usize % partitions)
}

/// Circular shift of the downstream host list by `shift` positions.
///
/// Client `i` of the bank receives the list shifted by `i`, making host `i`
/// its primary destination and the rest its failover order.
pub fn shift_hosts(hosts: &[String], shift: usize) -> Vec<String> {
    let shift = shift % hosts.len().max(1);
    hosts[shift..]
        .iter()
        .chain(hosts[..shift].iter())
        .cloned()
        .collect()
}

/// A downstream sink client.
///
/// `publish` with `guaranteed` set retries internally until the event is
/// accepted or the sink is closed; the caller treats the handover as
/// successful and never observes per-event acknowledgements.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &Event, guaranteed: bool);
    async fn close(&self);
}

/// An ordered bank of sink clients indexed by the partition function.
pub struct PublisherBank {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl PublisherBank {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        PublisherBank { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Route the event to its partition's client with guaranteed delivery.
    pub async fn publish(&self, event: &Event) {
        let index = partition(event, self.sinks.len());
        self.sinks[index].publish(event, true).await;
    }

    pub async fn close_all(&self) {
        for sink in &self.sinks {
            sink.close().await;
        }
    }
}

/// Connect one sink client per configured host, each wired to the host list
/// circularly shifted by its own index.
pub async fn connect_bank(hosts: &[String]) -> Result<PublisherBank, SinkError> {
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::with_capacity(hosts.len());
    for i in 0..hosts.len() {
        let sink = TcpJsonSink::connect(shift_hosts(hosts, i)).await?;
        sinks.push(Arc::new(sink));
    }
    Ok(PublisherBank::new(sinks))
}

/// Sink client writing newline-delimited JSON over TCP.
///
/// Holds one connection to the first reachable host of its list; on write
/// failure it reconnects, trying the hosts in order.
pub struct TcpJsonSink {
    hosts: Vec<String>,
    conn: Mutex<Option<TcpStream>>,
    closed: CancellationToken,
}

impl TcpJsonSink {
    /// Connect to the first reachable host. Fails when no host accepts a
    /// connection.
    pub async fn connect(hosts: Vec<String>) -> Result<Self, SinkError> {
        let stream = Self::connect_any(&hosts).await.map_err(|source| {
            SinkError::Connect {
                hosts: hosts.clone(),
                source,
            }
        })?;
        Ok(TcpJsonSink {
            hosts,
            conn: Mutex::new(Some(stream)),
            closed: CancellationToken::new(),
        })
    }

    async fn connect_any(hosts: &[String]) -> io::Result<TcpStream> {
        let mut last_error = io::Error::new(io::ErrorKind::NotConnected, "no hosts configured");
        for host in hosts {
            match TcpStream::connect(host).await {
                Ok(stream) => {
                    info!(host, "connected to downstream aggregator");
                    return Ok(stream);
                }
                Err(err) => {
                    warn!(host, error = %err, "downstream connect failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Self::connect_any(&self.hosts).await?);
        }
        let stream = guard.as_mut().expect("connection was just established");
        match stream.write_all(line).await {
            Ok(()) => Ok(()),
            Err(err) => {
                *guard = None;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl EventSink for TcpJsonSink {
    async fn publish(&self, event: &Event, guaranteed: bool) {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "dropping unserializable event");
                return;
            }
        };
        line.push(b'\n');

        loop {
            if self.closed.is_cancelled() {
                debug!("sink closed, dropping event");
                return;
            }
            match self.write_line(&line).await {
                Ok(()) => return,
                Err(err) if guaranteed => {
                    warn!(error = %err, "publish failed, retrying");
                    tokio::select! {
                        _ = self.closed.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "publish failed, dropping event");
                    return;
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        let mut guard = self.conn.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
        }
    }
}
