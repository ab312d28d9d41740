//! Multi-line log reassembly.
//!
//! Journal entries whose message starts with whitespace are continuations of
//! the previous line from the same source (stack traces, indented blocks).
//! The reassembler holds at most one pending event per `logBufferingType`
//! and publishes it when a fresh line for the same key arrives or when the
//! slot has been idle for the flush interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info};

use crate::event::{self, Event};
use crate::metrics::Registry;
use crate::publish::PublisherBank;

/// A pending event awaiting possible continuation lines.
struct LogBuffer {
    time: Instant,
    event: Event,
    log_type: String,
}

/// Owns the pending table; runs as a single task between the event channel
/// and the publisher bank.
pub struct Reassembler {
    pending: HashMap<String, LogBuffer>,
    bank: Arc<PublisherBank>,
    cursor_tx: Option<mpsc::Sender<String>>,
    registry: Option<Arc<Registry>>,
    flush_interval: Duration,
}

impl Reassembler {
    pub fn new(
        bank: Arc<PublisherBank>,
        cursor_tx: Option<mpsc::Sender<String>>,
        registry: Option<Arc<Registry>>,
        flush_interval: Duration,
    ) -> Self {
        Reassembler {
            pending: HashMap::new(),
            bank,
            cursor_tx,
            registry,
            flush_interval,
        }
    }

    /// Consume events until the channel closes, then flush every pending
    /// slot. Dropping the cursor sender on return is what lets the
    /// checkpointer write its final state.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        info!("log reassembly started");
        let mut ticker = time::interval(self.flush_interval);
        // The first tick completes immediately; consume it so the first
        // stale-slot scan happens after one full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => self.buffer_or_flush(event).await,
                    None => {
                        self.flush_all().await;
                        info!("event channel closed, reassembly drained");
                        return;
                    }
                },
                _ = ticker.tick() => self.flush_stale().await,
            }
        }
    }

    /// Handle one incoming event.
    ///
    /// A continuation (message starting with space or tab) is appended to
    /// the pending slot for its key; the slot's cursor stays that of the
    /// first line. A fresh line replaces the slot and publishes the evicted
    /// event.
    async fn buffer_or_flush(&mut self, event: Event) {
        let log_type = event::buffering_type(&event).to_string();
        let message = event::message(&event);
        let is_continuation = matches!(message.as_bytes().first(), Some(b' ') | Some(b'\t'));

        if is_continuation {
            if let Some(slot) = self.pending.get_mut(&log_type) {
                let joined = format!("{}\n{}", event::message(&slot.event), message);
                slot.event
                    .insert("message".to_string(), Value::String(joined));
                slot.time = Instant::now();
            } else {
                // No predecessor to attach to: the continuation starts a
                // new slot.
                self.pending.insert(
                    log_type.clone(),
                    LogBuffer {
                        time: Instant::now(),
                        event,
                        log_type,
                    },
                );
            }
            return;
        }

        let utc_timestamp = event::utc_timestamp(&event);
        let evicted = self.pending.insert(
            log_type.clone(),
            LogBuffer {
                time: Instant::now(),
                event,
                log_type,
            },
        );
        if let Some(old) = evicted {
            self.publish(old).await;
            if let Some(registry) = &self.registry {
                registry.record_publish(utc_timestamp);
            }
        }
    }

    /// Publish and remove every slot idle for at least the flush interval.
    async fn flush_stale(&mut self) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.time) >= self.flush_interval)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            if let Some(slot) = self.pending.remove(&key) {
                debug!(log_type = %slot.log_type, "flushing stale log buffer");
                self.publish(slot).await;
            }
        }
    }

    async fn flush_all(&mut self) {
        let drained: Vec<LogBuffer> = self.pending.drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            self.publish(slot).await;
        }
    }

    async fn publish(&self, slot: LogBuffer) {
        self.bank.publish(&slot.event).await;
        Self::send_cursor(&self.cursor_tx, &slot.event).await;
    }

    async fn send_cursor(cursor_tx: &Option<mpsc::Sender<String>>, event: &Event) {
        let Some(tx) = cursor_tx else { return };
        let cursor = event::cursor(event);
        if !cursor.is_empty() {
            // A send error means the checkpointer is gone; nothing to do.
            let _ = tx.send(cursor.to_string()).await;
        }
    }
}


#[cfg(test)]
impl Reassembler {
    /// Flush everything as if every slot had exceeded the interval.
    async fn flush_stale_for_test(&mut self) {
        self.flush_interval = Duration::ZERO;
        self.flush_stale().await;
    }
}
