//! Shipper metrics: a small shared registry and periodic reporters for
//! Wavefront and InfluxDB.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prefix of every metric name on the wire.
pub const METRIC_PREFIX: &str = "logging.journalbeat";
pub const MESSAGES_PUBLISHED: &str = "MessagesPublished";
pub const MESSAGE_CONSUMPTION_DELAY: &str = "MessageConsumptionDelay";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics endpoint returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Counter of published events and gauge of observed consumption delay.
/// Updated by the reassembly task, read by the reporter tasks.
#[derive(Debug, Default)]
pub struct Registry {
    messages_published: AtomicU64,
    message_delay_secs: AtomicI64,
}

impl Registry {
    /// Record one published event and the observed delay against its
    /// origin timestamp (microseconds since epoch), in whole seconds.
    pub fn record_publish(&self, utc_timestamp_usec: i64) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.message_delay_secs
            .store(unix_now_secs() - utc_timestamp_usec / 1_000_000, Ordering::Relaxed);
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn message_delay_secs(&self) -> i64 {
        self.message_delay_secs.load(Ordering::Relaxed)
    }
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Point tags sent with every line: `source=<hostname>` plus the configured
/// tags.
pub fn host_tags(configured: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut tags = configured.clone();
    if let Ok(host) = hostname::get() {
        tags.insert("source".to_string(), host.to_string_lossy().into_owned());
    }
    tags
}

/// Emits the registry over the Wavefront TCP line protocol.
pub struct WavefrontReporter {
    addr: String,
    interval: Duration,
    tags: BTreeMap<String, String>,
    registry: Arc<Registry>,
}

impl WavefrontReporter {
    pub fn new(
        addr: String,
        interval: Duration,
        tags: BTreeMap<String, String>,
        registry: Arc<Registry>,
    ) -> Self {
        WavefrontReporter {
            addr,
            interval,
            tags,
            registry,
        }
    }

    /// One flush of the whole registry. Used as the boot-time probe and by
    /// the periodic loop.
    pub async fn emit_once(&self) -> Result<(), MetricsError> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(self.format_lines().as_bytes()).await?;
        stream.shutdown().await?;
        debug!(collector = %self.addr, "flushed metrics to wavefront");
        Ok(())
    }

    fn format_lines(&self) -> String {
        let timestamp = unix_now_secs();
        let tags: String = self
            .tags
            .iter()
            .map(|(key, value)| format!(" {key}=\"{value}\""))
            .collect();
        format!(
            "{prefix}.{counter} {} {timestamp}{tags}\n{prefix}.{gauge} {} {timestamp}{tags}\n",
            self.registry.messages_published(),
            self.registry.message_delay_secs(),
            prefix = METRIC_PREFIX,
            counter = MESSAGES_PUBLISHED,
            gauge = MESSAGE_CONSUMPTION_DELAY,
        )
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.emit_once().await {
                        warn!(error = %err, "wavefront metrics emission failed");
                    }
                }
            }
        }
    }
}

/// Emits the registry as InfluxDB line protocol over HTTP.
pub struct InfluxReporter {
    url: String,
    database: String,
    interval: Duration,
    registry: Arc<Registry>,
    client: reqwest::Client,
}

impl InfluxReporter {
    pub fn new(
        url: String,
        database: String,
        interval: Duration,
        registry: Arc<Registry>,
    ) -> Self {
        InfluxReporter {
            url,
            database,
            interval,
            registry,
            client: reqwest::Client::new(),
        }
    }

    pub async fn emit_once(&self) -> Result<(), MetricsError> {
        let timestamp_ns = unix_now_secs() * 1_000_000_000;
        let body = format!(
            "{prefix}.{counter} value={}i {timestamp_ns}\n{prefix}.{gauge} value={}i {timestamp_ns}\n",
            self.registry.messages_published(),
            self.registry.message_delay_secs(),
            prefix = METRIC_PREFIX,
            counter = MESSAGES_PUBLISHED,
            gauge = MESSAGE_CONSUMPTION_DELAY,
        );

        let url = format!("{}/write", self.url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .query(&[("db", self.database.as_str())])
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MetricsError::Status(response.status()));
        }
        debug!(url = %self.url, "flushed metrics to influxdb");
        Ok(())
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.emit_once().await {
                        warn!(error = %err, "influxdb metrics emission failed");
                    }
                }
            }
        }
    }
}
