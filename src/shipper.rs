//! Lifecycle supervisor: wires the reader, reassembler, publisher bank,
//! checkpointer and metrics reporters together and drives orderly shutdown.

use std::process;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::Reassembler;
use crate::checkpoint::Checkpointer;
use crate::config::{Config, SeekPosition};
use crate::error::Result;
use crate::event::NormalizeOptions;
use crate::journal::{JournalctlSource, Reader};
use crate::metrics::{self, InfluxReporter, Registry, WavefrontReporter};
use crate::publish;

/// Capacity of the bounded event channel between the reader and the
/// reassembler.
const CHANNEL_SIZE: usize = 1000;

/// Run the shipper until the stop signal fires or the journal stream ends.
///
/// Startup order: position the journal reader (fatal on failure), connect
/// the partitioned sink bank, start the optional metrics reporters and
/// cursor checkpointer, start the reassembler, then consume the journal.
/// Shutdown drains forward: the reader drops the event sender, the
/// reassembler flushes its pending slots and drops the cursor sender, the
/// checkpointer writes its final state, and the sinks are closed.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    let seek = config.seek_position()?;
    let fallback = config.cursor_seek_fallback()?;

    if seek == SeekPosition::Cursor && !config.write_cursor_state {
        warn!(
            "seek_position is \"cursor\" but write_cursor_state is disabled; \
             no cursor will ever be persisted and every restart will fall back"
        );
    }

    let reader = Reader::open(
        JournalctlSource::new(),
        &config.units,
        seek,
        fallback,
        &config.cursor_state_file,
    )
    .await?;

    let hosts = &config.output.hosts;
    if hosts.is_empty() {
        error!("invalid configuration for sending contents to downstream aggregators");
        process::exit(101);
    }
    let bank = Arc::new(publish::connect_bank(hosts).await?);
    info!(partitions = bank.len(), "downstream publisher bank connected");

    let registry = start_metrics(&config, &shutdown).await;

    let (cursor_tx, checkpoint_task) = if config.write_cursor_state {
        let (tx, rx) = mpsc::channel(1);
        let checkpointer = Checkpointer::new(
            config.cursor_state_file.clone(),
            config.cursor_flush_period,
        );
        (Some(tx), Some(tokio::spawn(checkpointer.run(rx))))
    } else {
        (None, None)
    };

    let (event_tx, event_rx) = mpsc::channel(CHANNEL_SIZE);
    let reassembler = Reassembler::new(
        bank.clone(),
        cursor_tx,
        registry,
        config.flush_log_interval,
    );
    let reassembly_task = tokio::spawn(reassembler.run(event_rx));

    let opts = NormalizeOptions {
        clean_field_names: config.clean_field_names,
        convert_to_numbers: config.convert_to_numbers,
        move_metadata_location: config.move_metadata_to_field.clone(),
        default_type: config.default_type.clone(),
    };
    info!("journal shipper is running");
    reader.run(event_tx, opts, shutdown.clone()).await;

    // The reader dropped the event sender: wait for the drain to cascade.
    reassembly_task.await?;
    if let Some(task) = checkpoint_task {
        task.await?;
    }
    bank.close_all().await;
    info!("journal shipper stopped");
    Ok(())
}

/// Start the configured metrics reporters and return the shared registry,
/// or `None` when metrics are disabled.
async fn start_metrics(
    config: &Config,
    shutdown: &CancellationToken,
) -> Option<Arc<Registry>> {
    if !config.enable_metrics {
        return None;
    }

    let registry = Arc::new(Registry::default());

    if !config.wavefront_collector.is_empty() {
        info!(collector = %config.wavefront_collector, "wavefront metrics are enabled");
        let reporter = WavefrontReporter::new(
            config.wavefront_collector.clone(),
            config.emit_metrics_interval,
            metrics::host_tags(&config.wavefront_tags),
            registry.clone(),
        );
        // Boot-time probe; a failing collector is reported but not fatal.
        if let Err(err) = reporter.emit_once().await {
            error!(error = %err, "metrics collection for this host failed at boot time");
        }
        tokio::spawn(reporter.run(shutdown.clone()));
    }

    if !config.influxdb_url.is_empty() {
        info!(url = %config.influxdb_url, "influxdb metrics are enabled");
        let reporter = InfluxReporter::new(
            config.influxdb_url.clone(),
            config.influxdb_db.clone(),
            config.emit_metrics_interval,
            registry.clone(),
        );
        tokio::spawn(reporter.run(shutdown.clone()));
    }

    Some(registry)
}
