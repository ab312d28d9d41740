//! Durable cursor checkpointing.
//!
//! The checkpointer owns the in-memory cursor and the state file. Cursors
//! arrive in publication order; receipt only updates memory, and the ticker
//! decides when disk is touched. The coalescing is deliberate — it bounds
//! disk writes regardless of the publish rate.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info};

/// Read the persisted cursor. An empty file yields an error, matching a
/// missing one: there is nothing to resume from.
pub fn read_state(path: &Path) -> io::Result<String> {
    let cursor = fs::read_to_string(path)?;
    let cursor = cursor.trim_end_matches('\n').to_string();
    if cursor.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "cursor state file is empty",
        ));
    }
    Ok(cursor)
}

/// Atomically replace the state file with the given cursor, mode 0644.
pub fn write_state(path: &Path, cursor: &str) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, cursor)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
    fs::rename(&tmp, path)
}

/// Persists the most recently published cursor.
pub struct Checkpointer {
    path: PathBuf,
    flush_period: Duration,
}

impl Checkpointer {
    pub fn new(path: PathBuf, flush_period: Duration) -> Self {
        Checkpointer { path, flush_period }
    }

    /// Consume cursors until the channel closes, persisting on ticks.
    ///
    /// A tick writes only when the value is non-empty and changed since the
    /// last successful write. Channel close triggers one final write — the
    /// only guarantee that the last published cursor survives a stop. Write
    /// errors are logged and the value is retained for the next attempt.
    pub async fn run(self, mut rx: mpsc::Receiver<String>) {
        info!(path = %self.path.display(), "cursor checkpointer started");
        let mut cursor = String::new();
        let mut written = String::new();
        let mut ticker = time::interval(self.flush_period);
        ticker.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(value) => cursor = value,
                    None => break,
                },
                _ = ticker.tick() => {
                    if !cursor.is_empty() && cursor != written {
                        match write_state(&self.path, &cursor) {
                            Ok(()) => {
                                debug!(cursor = %cursor, "cursor state persisted");
                                written = cursor.clone();
                            }
                            Err(err) => {
                                error!(error = %err, "could not write cursor state file");
                            }
                        }
                    }
                }
            }
        }

        if !cursor.is_empty() {
            if let Err(err) = write_state(&self.path, &cursor) {
                error!(error = %err, "could not write final cursor state");
            } else {
                info!(cursor = %cursor, "final cursor state persisted");
            }
        }
    }
}
