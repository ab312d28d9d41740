//! Journal source adapter: unit filters, cursor placement and the follow
//! loop feeding the pipeline.

use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::config::{SeekFallback, SeekPosition};
use crate::event::{self, Event, NormalizeOptions, RawEntry};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("failed to open journal source: {0}")]
    Open(#[source] io::Error),

    #[error("failed to apply unit filter {unit:?}: {reason}")]
    Filter { unit: String, reason: String },

    #[error("seek to {target} failed: {reason}")]
    Seek { target: String, reason: String },

    #[error("could not position at the persisted cursor and cursor_seek_fallback is \"none\"")]
    NoSeekFallback,

    #[error("journal read error: {0}")]
    Read(#[source] io::Error),
}

/// Where to position the source before following.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekTarget {
    Head,
    Tail,
    Cursor(String),
}

/// An opaque cursor-based journal reader.
///
/// Unit filters are disjunctive exact matches on the systemd unit field and
/// must be applied before the first [`next_entry`](JournalSource::next_entry)
/// call, as must the seek. `next_entry` returns `None` when the source ends.
#[async_trait]
pub trait JournalSource: Send {
    async fn add_unit_match(&mut self, unit: &str) -> Result<(), JournalError>;
    async fn seek(&mut self, target: SeekTarget) -> Result<(), JournalError>;
    async fn next_entry(&mut self) -> Result<Option<RawEntry>, JournalError>;
}

/// Journal source backed by a `journalctl --follow` subprocess emitting JSON.
///
/// The process is spawned lazily on the first read so that filters and the
/// seek target are settled by then. Address fields (`__CURSOR`,
/// `__REALTIME_TIMESTAMP`) become the entry's cursor and arrival timestamp;
/// the remaining string-valued fields are carried as-is (non-string payloads,
/// e.g. binary blobs rendered as arrays, are skipped).
#[derive(Default)]
pub struct JournalctlSource {
    units: Vec<String>,
    target: Option<SeekTarget>,
    // Held so the subprocess is killed when the source is dropped.
    #[allow(dead_code)]
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

impl JournalctlSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(&mut self) -> Result<(), JournalError> {
        let mut command = Command::new("journalctl");
        command.args(["--output", "json", "--follow", "--no-pager"]);
        for unit in &self.units {
            command.args(["--unit", unit]);
        }
        match &self.target {
            Some(SeekTarget::Tail) => {
                command.args(["--lines", "0"]);
            }
            Some(SeekTarget::Cursor(cursor)) => {
                command.args(["--after-cursor", cursor, "--lines", "all"]);
            }
            Some(SeekTarget::Head) | None => {
                command.args(["--lines", "all"]);
            }
        }
        command.stdout(Stdio::piped());
        command.stdin(Stdio::null());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(JournalError::Open)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            JournalError::Open(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "journalctl stdout was not captured",
            ))
        })?;
        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        info!(units = ?self.units, "journal source opened");
        Ok(())
    }

    fn parse_entry(line: &str) -> Option<RawEntry> {
        let object: serde_json::Map<String, Value> = serde_json::from_str(line).ok()?;
        let cursor = object.get("__CURSOR")?.as_str()?.to_string();
        let realtime_usec = match object.get("__REALTIME_TIMESTAMP") {
            Some(Value::String(s)) => s.parse().ok()?,
            Some(Value::Number(n)) => n.as_u64()?,
            _ => return None,
        };

        let mut entry = RawEntry {
            cursor,
            realtime_usec,
            ..RawEntry::default()
        };
        for (key, value) in object {
            if key.starts_with("__") {
                continue;
            }
            if let Value::String(value) = value {
                entry.fields.insert(key, value);
            }
        }
        Some(entry)
    }
}

#[async_trait]
impl JournalSource for JournalctlSource {
    async fn add_unit_match(&mut self, unit: &str) -> Result<(), JournalError> {
        if unit.is_empty() {
            return Err(JournalError::Filter {
                unit: unit.to_string(),
                reason: "empty unit name".to_string(),
            });
        }
        self.units.push(unit.to_string());
        Ok(())
    }

    async fn seek(&mut self, target: SeekTarget) -> Result<(), JournalError> {
        if let SeekTarget::Cursor(cursor) = &target {
            if cursor.is_empty() {
                return Err(JournalError::Seek {
                    target: "cursor".to_string(),
                    reason: "empty cursor".to_string(),
                });
            }
        }
        self.target = Some(target);
        Ok(())
    }

    async fn next_entry(&mut self) -> Result<Option<RawEntry>, JournalError> {
        if self.lines.is_none() {
            self.spawn()?;
        }
        let lines = self.lines.as_mut().expect("reader was just created");

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match Self::parse_entry(&line) {
                    Some(entry) => return Ok(Some(entry)),
                    None => {
                        debug!("skipping unparseable journal line");
                    }
                },
                Ok(None) => return Ok(None),
                Err(err) => return Err(JournalError::Read(err)),
            }
        }
    }
}

/// The journal reader: a positioned source plus the follow loop.
pub struct Reader<S: JournalSource> {
    source: S,
}

impl<S: JournalSource> Reader<S> {
    /// Apply unit filters and position the source.
    ///
    /// With `seek_position = cursor`, the cursor is read from `state_file`;
    /// if reading it fails or the source rejects it, the fallback position
    /// is used instead — unless the fallback is `none`, which aborts.
    pub async fn open(
        mut source: S,
        units: &[String],
        seek: SeekPosition,
        fallback: SeekFallback,
        state_file: &Path,
    ) -> Result<Self, JournalError> {
        for unit in units {
            source.add_unit_match(unit).await?;
        }

        match seek {
            SeekPosition::Head => source.seek(SeekTarget::Head).await?,
            SeekPosition::Tail => source.seek(SeekTarget::Tail).await?,
            SeekPosition::Cursor => {
                let seeked = match checkpoint::read_state(state_file) {
                    Ok(cursor) => match source.seek(SeekTarget::Cursor(cursor)).await {
                        Ok(()) => {
                            info!("seek to cursor successful");
                            true
                        }
                        Err(err) => {
                            warn!(error = %err, "could not seek to cursor");
                            false
                        }
                    },
                    Err(err) => {
                        warn!(
                            error = %err,
                            "could not seek to cursor: reading cursor state file failed"
                        );
                        false
                    }
                };
                if !seeked {
                    match fallback {
                        SeekFallback::None => return Err(JournalError::NoSeekFallback),
                        SeekFallback::Head => {
                            info!("falling back to seek position head");
                            source.seek(SeekTarget::Head).await?;
                        }
                        SeekFallback::Tail => {
                            info!("falling back to seek position tail");
                            source.seek(SeekTarget::Tail).await?;
                        }
                    }
                }
            }
        }

        Ok(Reader { source })
    }

    /// Follow the journal until the stop signal fires or the source ends,
    /// normalizing each entry and sending it downstream.
    ///
    /// Dropping `tx` on return starts the forward drain of the pipeline.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<Event>,
        opts: NormalizeOptions,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("stop signal received, journal reader closing");
                    return;
                }
                entry = self.source.next_entry() => match entry {
                    Ok(Some(raw)) => {
                        let event = event::normalize(&raw, &opts);
                        if tx.send(event).await.is_err() {
                            warn!("event channel closed, journal reader stopping");
                            return;
                        }
                    }
                    Ok(None) => {
                        info!("journal stream ended");
                        return;
                    }
                    Err(err) => {
                        warn!(error = %err, "journal read failed, closing stream");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use tempfile::TempDir;

    /// In-memory journal source replaying a fixed entry sequence.
    #[derive(Default)]
    pub(crate) struct MockSource {
        entries: VecDeque<RawEntry>,
        accepted_cursors: Vec<String>,
        pub(crate) units: Vec<String>,
        pub(crate) seeked: Option<SeekTarget>,
    }

    impl MockSource {
        pub(crate) fn with_entries(entries: Vec<RawEntry>) -> Self {
            MockSource {
                entries: entries.into(),
                ..MockSource::default()
            }
        }

        fn accepting(mut self, cursor: &str) -> Self {
            self.accepted_cursors.push(cursor.to_string());
            self
        }
    }

    #[async_trait]
    impl JournalSource for MockSource {
        async fn add_unit_match(&mut self, unit: &str) -> Result<(), JournalError> {
            self.units.push(unit.to_string());
            Ok(())
        }

        async fn seek(&mut self, target: SeekTarget) -> Result<(), JournalError> {
            if let SeekTarget::Cursor(cursor) = &target {
                if !self.accepted_cursors.contains(cursor) {
                    return Err(JournalError::Seek {
                        target: "cursor".to_string(),
                        reason: format!("unknown cursor {cursor:?}"),
                    });
                }
                // Resume just after the persisted cursor.
                while let Some(entry) = self.entries.front() {
                    let passed = entry.cursor == *cursor;
                    self.entries.pop_front();
                    if passed {
                        break;
                    }
                }
            }
            self.seeked = Some(target);
            Ok(())
        }

        async fn next_entry(&mut self) -> Result<Option<RawEntry>, JournalError> {
            Ok(self.entries.pop_front())
        }
    }

    fn entry(cursor: &str, message: &str) -> RawEntry {
        RawEntry {
            cursor: cursor.to_string(),
            realtime_usec: 1_700_000_000_000_000,
            fields: BTreeMap::from([
                ("MESSAGE".to_string(), message.to_string()),
                ("SYSLOG_IDENTIFIER".to_string(), "svc".to_string()),
                ("_PID".to_string(), "7".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn cursor_resume_continues_after_the_persisted_entry() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        checkpoint::write_state(&state, "s=123").unwrap();

        let source = MockSource::with_entries(vec![
            entry("s=122", "old"),
            entry("s=123", "persisted"),
            entry("s=124", "new"),
        ])
        .accepting("s=123");

        let reader = Reader::open(
            source,
            &[],
            SeekPosition::Cursor,
            SeekFallback::None,
            &state,
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        reader
            .run(tx, NormalizeOptions::default(), CancellationToken::new())
            .await;

        let first = rx.recv().await.unwrap();
        assert_eq!(event::message(&first), "new");
        assert_eq!(event::cursor(&first), "s=124");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn missing_state_file_falls_back_to_head() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("missing");

        let source = MockSource::with_entries(vec![entry("s=1", "first")]);
        let reader = Reader::open(
            source,
            &[],
            SeekPosition::Cursor,
            SeekFallback::Head,
            &state,
        )
        .await
        .unwrap();
        assert_eq!(reader.source.seeked, Some(SeekTarget::Head));
    }

    #[tokio::test]
    async fn rejected_cursor_falls_back() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        checkpoint::write_state(&state, "s=999").unwrap();

        let source = MockSource::with_entries(vec![entry("s=1", "first")]);
        let reader = Reader::open(
            source,
            &[],
            SeekPosition::Cursor,
            SeekFallback::Tail,
            &state,
        )
        .await
        .unwrap();
        assert_eq!(reader.source.seeked, Some(SeekTarget::Tail));
    }

    #[tokio::test]
    async fn fallback_none_aborts_startup() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("missing");

        let source = MockSource::default();
        let result = Reader::open(
            source,
            &[],
            SeekPosition::Cursor,
            SeekFallback::None,
            &state,
        )
        .await;
        assert!(matches!(result, Err(JournalError::NoSeekFallback)));
    }

    #[tokio::test]
    async fn unit_filters_are_applied_before_seeking() {
        let dir = TempDir::new().unwrap();
        let source = MockSource::default();
        let units = vec!["docker.service".to_string(), "sshd.service".to_string()];

        let reader = Reader::open(
            source,
            &units,
            SeekPosition::Head,
            SeekFallback::None,
            &dir.path().join("state"),
        )
        .await
        .unwrap();
        assert_eq!(reader.source.units, units);
        assert_eq!(reader.source.seeked, Some(SeekTarget::Head));
    }

    #[tokio::test]
    async fn stop_signal_closes_the_stream() {
        let source = MockSource::with_entries(vec![entry("s=1", "first")]);
        let reader = Reader { source };
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        reader
            .run(tx, NormalizeOptions::default(), shutdown)
            .await;
        // Sender dropped without publishing anything.
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn journalctl_json_lines_are_parsed() {
        let line = r#"{"__CURSOR":"s=abc;i=1","__REALTIME_TIMESTAMP":"1700000000000000","__MONOTONIC_TIMESTAMP":"123","MESSAGE":"hello","PRIORITY":"6","_PID":"42","_BINARY":[1,2,3]}"#;
        let entry = JournalctlSource::parse_entry(line).unwrap();
        assert_eq!(entry.cursor, "s=abc;i=1");
        assert_eq!(entry.realtime_usec, 1_700_000_000_000_000);
        assert_eq!(entry.fields["MESSAGE"], "hello");
        assert_eq!(entry.fields["PRIORITY"], "6");
        assert_eq!(entry.fields["_PID"], "42");
        assert!(!entry.fields.contains_key("__MONOTONIC_TIMESTAMP"));
        assert!(!entry.fields.contains_key("_BINARY"));

        assert!(JournalctlSource::parse_entry("not json").is_none());
        assert!(JournalctlSource::parse_entry(r#"{"MESSAGE":"no cursor"}"#).is_none());
    }
}
