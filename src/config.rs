//! Shipper configuration: YAML file loading, defaults and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Default path of the cursor state file, relative to the working directory.
pub const DEFAULT_CURSOR_STATE_FILE: &str = ".journalbeat-cursor-state";

/// Where to position the journal read cursor at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Resume from the cursor persisted in the state file.
    Cursor,
    /// Start from the earliest retained entry.
    Head,
    /// Start just after the newest entry.
    Tail,
}

/// Fallback position when seeking to the persisted cursor fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFallback {
    /// Propagate the seek failure and abort startup.
    None,
    Head,
    Tail,
}

/// Errors rejected by [`Config::validate`] or the file loader.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("metrics are enabled but neither wavefront_collector nor influxdb_url is set")]
    NoMetricsEndpoint,

    #[error("wrong location for the journal metadata: {0:?}")]
    InvalidMetadataLocation(String),

    #[error("invalid seek position: {0:?} (expected cursor, head or tail)")]
    InvalidSeekPosition(String),

    #[error("invalid cursor seek fallback position: {0:?} (expected none, head or tail)")]
    InvalidSeekFallback(String),
}

/// Downstream aggregator connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Downstream host addresses (`host:port`). One partitioned sink client
    /// is started per entry.
    pub hosts: Vec<String>,
}

/// Configuration for the journal shipper.
///
/// All durations are humantime strings in the YAML file (`"5s"`, `"100ms"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// One of `cursor`, `head`, `tail`.
    pub seek_position: String,
    /// One of `none`, `head`, `tail`; used when seeking to the persisted
    /// cursor fails.
    pub cursor_seek_fallback: String,
    /// Enable the cursor checkpointer.
    pub write_cursor_state: bool,
    /// Path of the cursor state file.
    pub cursor_state_file: PathBuf,
    /// How often the checkpointer persists the current cursor.
    #[serde(with = "humantime_serde")]
    pub cursor_flush_period: Duration,
    /// Emit all-digit field values as integers.
    pub convert_to_numbers: bool,
    /// Replace non-alphanumeric characters in field names and strip leading
    /// underscores.
    pub clean_field_names: bool,
    /// Dot-separated sub-path under which non-common journal fields are
    /// relocated. Empty disables the move.
    pub move_metadata_to_field: String,
    /// Value of the `input_type` key on every event.
    pub default_type: String,
    /// Systemd unit filters; empty means no filtering.
    pub units: Vec<String>,
    /// Inactivity timeout of the multi-line reassembly buffer.
    #[serde(with = "humantime_serde")]
    pub flush_log_interval: Duration,

    pub enable_metrics: bool,
    #[serde(with = "humantime_serde")]
    pub emit_metrics_interval: Duration,
    /// Wavefront collector `host:port`; empty disables the reporter.
    pub wavefront_collector: String,
    /// Extra point tags added to every Wavefront line.
    pub wavefront_tags: BTreeMap<String, String>,
    /// InfluxDB base URL; empty disables the reporter.
    pub influxdb_url: String,
    pub influxdb_db: String,

    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            seek_position: "tail".to_string(),
            cursor_seek_fallback: "tail".to_string(),
            write_cursor_state: false,
            cursor_state_file: PathBuf::from(DEFAULT_CURSOR_STATE_FILE),
            cursor_flush_period: Duration::from_secs(5),
            convert_to_numbers: false,
            clean_field_names: false,
            move_metadata_to_field: String::new(),
            default_type: "journal".to_string(),
            units: Vec::new(),
            flush_log_interval: Duration::from_secs(30),
            enable_metrics: false,
            emit_metrics_interval: Duration::from_secs(10),
            wavefront_collector: String::new(),
            wavefront_tags: BTreeMap::new(),
            influxdb_url: String::new(),
            influxdb_db: String::new(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject configurations the pipeline cannot run with.
    ///
    /// Rules: metrics enabled without a collector endpoint, a metadata
    /// location containing empty path segments, and unknown seek or fallback
    /// positions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_metrics && self.wavefront_collector.is_empty() && self.influxdb_url.is_empty()
        {
            return Err(ConfigError::NoMetricsEndpoint);
        }

        // Consecutive or trailing dots would create empty path segments.
        let extra_dots = Regex::new(r"\.{2,}|\.$").expect("static regex");
        if !self.move_metadata_to_field.is_empty()
            && extra_dots.is_match(&self.move_metadata_to_field)
        {
            return Err(ConfigError::InvalidMetadataLocation(
                self.move_metadata_to_field.clone(),
            ));
        }

        self.seek_position()?;
        self.cursor_seek_fallback()?;
        Ok(())
    }

    /// The configured seek position as a typed value.
    pub fn seek_position(&self) -> Result<SeekPosition, ConfigError> {
        match self.seek_position.as_str() {
            "cursor" => Ok(SeekPosition::Cursor),
            "head" => Ok(SeekPosition::Head),
            "tail" => Ok(SeekPosition::Tail),
            other => Err(ConfigError::InvalidSeekPosition(other.to_string())),
        }
    }

    /// The configured cursor seek fallback as a typed value.
    pub fn cursor_seek_fallback(&self) -> Result<SeekFallback, ConfigError> {
        match self.cursor_seek_fallback.as_str() {
            "none" => Ok(SeekFallback::None),
            "head" => Ok(SeekFallback::Head),
            "tail" => Ok(SeekFallback::Tail),
            other => Err(ConfigError::InvalidSeekFallback(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.seek_position().unwrap(), SeekPosition::Tail);
        assert_eq!(config.cursor_seek_fallback().unwrap(), SeekFallback::Tail);
        assert_eq!(config.cursor_flush_period, Duration::from_secs(5));
        assert_eq!(config.flush_log_interval, Duration::from_secs(30));
        assert_eq!(config.default_type, "journal");
        assert_eq!(
            config.cursor_state_file,
            PathBuf::from(DEFAULT_CURSOR_STATE_FILE)
        );
    }

    #[test]
    fn metrics_without_endpoint_is_rejected() {
        let config = Config {
            enable_metrics: true,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoMetricsEndpoint)
        ));

        let config = Config {
            enable_metrics: true,
            wavefront_collector: "wavefront:2878".to_string(),
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn metadata_location_rules() {
        for location in ["journal..", "journal.", "a..b"] {
            let config = Config {
                move_metadata_to_field: location.to_string(),
                ..Config::default()
            };
            assert!(
                matches!(
                    config.validate(),
                    Err(ConfigError::InvalidMetadataLocation(_))
                ),
                "expected {location:?} to be rejected"
            );
        }

        let config = Config {
            move_metadata_to_field: "journal.meta".to_string(),
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn unknown_seek_positions_are_rejected() {
        let config = Config {
            seek_position: "middle".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSeekPosition(_))
        ));

        let config = Config {
            cursor_seek_fallback: "middle".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSeekFallback(_))
        ));
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
seek_position: cursor
cursor_seek_fallback: head
write_cursor_state: true
cursor_flush_period: 2s
flush_log_interval: 100ms
units:
  - docker.service
output:
  hosts:
    - logstash-1:5044
    - logstash-2:5044
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.seek_position().unwrap(), SeekPosition::Cursor);
        assert_eq!(config.cursor_seek_fallback().unwrap(), SeekFallback::Head);
        assert!(config.write_cursor_state);
        assert_eq!(config.cursor_flush_period, Duration::from_secs(2));
        assert_eq!(config.flush_log_interval, Duration::from_millis(100));
        assert_eq!(config.units, vec!["docker.service".to_string()]);
        assert_eq!(config.output.hosts.len(), 2);
    }
}
