//! Journal log shipper: tails the systemd journal, reassembles multi-line
//! entries, partitions them across a bank of downstream aggregator
//! connections with at-least-once delivery, and checkpoints its read cursor
//! so restarts resume where they left off.

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod journal;
pub mod metrics;
pub mod publish;
pub mod shipper;

pub use config::{Config, ConfigError, SeekFallback, SeekPosition};
pub use error::{Result, ShipperError};
pub use event::{normalize, Event, NormalizeOptions, RawEntry};
pub use journal::{JournalError, JournalSource, Reader, SeekTarget};
pub use publish::{EventSink, PublisherBank, SinkError};
