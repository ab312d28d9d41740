use thiserror::Error;

use crate::config::ConfigError;
use crate::journal::JournalError;
use crate::publish::SinkError;

/// Errors that abort shipper startup.
#[derive(Debug, Error)]
pub enum ShipperError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("downstream sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A specialized Result type for shipper operations.
pub type Result<T> = std::result::Result<T, ShipperError>;
