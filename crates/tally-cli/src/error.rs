//! CLI error types.

use std::path::PathBuf;

use tally_metrics::{AggregationWindow, MetricsError};
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// The engine reported an error.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// Another run holds the window lock.
    #[error("window {window} is locked by another run ({})", path.display())]
    Locked {
        /// Locked window.
        window: AggregationWindow,
        /// Lock file path.
        path: PathBuf,
    },

    /// Another command holds the data directory.
    #[error(
        "data directory is locked by another command ({}); remove the file if no tally \
         process is running",
        path.display()
    )]
    DataLocked {
        /// Lock file path.
        path: PathBuf,
    },

    /// A flush was attempted on stores loaded without the data lock.
    #[error("stores were loaded read-only and cannot be flushed")]
    ReadOnly,

    /// One or more slots failed to process.
    #[error("{failed} {window} slot(s) failed to process; slot {slot}: {reason}")]
    RunFailed {
        /// Window processed.
        window: AggregationWindow,
        /// Number of failed slots.
        failed: usize,
        /// First failed slot.
        slot: i64,
        /// Error of the first failed slot.
        reason: String,
    },

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
