//! # tally-cli
//!
//! Command-line interface for the tally metrics engine.
//!
//! Provides commands for:
//! - Processing window slots and pending backlogs
//! - Pruning data past retention
//! - Inspecting per-window run state
//! - Recording samples
//! - Exporting Prometheus exposition text
//!
//! # Architecture
//!
//! Every invocation opens the data directory through a [`context::Context`].
//! Mutating commands take the directory's data lock before loading the
//! snapshot-backed stores into a [`context::Session`], and flush only the
//! stores they changed before the lock is released. Processing and pruning
//! also take a per-window lock file, ahead of the data lock, so two runs of
//! the same window cannot overlap. `status` and `export` read an unlocked
//! snapshot.
//!
//! ```text
//! ┌───────────┐   Context    ┌─────────────────────────────┐
//! │ tally-cli │─────────────►│ realtime / repository /     │
//! └───────────┘              │ state snapshots (data dir)  │
//!                            └─────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod context;
pub mod error;
pub mod output;

pub use cli::{Cli, Commands, Format};
pub use context::{Context, Session};
pub use error::CliError;
pub use output::OutputFormat;
