//! CLI command implementations.
//!
//! Each submodule implements a specific CLI command:
//! - [`process`] - Window slot aggregation and rollup
//! - [`prune`] - Retention pruning
//! - [`status`] - Per-window run state
//! - [`record`] - Sample ingestion
//! - [`export`] - Prometheus exposition

pub mod export;
pub mod process;
pub mod prune;
pub mod record;
pub mod status;

pub use export::ExportCommand;
pub use process::ProcessCommand;
pub use prune::PruneCommand;
pub use record::RecordCommand;
pub use status::StatusCommand;
