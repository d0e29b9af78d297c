//! Command-line argument parsing with clap.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tally_metrics::{AggregationWindow, MetricsError, PruneTarget};

/// Tally - metrics aggregation and rollup.
#[derive(Parser, Debug, Clone)]
#[command(name = "tally")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "TALLY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding store snapshots and run locks.
    #[arg(short, long, env = "TALLY_DATA_DIR", default_value = ".tally", global = true)]
    pub data_dir: PathBuf,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table, global = true)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[derive(Default)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Aggregate a window slot and roll it up.
    Process(ProcessArgs),

    /// Remove data older than the window's retention.
    Prune(PruneArgs),

    /// Show run state for every window.
    Status,

    /// Record one sample.
    Record(RecordArgs),

    /// Print Prometheus exposition text.
    Export(ExportArgs),
}

/// Arguments for the process command.
#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    /// Window to process.
    #[arg(value_parser = parse_window)]
    pub window: AggregationWindow,

    /// Prune the window after processing.
    #[arg(long)]
    pub prune: bool,

    /// Process every pending slot, oldest first.
    #[arg(long, conflicts_with = "slot")]
    pub process_pending: bool,

    /// Re-merge already merged slots and keep going past failed slots.
    #[arg(long)]
    pub force: bool,

    /// Process this slot instead of the most recent completed one.
    #[arg(long, allow_negative_numbers = true)]
    pub slot: Option<i64>,
}

/// Arguments for the prune command.
#[derive(Args, Debug, Clone)]
pub struct PruneArgs {
    /// Window to prune, or `all`.
    pub scope: WindowScope,

    /// Storage to prune.
    #[arg(long, value_enum, default_value_t = StorageArg::All)]
    pub storage: StorageArg,
}

/// Arguments for the record command.
#[derive(Args, Debug, Clone)]
pub struct RecordArgs {
    /// Registered metric name.
    pub name: String,

    /// Sample value.
    #[arg(allow_negative_numbers = true)]
    pub value: f64,

    /// Dimension as NAME=VALUE. Repeatable.
    #[arg(long = "dim", value_name = "NAME=VALUE", value_parser = parse_dimension)]
    pub dims: Vec<(String, String)>,

    /// Sample time in Unix milliseconds. Defaults to now.
    #[arg(long)]
    pub timestamp: Option<i64>,
}

/// Arguments for the export command.
#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Export raw real-time samples instead of aggregates.
    #[arg(long)]
    pub realtime: bool,
}

/// Storage selector for pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageArg {
    /// Real-time samples and merge markers.
    Realtime,
    /// Finalized aggregates.
    Repository,
    /// Both.
    All,
}

impl From<StorageArg> for PruneTarget {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::Realtime => Self::Realtime,
            StorageArg::Repository => Self::Repository,
            StorageArg::All => Self::All,
        }
    }
}

/// One window or every window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowScope {
    /// Every window.
    All,
    /// A single window.
    One(AggregationWindow),
}

impl WindowScope {
    /// The windows covered, finest first.
    #[must_use]
    pub fn windows(self) -> Vec<AggregationWindow> {
        match self {
            Self::All => AggregationWindow::ALL.to_vec(),
            Self::One(window) => vec![window],
        }
    }
}

impl FromStr for WindowScope {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(Self::All);
        }
        s.parse().map(Self::One)
    }
}

fn parse_window(s: &str) -> Result<AggregationWindow, String> {
    s.parse().map_err(|e: MetricsError| e.to_string())
}

fn parse_dimension(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_help_does_not_panic() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_status_command() {
        let cli = Cli::parse_from(["tally", "status"]);
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.data_dir, PathBuf::from(".tally"));
        assert_eq!(cli.format, Format::Table);
        assert!(cli.config.is_none());
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "tally", "status", "--format", "json", "--data-dir", "/tmp/t", "--config", "t.toml",
        ]);
        assert_eq!(cli.format, Format::Json);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/t"));
        assert_eq!(cli.config, Some(PathBuf::from("t.toml")));
    }

    #[test]
    fn parse_process_defaults() {
        let cli = Cli::parse_from(["tally", "process", "hourly"]);
        match cli.command {
            Commands::Process(args) => {
                assert_eq!(args.window, AggregationWindow::Hourly);
                assert!(!args.prune);
                assert!(!args.process_pending);
                assert!(!args.force);
                assert!(args.slot.is_none());
            }
            _ => panic!("expected process command"),
        }
    }

    #[test]
    fn parse_process_all_flags() {
        let cli = Cli::parse_from([
            "tally",
            "process",
            "daily",
            "--prune",
            "--process-pending",
            "--force",
        ]);
        match cli.command {
            Commands::Process(args) => {
                assert_eq!(args.window, AggregationWindow::Daily);
                assert!(args.prune && args.process_pending && args.force);
            }
            _ => panic!("expected process command"),
        }
    }

    #[test]
    fn parse_process_explicit_slot() {
        let cli = Cli::parse_from(["tally", "process", "hourly", "--slot", "481203"]);
        match cli.command {
            Commands::Process(args) => assert_eq!(args.slot, Some(481_203)),
            _ => panic!("expected process command"),
        }
    }

    #[test]
    fn process_slot_conflicts_with_pending() {
        let result = Cli::try_parse_from([
            "tally",
            "process",
            "hourly",
            "--slot",
            "1",
            "--process-pending",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_window_rejected() {
        assert!(Cli::try_parse_from(["tally", "process", "yearly"]).is_err());
    }

    #[test]
    fn parse_prune_all() {
        let cli = Cli::parse_from(["tally", "prune", "all", "--storage", "repository"]);
        match cli.command {
            Commands::Prune(args) => {
                assert_eq!(args.scope, WindowScope::All);
                assert_eq!(args.scope.windows().len(), 5);
                assert_eq!(PruneTarget::from(args.storage), PruneTarget::Repository);
            }
            _ => panic!("expected prune command"),
        }
    }

    #[test]
    fn parse_prune_single_window() {
        let cli = Cli::parse_from(["tally", "prune", "weekly"]);
        match cli.command {
            Commands::Prune(args) => {
                assert_eq!(args.scope, WindowScope::One(AggregationWindow::Weekly));
                assert_eq!(args.storage, StorageArg::All);
            }
            _ => panic!("expected prune command"),
        }
    }

    #[test]
    fn parse_record_with_dimensions() {
        let cli = Cli::parse_from([
            "tally", "record", "logins", "1", "--dim", "platform=ios", "--dim", "region=eu",
            "--timestamp", "1000",
        ]);
        match cli.command {
            Commands::Record(args) => {
                assert_eq!(args.name, "logins");
                assert!((args.value - 1.0).abs() < f64::EPSILON);
                assert_eq!(
                    args.dims,
                    vec![
                        ("platform".to_string(), "ios".to_string()),
                        ("region".to_string(), "eu".to_string())
                    ]
                );
                assert_eq!(args.timestamp, Some(1000));
            }
            _ => panic!("expected record command"),
        }
    }

    #[test]
    fn parse_record_negative_value() {
        let cli = Cli::parse_from(["tally", "record", "temp", "-3.5"]);
        match cli.command {
            Commands::Record(args) => assert!((args.value + 3.5).abs() < f64::EPSILON),
            _ => panic!("expected record command"),
        }
    }

    #[test]
    fn malformed_dimension_rejected() {
        assert!(
            Cli::try_parse_from(["tally", "record", "logins", "1", "--dim", "platform"]).is_err()
        );
        assert!(Cli::try_parse_from(["tally", "record", "logins", "1", "--dim", "=ios"]).is_err());
    }

    #[test]
    fn parse_export_realtime() {
        let cli = Cli::parse_from(["tally", "export", "--realtime"]);
        assert!(matches!(cli.command, Commands::Export(ExportArgs { realtime: true })));
    }
}
