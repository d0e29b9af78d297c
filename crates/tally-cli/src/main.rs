//! Tally CLI binary entrypoint.
//!
//! This is the main entry point for the `tally` command-line tool.

use std::io;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tally_cli::cli::{Cli, Commands};
use tally_cli::commands::{
    ExportCommand, ProcessCommand, PruneCommand, RecordCommand, StatusCommand,
};
use tally_cli::context::Context;
use tally_cli::output::OutputFormat;

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let format = OutputFormat::new(cli.format);
    let context = Context::load(cli.config.as_deref(), &cli.data_dir).with_context(|| {
        format!(
            "failed to open tally data directory '{}'",
            cli.data_dir.display()
        )
    })?;
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Process(args) => ProcessCommand::new(&context)
            .execute(&mut stdout, &format, &args)
            .with_context(|| format!("failed to process {} window", args.window))?,
        Commands::Prune(args) => PruneCommand::new(&context)
            .execute(&mut stdout, &format, &args)
            .context("failed to prune")?,
        Commands::Status => StatusCommand::new(&context)
            .execute(&mut stdout, &format)
            .context("failed to read window status")?,
        Commands::Record(args) => RecordCommand::new(&context)
            .execute(&mut stdout, &format, &args)
            .with_context(|| format!("failed to record {}", args.name))?,
        Commands::Export(args) => ExportCommand::new(&context)
            .execute(&mut stdout, &format, &args)
            .context("failed to export metrics")?,
    }

    Ok(())
}
