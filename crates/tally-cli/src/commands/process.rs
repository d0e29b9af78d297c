//! Process command implementation.
//!
//! Runs one window slot (the most recent completed one by default) or every
//! pending slot, then optionally prunes the window.

use std::io::Write;

use tally_metrics::{Pipeline, PruneTarget, RunStatus, SlotOutcome};
use tracing::info;

use crate::cli::ProcessArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::output::{OutputFormat, ProcessOutput, SlotRow, format_age};

/// Process command executor.
pub struct ProcessCommand<'a> {
    context: &'a Context,
}

impl<'a> ProcessCommand<'a> {
    /// Create a new process command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Execute the process command.
    ///
    /// The result table is written even when slots fail.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another run holds the window, `RunFailed` if any
    /// slot failed, or the store error that prevented processing.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &ProcessArgs,
    ) -> Result<(), CliError> {
        let output = self.process(args)?;
        format.write(writer, &output)?;

        match output.first_failure() {
            None => Ok(()),
            Some(row) => Err(CliError::RunFailed {
                window: args.window,
                failed: output.failed(),
                slot: row.slot,
                reason: row.error.clone().unwrap_or_default(),
            }),
        }
    }

    /// Runs the requested slots under the window lock and the data lock.
    ///
    /// # Errors
    ///
    /// Returns `Locked`, `DataLocked` or a store error. Slot failures are
    /// reported in the output instead.
    pub fn process(&self, args: &ProcessArgs) -> Result<ProcessOutput, CliError> {
        let _lock = self.context.lock(args.window)?;
        let session = self.context.session()?;
        let pipeline = session.pipeline()?;

        let outcomes = if args.process_pending {
            pipeline.run_pending(args.window, args.force, args.force)?
        } else {
            let slot = args
                .slot
                .unwrap_or_else(|| args.window.slot(self.context.now()) - 1);
            vec![run_one(&pipeline, args, slot)]
        };

        let all_succeeded = outcomes.iter().all(|o| o.status == RunStatus::Succeeded);
        let pruned = if args.prune && all_succeeded {
            Some(pipeline.prune(args.window, PruneTarget::All)?)
        } else {
            None
        };

        session.flush()?;

        let state = pipeline.state().state(args.window)?;
        info!(window = %args.window, slots = outcomes.len(), "process finished");

        Ok(ProcessOutput {
            window: args.window,
            slots: outcomes.iter().map(SlotRow::from).collect(),
            error_count: state.error_count,
            since_last_success: state.since_last_success(self.context.now()).map(format_age),
            pruned,
        })
    }
}

fn run_one(pipeline: &Pipeline, args: &ProcessArgs, slot: i64) -> SlotOutcome {
    match pipeline.run(args.window, slot, args.force) {
        Ok(report) => SlotOutcome {
            window: args.window,
            slot,
            status: report.status,
            report: Some(report),
            error: None,
        },
        Err(e) => SlotOutcome {
            window: args.window,
            slot,
            status: RunStatus::Failed,
            report: None,
            error: Some(e.to_string()),
        },
    }
}
