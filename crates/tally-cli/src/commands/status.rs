//! Status command implementation.
//!
//! Shows per-window run state: last success, last processed slot, error
//! count and the number of pending slots.

use std::io::Write;

use crate::context::Context;
use crate::error::CliError;
use crate::output::{
    OutputFormat, StatusOutput, WindowStatusRow, format_age, format_timestamp,
};

/// Status command executor.
pub struct StatusCommand<'a> {
    context: &'a Context,
}

impl<'a> StatusCommand<'a> {
    /// Create a new status command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Execute the status command.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store or output fails.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let status = self.fetch_status()?;
        format.write(writer, &status)?;
        Ok(())
    }

    /// Collects the state of every window from a read-only snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub fn fetch_status(&self) -> Result<StatusOutput, CliError> {
        let snapshot = self.context.snapshot()?;
        let pipeline = snapshot.pipeline()?;
        let now = self.context.now();

        let mut windows = Vec::new();
        for (window, state) in pipeline.status()? {
            windows.push(WindowStatusRow {
                window,
                last_success: state.last_success.map(format_timestamp),
                since_last_success: state.since_last_success(now).map(format_age),
                last_slot: state.last_slot,
                error_count: state.error_count,
                pending: pipeline.state().pending(window)?.len(),
            });
        }
        Ok(StatusOutput { windows })
    }
}
