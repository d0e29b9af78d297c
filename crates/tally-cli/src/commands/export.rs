//! Export command implementation.

use std::io::Write;

use tally_metrics::{Exporter, exposition};

use crate::cli::ExportArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::output::{ExportOutput, OutputFormat};

/// Export command executor.
pub struct ExportCommand<'a> {
    context: &'a Context,
}

impl<'a> ExportCommand<'a> {
    /// Create a new export command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Execute the export command.
    ///
    /// # Errors
    ///
    /// Returns an error if the stores or output fail.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &ExportArgs,
    ) -> Result<(), CliError> {
        let output = self.collect(args)?;
        format.write(writer, &output)?;
        Ok(())
    }

    /// Collects and renders the requested families from a read-only snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a store fails.
    pub fn collect(&self, args: &ExportArgs) -> Result<ExportOutput, CliError> {
        let snapshot = self.context.snapshot()?;
        let families = if args.realtime {
            snapshot.realtime_exporter().collect()?
        } else {
            snapshot.aggregated_exporter().collect()?
        };
        let text = exposition::render(&families);
        Ok(ExportOutput { families, text })
    }
}
