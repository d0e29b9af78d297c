//! Record command implementation.

use std::io::Write;

use tally_metrics::{Dimension, DimensionCollection, MetricName};

use crate::cli::RecordArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::output::{OutputFormat, RecordOutput};

/// Record command executor.
pub struct RecordCommand<'a> {
    context: &'a Context,
}

impl<'a> RecordCommand<'a> {
    /// Create a new record command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Execute the record command.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample is rejected or cannot be stored.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &RecordArgs,
    ) -> Result<(), CliError> {
        let output = self.record(args)?;
        format.write(writer, &output)?;
        Ok(())
    }

    /// Validates and stores one sample, then flushes the realtime store.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample is rejected or cannot be stored.
    pub fn record(&self, args: &RecordArgs) -> Result<RecordOutput, CliError> {
        let name = MetricName::new(&args.name)?;
        let mut dimensions = DimensionCollection::new();
        for (dim_name, value) in &args.dims {
            dimensions.try_insert(Dimension::new(dim_name.as_str(), value.as_str())?)?;
        }
        let timestamp = args.timestamp.unwrap_or_else(|| self.context.now());

        let session = self.context.session()?;
        let keys = session
            .recorder()
            .record_value(&name, args.value, dimensions, Some(timestamp))?;
        session.flush_realtime()?;

        Ok(RecordOutput {
            metric: name.to_string(),
            value: args.value,
            timestamp,
            keys: keys.iter().map(|k| k.encode()).collect(),
        })
    }
}
