//! Prune command implementation.

use std::io::Write;

use tally_metrics::PruneTarget;

use crate::cli::PruneArgs;
use crate::context::{Context, WindowLock};
use crate::error::CliError;
use crate::output::{OutputFormat, PruneOutput};

/// Prune command executor.
pub struct PruneCommand<'a> {
    context: &'a Context,
}

impl<'a> PruneCommand<'a> {
    /// Create a new prune command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Execute the prune command.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if a window is being processed, or a store error.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &PruneArgs,
    ) -> Result<(), CliError> {
        let output = self.prune(args)?;
        format.write(writer, &output)?;
        Ok(())
    }

    /// Prunes every window in scope while holding their locks, then flushes
    /// only the stores the target touched.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if a window is being processed, `DataLocked` if
    /// another command holds the data directory, or a store error.
    pub fn prune(&self, args: &PruneArgs) -> Result<PruneOutput, CliError> {
        let windows = args.scope.windows();
        let _locks = windows
            .iter()
            .map(|w| self.context.lock(*w))
            .collect::<Result<Vec<WindowLock>, _>>()?;

        let session = self.context.session()?;
        let pipeline = session.pipeline()?;
        let target = PruneTarget::from(args.storage);
        let reports = windows
            .into_iter()
            .map(|w| pipeline.prune(w, target))
            .collect::<Result<Vec<_>, _>>()?;

        match target {
            PruneTarget::Realtime => {
                session.flush_realtime()?;
                session.flush_state()?;
            }
            PruneTarget::Repository => session.flush_repository()?,
            PruneTarget::All => session.flush()?,
        }
        Ok(PruneOutput { reports })
    }
}
