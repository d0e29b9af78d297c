//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use chrono::{DateTime, Duration};
use serde::Serialize;
use tally_metrics::{AggregationWindow, ExpositionFamily, PruneReport, RunStatus, SlotOutcome};

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Get the current format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

/// One processed slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotRow {
    /// Slot number.
    pub slot: i64,
    /// Slot start, UTC.
    pub slot_start: String,
    /// Run status.
    pub status: RunStatus,
    /// Series aggregated.
    pub processed: usize,
    /// Series skipped.
    pub skipped: usize,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&SlotOutcome> for SlotRow {
    fn from(outcome: &SlotOutcome) -> Self {
        Self {
            slot: outcome.slot,
            slot_start: format_timestamp(outcome.window.slot_start(outcome.slot)),
            status: outcome.status,
            processed: outcome.report.as_ref().map_or(0, |r| r.series_processed),
            skipped: outcome.report.as_ref().map_or(0, |r| r.series_skipped),
            error: outcome.error.clone(),
        }
    }
}

/// Result of the process command.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutput {
    /// Window processed.
    pub window: AggregationWindow,
    /// Slots in processing order.
    pub slots: Vec<SlotRow>,
    /// Failed runs recorded for the window.
    pub error_count: u64,
    /// Time since the last successful run.
    pub since_last_success: Option<String>,
    /// Prune performed after processing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pruned: Option<PruneReport>,
}

impl ProcessOutput {
    /// Number of failed slots.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == RunStatus::Failed)
            .count()
    }

    /// The earliest failed slot.
    #[must_use]
    pub fn first_failure(&self) -> Option<&SlotRow> {
        self.slots.iter().find(|s| s.status == RunStatus::Failed)
    }
}

impl TableDisplay for ProcessOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.slots.is_empty() {
            writeln!(writer, "No pending {} slots", self.window)?;
        } else {
            writeln!(
                writer,
                "{:<8}  {:>10}  {:<19}  {:<9}  {:>9}  {:>7}  {:<30}",
                "WINDOW", "SLOT", "START (UTC)", "STATUS", "PROCESSED", "SKIPPED", "ERROR"
            )?;
            writeln!(writer, "{}", "─".repeat(104))?;
            for row in &self.slots {
                writeln!(
                    writer,
                    "{:<8}  {:>10}  {:<19}  {:<9}  {:>9}  {:>7}  {:<30}",
                    self.window.to_string(),
                    row.slot,
                    row.slot_start,
                    row.status.to_string(),
                    row.processed,
                    row.skipped,
                    truncate(row.error.as_deref().unwrap_or("-"), 30)
                )?;
            }

            let errors: Vec<(i64, &str)> = self
                .slots
                .iter()
                .filter_map(|row| row.error.as_deref().map(|e| (row.slot, e)))
                .collect();
            if !errors.is_empty() {
                writeln!(writer)?;
                writeln!(writer, "Errors:")?;
                for (slot, error) in errors {
                    writeln!(writer, "  slot {slot}: {error}")?;
                }
            }
        }

        writeln!(writer)?;
        writeln!(writer, "Error count:         {}", self.error_count)?;
        writeln!(
            writer,
            "Since last success:  {}",
            self.since_last_success.as_deref().unwrap_or("never")
        )?;
        if let Some(pruned) = &self.pruned {
            writeln!(
                writer,
                "Pruned:              {} sample(s), {} metric(s), {} marker(s)",
                pruned.samples, pruned.metrics, pruned.markers
            )?;
        }
        Ok(())
    }
}

/// State of one window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStatusRow {
    /// Window.
    pub window: AggregationWindow,
    /// Last successful run, UTC.
    pub last_success: Option<String>,
    /// Time since the last successful run.
    pub since_last_success: Option<String>,
    /// Highest processed slot.
    pub last_slot: Option<i64>,
    /// Failed runs recorded.
    pub error_count: u64,
    /// Slots waiting to be processed.
    pub pending: usize,
}

/// Result of the status command.
#[derive(Debug, Clone, Serialize)]
pub struct StatusOutput {
    /// One row per window, finest first.
    pub windows: Vec<WindowStatusRow>,
}

impl TableDisplay for StatusOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(
            writer,
            "{:<8}  {:<19}  {:<12}  {:>10}  {:>6}  {:>7}",
            "WINDOW", "LAST SUCCESS (UTC)", "AGO", "LAST SLOT", "ERRORS", "PENDING"
        )?;
        writeln!(writer, "{}", "─".repeat(72))?;
        for row in &self.windows {
            writeln!(
                writer,
                "{:<8}  {:<19}  {:<12}  {:>10}  {:>6}  {:>7}",
                row.window.to_string(),
                row.last_success.as_deref().unwrap_or("never"),
                row.since_last_success.as_deref().unwrap_or("-"),
                row.last_slot.map_or_else(|| "-".to_string(), |s| s.to_string()),
                row.error_count,
                row.pending
            )?;
        }
        Ok(())
    }
}

/// Result of the prune command.
#[derive(Debug, Clone, Serialize)]
pub struct PruneOutput {
    /// One report per pruned window.
    pub reports: Vec<PruneReport>,
}

impl TableDisplay for PruneOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(
            writer,
            "{:<8}  {:<19}  {:>8}  {:>8}  {:>8}",
            "WINDOW", "CUTOFF (UTC)", "SAMPLES", "METRICS", "MARKERS"
        )?;
        writeln!(writer, "{}", "─".repeat(60))?;
        for report in &self.reports {
            writeln!(
                writer,
                "{:<8}  {:<19}  {:>8}  {:>8}  {:>8}",
                report.window.map_or_else(|| "-".to_string(), |w| w.to_string()),
                format_timestamp(report.cutoff),
                report.samples,
                report.metrics,
                report.markers
            )?;
        }
        Ok(())
    }
}

/// Result of the record command.
#[derive(Debug, Clone, Serialize)]
pub struct RecordOutput {
    /// Metric recorded.
    pub metric: String,
    /// Value recorded.
    pub value: f64,
    /// Sample timestamp in Unix milliseconds.
    pub timestamp: i64,
    /// Keys written.
    pub keys: Vec<String>,
}

impl TableDisplay for RecordOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(
            writer,
            "✓ Recorded {} = {} at {}",
            self.metric,
            self.value,
            format_timestamp(self.timestamp)
        )?;
        for key in &self.keys {
            writeln!(writer, "  {key}")?;
        }
        Ok(())
    }
}

/// Result of the export command.
#[derive(Debug, Clone, Serialize)]
pub struct ExportOutput {
    /// Families exported.
    pub families: Vec<ExpositionFamily>,
    /// Rendered exposition text.
    #[serde(skip)]
    pub text: String,
}

impl TableDisplay for ExportOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writer.write_all(self.text.as_bytes())?;
        Ok(())
    }
}

/// Formats Unix milliseconds as a UTC date and time.
#[must_use]
pub fn format_timestamp(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis).map_or_else(
        || millis.to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

/// Formats a millisecond span as `1d 2h 3m 4s`, omitting zero leading units.
#[must_use]
pub fn format_age(millis: i64) -> String {
    let age = Duration::milliseconds(millis.max(0));
    let parts = [
        (age.num_days(), "d"),
        (age.num_hours() % 24, "h"),
        (age.num_minutes() % 60, "m"),
        (age.num_seconds() % 60, "s"),
    ];
    let shown: Vec<String> = parts
        .iter()
        .skip_while(|(n, _)| *n == 0)
        .map(|(n, unit)| format!("{n}{unit}"))
        .collect();
    if shown.is_empty() {
        "0s".to_string()
    } else {
        shown.join(" ")
    }
}

/// Truncate a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_metrics::WindowReport;

    fn outcome(slot: i64, status: RunStatus, error: Option<&str>) -> SlotOutcome {
        SlotOutcome {
            window: AggregationWindow::Hourly,
            slot,
            status,
            report: (status == RunStatus::Succeeded).then(|| WindowReport {
                window: AggregationWindow::Hourly,
                slot,
                status,
                series_processed: 3,
                series_skipped: 1,
                touched_keys: 3,
                merge: None,
                duration_ms: 5,
            }),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn output_format_default_is_table() {
        let fmt = OutputFormat::default();
        assert_eq!(fmt.format(), Format::Table);
        assert!(!fmt.is_json());
    }

    #[test]
    fn output_format_json() {
        let fmt = OutputFormat::new(Format::Json);
        assert!(fmt.is_json());
    }

    #[test]
    fn slot_row_from_outcome() {
        let row = SlotRow::from(&outcome(2, RunStatus::Succeeded, None));
        assert_eq!(row.slot_start, "1970-01-01 02:00:00");
        assert_eq!(row.processed, 3);
        assert_eq!(row.skipped, 1);
    }

    #[test]
    fn process_table_output() {
        let output = ProcessOutput {
            window: AggregationWindow::Hourly,
            slots: vec![
                SlotRow::from(&outcome(1, RunStatus::Succeeded, None)),
                SlotRow::from(&outcome(
                    2,
                    RunStatus::Failed,
                    Some("store timeout during list_keys after 2000ms"),
                )),
                SlotRow::from(&outcome(3, RunStatus::Pending, None)),
            ],
            error_count: 4,
            since_last_success: Some("1h 2m 0s".into()),
            pruned: None,
        };
        assert_eq!(output.failed(), 1);
        assert_eq!(output.first_failure().map(|r| r.slot), Some(2));

        let text = OutputFormat::new(Format::Table).to_string(&output).expect("should format");
        assert!(text.contains("WINDOW"));
        assert!(text.contains("succeeded"));
        assert!(text.contains("store timeout during li..."));
        assert!(text.contains("Errors:\n  slot 2: store timeout during list_keys after 2000ms\n"));
        assert!(text.contains("pending"));
        assert!(text.contains("Error count:         4"));
        assert!(text.contains("Since last success:  1h 2m 0s"));
    }

    #[test]
    fn process_table_without_slots() {
        let output = ProcessOutput {
            window: AggregationWindow::Daily,
            slots: vec![],
            error_count: 0,
            since_last_success: None,
            pruned: None,
        };
        let text = OutputFormat::new(Format::Table).to_string(&output).expect("should format");
        assert!(text.contains("No pending daily slots"));
        assert!(text.contains("Since last success:  never"));
    }

    #[test]
    fn process_json_output() {
        let output = ProcessOutput {
            window: AggregationWindow::Hourly,
            slots: vec![SlotRow::from(&outcome(1, RunStatus::Succeeded, None))],
            error_count: 0,
            since_last_success: Some("0s".into()),
            pruned: None,
        };
        let text = OutputFormat::new(Format::Json).to_string(&output).expect("should format");
        let parsed: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(parsed["window"], "hourly");
        assert_eq!(parsed["slots"][0]["status"], "succeeded");
        assert!(parsed.get("pruned").is_none());
    }

    #[test]
    fn status_table_output() {
        let output = StatusOutput {
            windows: vec![WindowStatusRow {
                window: AggregationWindow::Hourly,
                last_success: None,
                since_last_success: None,
                last_slot: None,
                error_count: 2,
                pending: 1,
            }],
        };
        let text = OutputFormat::new(Format::Table).to_string(&output).expect("should format");
        assert!(text.contains("hourly"));
        assert!(text.contains("never"));
    }

    #[test]
    fn record_table_output() {
        let output = RecordOutput {
            metric: "logins".into(),
            value: 1.0,
            timestamp: 0,
            keys: vec!["tally:logins:counter:hourly:0:".into()],
        };
        let text = OutputFormat::new(Format::Table).to_string(&output).expect("should format");
        assert!(text.contains("✓ Recorded logins = 1 at 1970-01-01 00:00:00"));
        assert!(text.contains("tally:logins:counter:hourly:0:"));
    }

    #[test]
    fn export_table_is_raw_text() {
        let output = ExportOutput {
            families: vec![],
            text: "# TYPE x gauge\nx 1\n".into(),
        };
        let text = OutputFormat::new(Format::Table).to_string(&output).expect("should format");
        assert_eq!(text, "# TYPE x gauge\nx 1\n");
    }

    #[test]
    fn age_formatting() {
        assert_eq!(format_age(0), "0s");
        assert_eq!(format_age(59_000), "59s");
        assert_eq!(format_age(3_720_000), "1h 2m 0s");
        assert_eq!(format_age(90_061_000), "1d 1h 1m 1s");
        assert_eq!(format_age(-5), "0s");
    }

    #[test]
    fn truncate_long_string() {
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("hello", 5), "hello");
        assert_eq!(truncate("hello", 3), "hel");
    }
}
