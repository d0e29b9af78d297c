//! Prometheus text exposition format.
//!
//! Families are rendered as:
//!
//! ```text
//! # HELP logins Successful logins
//! # TYPE logins counter
//! logins{platform="ios"} 42
//! ```
//!
//! Histograms expand into cumulative `_bucket` lines ending in `le="+Inf"`,
//! then `_sum` and `_count`. Summaries expand into `quantile` lines, then
//! `_sum` and `_count`.

use std::fmt::Write as _;

use serde::Serialize;

use crate::dimension::DimensionCollection;
use crate::types::{MetricType, MetricValue};

/// Significant digits of rendered values, as printf's `%.14g`.
const SIGNIFICANT_DIGITS: i32 = 14;

/// One exposition line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpositionSample {
    /// Appended to the family name: `""`, `_bucket`, `_sum` or `_count`.
    pub suffix: &'static str,
    /// Label pairs in output order.
    pub labels: Vec<(String, String)>,
    /// Sample value.
    pub value: f64,
}

/// A named group of samples sharing HELP and TYPE lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpositionFamily {
    /// Metric name.
    pub name: String,
    /// HELP text.
    pub help: String,
    /// TYPE keyword.
    pub kind: &'static str,
    /// Samples in output order.
    pub samples: Vec<ExpositionSample>,
}

impl ExpositionFamily {
    /// Creates an empty family.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>, kind: &'static str) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            samples: Vec::new(),
        }
    }

    /// Adds a plain sample.
    pub fn push_scalar(&mut self, dimensions: &DimensionCollection, value: f64) {
        self.samples.push(ExpositionSample {
            suffix: "",
            labels: labels_of(dimensions),
            value,
        });
    }

    /// Adds the lines of one aggregate in the shape of `metric_type`.
    pub fn push_value(
        &mut self,
        metric_type: MetricType,
        dimensions: &DimensionCollection,
        value: &MetricValue,
    ) {
        match (metric_type, value) {
            (MetricType::Histogram, MetricValue::Histogram(h)) => {
                let mut cumulative = 0;
                for bucket in &h.buckets {
                    cumulative += bucket.count;
                    self.push_labelled(
                        "_bucket",
                        dimensions,
                        ("le", format_value(bucket.upper_bound)),
                        cumulative as f64,
                    );
                }
                self.push_labelled(
                    "_bucket",
                    dimensions,
                    ("le", "+Inf".to_string()),
                    h.count as f64,
                );
                self.push_suffixed("_sum", dimensions, h.sum);
                self.push_suffixed("_count", dimensions, h.count as f64);
            }
            (MetricType::Summary, MetricValue::Summary(s)) => {
                for q in &s.quantiles {
                    self.push_labelled(
                        "",
                        dimensions,
                        ("quantile", format_value(q.quantile)),
                        q.value,
                    );
                }
                self.push_suffixed("_sum", dimensions, s.sum);
                self.push_suffixed("_count", dimensions, s.count as f64);
            }
            (_, value) => self.push_scalar(dimensions, value.scalar()),
        }
    }

    fn push_suffixed(
        &mut self,
        suffix: &'static str,
        dimensions: &DimensionCollection,
        value: f64,
    ) {
        self.samples.push(ExpositionSample {
            suffix,
            labels: labels_of(dimensions),
            value,
        });
    }

    fn push_labelled(
        &mut self,
        suffix: &'static str,
        dimensions: &DimensionCollection,
        (name, label_value): (&str, String),
        value: f64,
    ) {
        let mut labels = labels_of(dimensions);
        labels.push((name.to_string(), label_value));
        self.samples.push(ExpositionSample {
            suffix,
            labels,
            value,
        });
    }
}

fn labels_of(dimensions: &DimensionCollection) -> Vec<(String, String)> {
    dimensions
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

/// Formats a value like printf's `%.14g`, with `+Inf`, `-Inf` and `NaN`
/// for non-finite values.
#[must_use]
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    // Rounding to the target precision first settles the decimal exponent.
    let precision = (SIGNIFICANT_DIGITS - 1) as usize;
    let sci = format!("{value:.precision$e}");
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);

    if exp < -4 || exp >= SIGNIFICANT_DIGITS {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.abs())
    } else {
        let decimals = (SIGNIFICANT_DIGITS - 1 - exp).max(0) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Renders families to exposition text. Families without samples are
/// omitted.
#[must_use]
pub fn render(families: &[ExpositionFamily]) -> String {
    let mut out = String::new();
    for family in families.iter().filter(|f| !f.samples.is_empty()) {
        if family.help.is_empty() {
            let _ = writeln!(out, "# HELP {}", family.name);
        } else {
            let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(&family.help));
        }
        let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind);

        for sample in &family.samples {
            out.push_str(&family.name);
            out.push_str(sample.suffix);
            if !sample.labels.is_empty() {
                out.push('{');
                for (i, (name, value)) in sample.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{name}=\"{}\"", escape_label_value(value));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", format_value(sample.value));
        }
    }
    out
}
