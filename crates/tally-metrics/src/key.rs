//! Store keys addressing one series in one window slot.
//!
//! Encoded form: `[prefix:]name:type:window:slot:dims`. Decoding tells the
//! prefixed form from the unprefixed one by counting `:`-separated parts.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::dimension::DimensionCollection;
use crate::error::{MetricsError, Result};
use crate::types::{AggregationWindow, MetricName, MetricType, SeriesSlot};

const DELIMITER: char = ':';
const UNPREFIXED_PARTS: usize = 5;
const PREFIXED_PARTS: usize = 6;

/// Address of one series in one window slot.
///
/// Equality and hashing ignore the prefix: the same series slot stored under
/// two namespaces is the same logical key.
#[derive(Debug, Clone)]
pub struct Key {
    prefix: Option<String>,
    name: MetricName,
    metric_type: MetricType,
    window: AggregationWindow,
    slot: i64,
    dimensions: DimensionCollection,
}

impl Key {
    /// Creates a key for the window slot containing the current time.
    #[must_use]
    pub fn new(
        name: MetricName,
        metric_type: MetricType,
        window: AggregationWindow,
        dimensions: DimensionCollection,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self::at(name, metric_type, window, now, dimensions)
    }

    /// Creates a key for the window slot containing `timestamp`.
    #[must_use]
    pub fn at(
        name: MetricName,
        metric_type: MetricType,
        window: AggregationWindow,
        timestamp: i64,
        dimensions: DimensionCollection,
    ) -> Self {
        Self {
            prefix: None,
            name,
            metric_type,
            window,
            slot: window.slot(timestamp),
            dimensions,
        }
    }

    /// Replaces the slot number.
    #[must_use]
    pub fn with_slot(mut self, slot: i64) -> Self {
        self.slot = slot;
        self
    }

    /// Replaces the window, keeping the slot number.
    #[must_use]
    pub fn with_window(mut self, window: AggregationWindow) -> Self {
        self.window = window;
        self
    }

    /// Sets the namespace prefix. An empty prefix clears it.
    ///
    /// # Errors
    ///
    /// Fails if the prefix contains the key delimiter.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        Ok(self)
    }

    /// The namespace prefix, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// The metric name.
    #[must_use]
    pub const fn name(&self) -> &MetricName {
        &self.name
    }

    /// The metric type.
    #[must_use]
    pub const fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// The window granularity.
    #[must_use]
    pub const fn window(&self) -> AggregationWindow {
        self.window
    }

    /// The slot number.
    #[must_use]
    pub const fn slot(&self) -> i64 {
        self.slot
    }

    /// The dimension set.
    #[must_use]
    pub const fn dimensions(&self) -> &DimensionCollection {
        &self.dimensions
    }

    /// The repository identity this key aggregates into.
    #[must_use]
    pub fn series_slot(&self) -> SeriesSlot {
        SeriesSlot {
            name: self.name.clone(),
            metric_type: self.metric_type,
            dimensions: self.dimensions.clone(),
            window: self.window,
            slot: self.slot,
        }
    }

    /// Encodes the key to its store string.
    #[must_use]
    pub fn encode(&self) -> String {
        let body = format!(
            "{}:{}:{}:{}:{}",
            self.name,
            self.metric_type,
            self.window,
            self.slot,
            self.dimensions.encode()
        );
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{body}"),
            None => body,
        }
    }

    /// Decodes a store string produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns `MalformedKey` on a wrong part count, an unknown type or
    /// window, a non-integer slot, or malformed dimensions.
    pub fn decode(encoded: &str) -> Result<Self> {
        let parts: Vec<&str> = encoded.split(DELIMITER).collect();
        let (prefix, fields) = match parts.len() {
            PREFIXED_PARTS => (Some(parts[0]), &parts[1..]),
            UNPREFIXED_PARTS => (None, &parts[..]),
            n => {
                return Err(MetricsError::malformed_key(
                    encoded,
                    format!("expected {UNPREFIXED_PARTS} or {PREFIXED_PARTS} parts, got {n}"),
                ))
            }
        };

        let wrap = |err: MetricsError| MetricsError::malformed_key(encoded, err.to_string());

        if prefix.is_some_and(str::is_empty) {
            return Err(MetricsError::malformed_key(encoded, "empty prefix"));
        }
        let name = MetricName::new(fields[0]).map_err(wrap)?;
        let metric_type = fields[1].parse::<MetricType>().map_err(wrap)?;
        let window = fields[2].parse::<AggregationWindow>().map_err(wrap)?;
        let slot = fields[3].parse::<i64>().map_err(|e| {
            MetricsError::malformed_key(encoded, format!("invalid slot '{}': {e}", fields[3]))
        })?;
        let dimensions = DimensionCollection::decode(fields[4]).map_err(wrap)?;

        Ok(Self {
            prefix: prefix.map(str::to_string),
            name,
            metric_type,
            window,
            slot,
            dimensions,
        })
    }

    /// Glob pattern matching every key of one type in one window slot.
    #[must_use]
    pub fn pattern_for(
        prefix: Option<&str>,
        metric_type: MetricType,
        window: AggregationWindow,
        slot: i64,
    ) -> String {
        let body = format!("*:{metric_type}:{window}:{slot}:*");
        match prefix {
            Some(prefix) => format!("{prefix}:{body}"),
            None => body,
        }
    }

    /// Glob pattern matching every slot of one metric in one window.
    #[must_use]
    pub fn pattern_for_metric(
        prefix: Option<&str>,
        name: &MetricName,
        metric_type: MetricType,
        window: AggregationWindow,
    ) -> String {
        let body = format!("{name}:{metric_type}:{window}:*");
        match prefix {
            Some(prefix) => format!("{prefix}:{body}"),
            None => body,
        }
    }
}

pub(crate) fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.contains(DELIMITER) || prefix.contains(['*', '?', '[', ']', '\\']) {
        return Err(MetricsError::Config {
            reason: format!("key prefix '{prefix}' contains a reserved character"),
        });
    }
    Ok(())
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.metric_type == other.metric_type
            && self.window == other.window
            && self.slot == other.slot
            && self.dimensions == other.dimensions
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.metric_type.hash(state);
        self.window.hash(state);
        self.slot.hash(state);
        self.dimensions.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
