//! Core types for the aggregation pipeline.
//!
//! This module provides the fundamental types used throughout the crate:
//! - [`MetricName`]: a validated metric name
//! - [`MetricType`]: the reduction kind of a series
//! - [`AggregationWindow`]: window granularity, slots and retention
//! - [`Sample`] and [`PartialAggregate`]: records held by the real-time store
//! - [`MetricValue`] and [`Metric`]: finalized aggregates
//! - [`TimeRange`]: a half-open time range for repository queries

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dimension::DimensionCollection;
use crate::error::{MetricsError, Result};

/// Milliseconds in one second.
pub const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// A validated metric name.
///
/// Metric names must:
/// - Be non-empty
/// - Contain only ASCII alphanumeric characters and underscores
/// - Start with a letter or underscore
/// - Be at most 200 characters long
///
/// Colons are not allowed: they delimit the fields of a store key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricName(String);

impl MetricName {
    /// Maximum allowed length for a metric name.
    pub const MAX_LENGTH: usize = 200;

    /// Creates a new validated metric name.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidMetricName` if the name is invalid.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(MetricsError::InvalidMetricName {
                reason: "metric name cannot be empty".to_string(),
            });
        }

        if name.len() > Self::MAX_LENGTH {
            return Err(MetricsError::InvalidMetricName {
                reason: format!(
                    "metric name exceeds maximum length of {} characters",
                    Self::MAX_LENGTH
                ),
            });
        }

        if let Some(c) = name.chars().next() {
            if !c.is_ascii_alphabetic() && c != '_' {
                return Err(MetricsError::InvalidMetricName {
                    reason: "metric name must start with a letter or underscore".to_string(),
                });
            }
        }

        if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
            return Err(MetricsError::InvalidMetricName {
                reason: format!("invalid character '{c}' in metric name"),
            });
        }

        Ok(Self(name))
    }

    /// Returns the metric name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MetricName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MetricName {
    type Error = MetricsError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MetricName> for String {
    fn from(name: MetricName) -> Self {
        name.0
    }
}

impl FromStr for MetricName {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// The reduction kind of a series.
///
/// Determines which handler aggregates its samples and which shape it takes
/// in the exposition output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Monotonic total; samples are summed.
    Counter,
    /// Point-in-time value; the latest sample wins.
    Gauge,
    /// Distribution over fixed bucket boundaries.
    Histogram,
    /// Distribution summarised by quantiles.
    Summary,
    /// Arithmetic mean of samples.
    Average,
    /// Samples per second over the window.
    Rate,
}

impl MetricType {
    /// All metric types, in processing order.
    pub const ALL: [Self; 6] = [
        Self::Counter,
        Self::Gauge,
        Self::Histogram,
        Self::Summary,
        Self::Average,
        Self::Rate,
    ];

    /// The canonical lowercase name used in keys and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
            Self::Average => "average",
            Self::Rate => "rate",
        }
    }

    /// The `# TYPE` keyword of the exposition format.
    #[must_use]
    pub const fn exposition_type(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge | Self::Average | Self::Rate => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MetricsError::UnknownVariant {
                kind: "metric type",
                value: s.to_string(),
            })
    }
}

/// Aggregation window granularity.
///
/// Every window has a fixed duration. Time is divided into consecutive slots
/// of that duration counted from the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationWindow {
    /// One-minute slots fed directly by recorded samples.
    Realtime,
    /// One-hour slots fed directly by recorded samples.
    Hourly,
    /// One-day slots fed by hourly rollups.
    Daily,
    /// Seven-day slots fed by daily rollups.
    Weekly,
    /// Thirty-day slots fed by daily rollups.
    Monthly,
}

impl AggregationWindow {
    /// All windows from finest to coarsest.
    pub const ALL: [Self; 5] = [
        Self::Realtime,
        Self::Hourly,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
    ];

    /// The canonical lowercase name used in keys and on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Slot duration in milliseconds.
    #[must_use]
    pub const fn duration_millis(self) -> i64 {
        match self {
            Self::Realtime => MILLIS_PER_MINUTE,
            Self::Hourly => MILLIS_PER_HOUR,
            Self::Daily => MILLIS_PER_DAY,
            Self::Weekly => 7 * MILLIS_PER_DAY,
            Self::Monthly => 30 * MILLIS_PER_DAY,
        }
    }

    /// Slot duration in seconds.
    #[must_use]
    pub fn duration_secs(self) -> f64 {
        self.duration_millis() as f64 / MILLIS_PER_SECOND as f64
    }

    /// Default retention in milliseconds before data becomes prunable.
    #[must_use]
    pub const fn default_retention_millis(self) -> i64 {
        match self {
            Self::Realtime => MILLIS_PER_DAY,
            Self::Hourly => 7 * MILLIS_PER_DAY,
            Self::Daily => 90 * MILLIS_PER_DAY,
            Self::Weekly => 365 * MILLIS_PER_DAY,
            Self::Monthly => 1_825 * MILLIS_PER_DAY,
        }
    }

    /// Maps a millisecond timestamp to its slot number.
    #[must_use]
    pub const fn slot(self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.duration_millis())
    }

    /// Slots whose start and end both fit in an `i64` timestamp.
    #[must_use]
    pub const fn slot_range(self) -> RangeInclusive<i64> {
        let duration = self.duration_millis();
        -(i64::MAX / duration)..=i64::MAX / duration - 1
    }

    /// Inclusive start of a slot, in milliseconds. Saturates outside
    /// [`slot_range`](Self::slot_range).
    #[must_use]
    pub const fn slot_start(self, slot: i64) -> i64 {
        slot.saturating_mul(self.duration_millis())
    }

    /// Exclusive end of a slot, in milliseconds. Saturates outside
    /// [`slot_range`](Self::slot_range).
    #[must_use]
    pub const fn slot_end(self, slot: i64) -> i64 {
        slot.saturating_add(1).saturating_mul(self.duration_millis())
    }

    /// The next coarser window in the hierarchy.
    #[must_use]
    pub const fn coarser(self) -> Option<Self> {
        match self {
            Self::Realtime => Some(Self::Hourly),
            Self::Hourly => Some(Self::Daily),
            Self::Daily => Some(Self::Weekly),
            Self::Weekly => Some(Self::Monthly),
            Self::Monthly => None,
        }
    }

    /// Windows this window's aggregates are rolled into.
    ///
    /// Weeks do not tile thirty-day months, so both weekly and monthly
    /// windows are fed from days. Realtime aggregates are not rolled up:
    /// hourly windows read recorded samples directly.
    #[must_use]
    pub const fn rollup_targets(self) -> &'static [Self] {
        match self {
            Self::Hourly => &[Self::Daily],
            Self::Daily => &[Self::Weekly, Self::Monthly],
            Self::Realtime | Self::Weekly | Self::Monthly => &[],
        }
    }

    /// Returns `true` if samples are recorded directly into this window.
    #[must_use]
    pub const fn is_sample_fed(self) -> bool {
        matches!(self, Self::Realtime | Self::Hourly)
    }
}

impl fmt::Display for AggregationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationWindow {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|w| w.as_str() == s)
            .ok_or_else(|| MetricsError::UnknownVariant {
                kind: "aggregation window",
                value: s.to_string(),
            })
    }
}

/// An aggregate carried as a sample into a coarser window's key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialAggregate {
    /// The finer window's aggregate value.
    pub value: MetricValue,
    /// Number of raw samples behind the aggregate.
    pub sample_count: u64,
    /// Timestamp of the latest raw sample behind the aggregate.
    pub last_sample_at: i64,
}

/// A single record held by the real-time store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// The measured value.
    pub value: f64,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Set on rollup contributions written by the merger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PartialAggregate>,
}

impl Sample {
    /// Creates a raw sample.
    #[must_use]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self {
            value,
            timestamp,
            metadata: None,
        }
    }

    /// Creates a rollup contribution.
    #[must_use]
    pub fn partial(timestamp: i64, partial: PartialAggregate) -> Self {
        Self {
            value: partial.value.scalar(),
            timestamp,
            metadata: Some(partial),
        }
    }
}

/// One histogram bucket. Counts are per bucket, not cumulative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Inclusive upper bound.
    pub upper_bound: f64,
    /// Observations in `(previous bound, upper_bound]`.
    pub count: u64,
}

/// A histogram aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramValue {
    /// Buckets in ascending bound order.
    pub buckets: Vec<Bucket>,
    /// Total observations, including those above the last bound.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
}

/// One computed quantile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantile {
    /// The quantile in `[0, 1]`.
    pub quantile: f64,
    /// The value at that quantile.
    pub value: f64,
}

/// A summary aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryValue {
    /// Quantiles in ascending order.
    pub quantiles: Vec<Quantile>,
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
}

/// The value of a finalized aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    /// Counter, gauge, average and rate values.
    Scalar(f64),
    /// Bucketed distribution.
    Histogram(HistogramValue),
    /// Quantile summary.
    Summary(SummaryValue),
}

impl MetricValue {
    /// Single-number projection: the value itself, or the sum of a
    /// distribution.
    #[must_use]
    pub const fn scalar(&self) -> f64 {
        match self {
            Self::Scalar(v) => *v,
            Self::Histogram(h) => h.sum,
            Self::Summary(s) => s.sum,
        }
    }

    /// Returns `true` if every number in the value is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Scalar(v) => v.is_finite(),
            Self::Histogram(h) => h.sum.is_finite(),
            Self::Summary(s) => {
                s.sum.is_finite() && s.quantiles.iter().all(|q| q.value.is_finite())
            }
        }
    }
}

/// Identity of a persisted aggregate: one series in one window slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesSlot {
    /// Metric name.
    pub name: MetricName,
    /// Metric type.
    pub metric_type: MetricType,
    /// Dimension set.
    pub dimensions: DimensionCollection,
    /// Window granularity.
    pub window: AggregationWindow,
    /// Slot number within the window.
    pub slot: i64,
}

/// A finalized aggregate for one series in one window slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name.
    pub name: MetricName,
    /// Metric type.
    pub metric_type: MetricType,
    /// The aggregate value.
    pub value: MetricValue,
    /// Canonical timestamp: the slot start, in milliseconds.
    pub timestamp: i64,
    /// Dimension set.
    pub dimensions: DimensionCollection,
    /// Window granularity.
    pub window: AggregationWindow,
    /// Slot number within the window.
    pub slot: i64,
    /// Number of raw samples behind the aggregate.
    pub sample_count: u64,
    /// Timestamp of the latest raw sample behind the aggregate.
    pub last_sample_at: i64,
}

impl Metric {
    /// The upsert identity of this aggregate.
    #[must_use]
    pub fn id(&self) -> SeriesSlot {
        SeriesSlot {
            name: self.name.clone(),
            metric_type: self.metric_type,
            dimensions: self.dimensions.clone(),
            window: self.window,
            slot: self.slot,
        }
    }

    /// Converts this aggregate into a contribution for a coarser window.
    #[must_use]
    pub fn to_partial(&self) -> PartialAggregate {
        PartialAggregate {
            value: self.value.clone(),
            sample_count: self.sample_count,
            last_sample_at: self.last_sample_at,
        }
    }
}

/// A half-open time range `[start, end)` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive).
    pub start: i64,
    /// End timestamp (exclusive).
    pub end: i64,
}

impl TimeRange {
    /// Creates a new time range.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::Config` if start > end.
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(MetricsError::Config {
                reason: format!("invalid time range: start={start}, end={end}"),
            });
        }
        Ok(Self { start, end })
    }

    /// The range covered by one window slot.
    #[must_use]
    pub const fn of_slot(window: AggregationWindow, slot: i64) -> Self {
        Self {
            start: window.slot_start(slot),
            end: window.slot_end(slot),
        }
    }

    /// Checks if a timestamp falls within this range.
    #[must_use]
    pub const fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod metric_name_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn valid_metric_name() {
            let name = MetricName::new("device_count").unwrap();
            assert_eq!(name.as_str(), "device_count");
            assert_eq!(name.to_string(), "device_count");
        }

        #[test]
        fn valid_metric_name_starting_with_underscore() {
            assert!(MetricName::new("_internal").is_ok());
        }

        #[test_case("" ; "empty")]
        #[test_case("0_invalid" ; "leading digit")]
        #[test_case("verification-latency" ; "dash")]
        #[test_case("a:b" ; "colon")]
        #[test_case("a b" ; "space")]
        fn invalid_metric_names(raw: &str) {
            assert!(matches!(
                MetricName::new(raw),
                Err(MetricsError::InvalidMetricName { .. })
            ));
        }

        #[test]
        fn metric_name_too_long_fails() {
            let long_name = "a".repeat(MetricName::MAX_LENGTH + 1);
            assert!(MetricName::new(long_name).is_err());
            assert!(MetricName::new("a".repeat(MetricName::MAX_LENGTH)).is_ok());
        }

        #[test]
        fn deserialization_validates() {
            let parsed: serde_json::Result<MetricName> = serde_json::from_str("\"bad-name\"");
            assert!(parsed.is_err());
            let parsed: MetricName = serde_json::from_str("\"good_name\"").unwrap();
            assert_eq!(parsed.as_str(), "good_name");
        }
    }

    mod metric_type_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn parse_roundtrip() {
            for t in MetricType::ALL {
                assert_eq!(t.as_str().parse::<MetricType>().unwrap(), t);
            }
        }

        #[test]
        fn unknown_type_fails() {
            assert!(matches!(
                "timer".parse::<MetricType>(),
                Err(MetricsError::UnknownVariant { kind: "metric type", .. })
            ));
        }

        #[test_case(MetricType::Counter, "counter")]
        #[test_case(MetricType::Gauge, "gauge")]
        #[test_case(MetricType::Histogram, "histogram")]
        #[test_case(MetricType::Summary, "summary")]
        #[test_case(MetricType::Average, "gauge")]
        #[test_case(MetricType::Rate, "gauge")]
        fn exposition_types(t: MetricType, expected: &str) {
            assert_eq!(t.exposition_type(), expected);
        }
    }

    mod window_tests {
        use super::*;

        #[test]
        fn slot_is_floor_of_timestamp_over_duration() {
            let hour = AggregationWindow::Hourly;
            assert_eq!(hour.slot(0), 0);
            assert_eq!(hour.slot(3_599_999), 0);
            assert_eq!(hour.slot(3_600_000), 1);
            assert_eq!(hour.slot(-1), -1);
        }

        #[test]
        fn slot_bounds() {
            let day = AggregationWindow::Daily;
            assert_eq!(day.slot_start(2), 2 * 86_400_000);
            assert_eq!(day.slot_end(2), 3 * 86_400_000);
            assert_eq!(day.slot(day.slot_start(7)), 7);
            assert_eq!(day.slot(day.slot_end(7) - 1), 7);
        }

        #[test]
        fn slot_range_edges_do_not_overflow() {
            for window in AggregationWindow::ALL {
                let range = window.slot_range();
                let duration = window.duration_millis();
                assert!((range.end() + 1).checked_mul(duration).is_some());
                assert!(range.start().checked_mul(duration).is_some());
                assert!(!range.contains(&i64::MAX));
                assert!(!range.contains(&i64::MIN));
                assert!(range.contains(&0));
                assert_eq!(window.slot_start(i64::MAX), i64::MAX);
                assert_eq!(window.slot_end(i64::MIN), i64::MIN);
            }
        }

        #[test]
        fn coarser_hierarchy() {
            assert_eq!(AggregationWindow::Realtime.coarser(), Some(AggregationWindow::Hourly));
            assert_eq!(AggregationWindow::Weekly.coarser(), Some(AggregationWindow::Monthly));
            assert_eq!(AggregationWindow::Monthly.coarser(), None);
        }

        #[test]
        fn rollup_targets_tile_their_parents() {
            for window in AggregationWindow::ALL {
                for target in window.rollup_targets() {
                    assert_eq!(target.duration_millis() % window.duration_millis(), 0);
                }
            }
        }

        #[test]
        fn parse_roundtrip() {
            for w in AggregationWindow::ALL {
                assert_eq!(w.as_str().parse::<AggregationWindow>().unwrap(), w);
            }
            assert!("yearly".parse::<AggregationWindow>().is_err());
        }

        #[test]
        fn rate_duration_seconds() {
            assert!((AggregationWindow::Realtime.duration_secs() - 60.0).abs() < f64::EPSILON);
        }
    }

    mod value_tests {
        use super::*;

        #[test]
        fn scalar_projection() {
            let h = MetricValue::Histogram(HistogramValue {
                buckets: vec![],
                count: 2,
                sum: 7.5,
            });
            assert!((h.scalar() - 7.5).abs() < f64::EPSILON);
            assert!((MetricValue::Scalar(3.0).scalar() - 3.0).abs() < f64::EPSILON);
        }

        #[test]
        fn finiteness() {
            assert!(!MetricValue::Scalar(f64::NAN).is_finite());
            let s = MetricValue::Summary(SummaryValue {
                quantiles: vec![Quantile {
                    quantile: 0.5,
                    value: f64::INFINITY,
                }],
                count: 1,
                sum: 1.0,
            });
            assert!(!s.is_finite());
        }

        #[test]
        fn partial_sample_carries_metadata() {
            let partial = PartialAggregate {
                value: MetricValue::Scalar(4.0),
                sample_count: 2,
                last_sample_at: 10,
            };
            let sample = Sample::partial(0, partial.clone());
            assert!((sample.value - 4.0).abs() < f64::EPSILON);
            assert_eq!(sample.metadata, Some(partial));
        }

        #[test]
        fn raw_sample_serializes_without_metadata() {
            let json = serde_json::to_string(&Sample::new(5, 1.5)).unwrap();
            assert_eq!(json, r#"{"value":1.5,"timestamp":5}"#);
        }
    }

    mod time_range_tests {
        use super::*;

        #[test]
        fn half_open() {
            let range = TimeRange::new(1000, 2000).unwrap();
            assert!(range.contains(1000));
            assert!(range.contains(1999));
            assert!(!range.contains(2000));
        }

        #[test]
        fn start_after_end_fails() {
            assert!(TimeRange::new(2000, 1000).is_err());
        }

        #[test]
        fn of_slot_matches_window_bounds() {
            let range = TimeRange::of_slot(AggregationWindow::Hourly, 3);
            assert_eq!(range.start, 3 * 3_600_000);
            assert_eq!(range.end, 4 * 3_600_000);
        }
    }
}
