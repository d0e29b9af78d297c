//! Error types for the tally-metrics crate.

use thiserror::Error;

/// Errors that can occur in the aggregation pipeline.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A store key could not be decoded.
    #[error("malformed key '{key}': {reason}")]
    MalformedKey {
        /// The offending key.
        key: String,
        /// Why decoding failed.
        reason: String,
    },

    /// An aggregate or sample failed validation.
    #[error("invalid metric {metric}: {reason}")]
    InvalidMetric {
        /// The metric name.
        metric: String,
        /// The violated constraint.
        reason: String,
    },

    /// No handler is registered for a metric type.
    #[error("no handler registered for metric type '{metric_type}'")]
    HandlerNotFound {
        /// The metric type that has no handler.
        metric_type: String,
    },

    /// The metric name is invalid (empty or contains invalid characters).
    #[error("invalid metric name: {reason}")]
    InvalidMetricName {
        /// The reason the name is invalid.
        reason: String,
    },

    /// A dimension name or collection is invalid.
    #[error("invalid dimension: {reason}")]
    InvalidDimension {
        /// The reason the dimension is invalid.
        reason: String,
    },

    /// A textual enum value (metric type, window) was not recognised.
    #[error("unknown {kind} '{value}'")]
    UnknownVariant {
        /// What was being parsed.
        kind: &'static str,
        /// The unrecognised input.
        value: String,
    },

    /// The metric is not declared in the registry.
    #[error("unknown metric: {name}")]
    UnknownMetric {
        /// The undeclared metric name.
        name: String,
    },

    /// Insufficient data for the requested operation.
    #[error("insufficient data: {reason}")]
    InsufficientData {
        /// The reason there is insufficient data.
        reason: String,
    },

    /// A store operation did not complete within its time bound.
    #[error("store timeout during {operation} after {timeout_ms}ms")]
    StoreTimeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The bound that was exceeded.
        timeout_ms: u64,
    },

    /// The backing store is unavailable.
    #[error("store unavailable: {reason}")]
    StoreUnavailable {
        /// The reason the store is unavailable.
        reason: String,
    },

    /// Loading or saving a snapshot failed.
    #[error("persistence error: {reason}")]
    Persistence {
        /// The reason persistence failed.
        reason: String,
    },

    /// A slot whose bounds do not fit in a millisecond timestamp.
    #[error("slot {slot} is out of range for the {window} window")]
    SlotOutOfRange {
        /// Window name.
        window: String,
        /// The requested slot.
        slot: i64,
    },

    /// The configuration is invalid.
    #[error("configuration error: {reason}")]
    Config {
        /// The reason the configuration is invalid.
        reason: String,
    },
}

impl MetricsError {
    /// Returns `true` for errors a scheduler may retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreTimeout { .. } | Self::StoreUnavailable { .. })
    }

    /// Returns `true` for errors confined to a single series.
    ///
    /// The type processor skips such series and carries on with the rest.
    #[must_use]
    pub const fn is_series_level(&self) -> bool {
        matches!(
            self,
            Self::MalformedKey { .. } | Self::InvalidMetric { .. } | Self::InsufficientData { .. }
        )
    }

    pub(crate) fn malformed_key(key: &str, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_metric(metric: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMetric {
            metric: metric.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;
