//! Ingestion API for application code.

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::dimension::DimensionCollection;
use crate::error::{MetricsError, Result};
use crate::key::Key;
use crate::registry::MetricRegistry;
use crate::storage::RealtimeStore;
use crate::types::{AggregationWindow, MetricName, MetricType, Sample};

/// Validates samples against the registry and writes them into every
/// sample-fed window.
#[derive(Debug, Clone)]
pub struct Recorder {
    store: Arc<dyn RealtimeStore>,
    registry: Arc<MetricRegistry>,
    clock: Arc<dyn Clock>,
    prefix: Option<String>,
}

impl Recorder {
    /// Creates a recorder.
    #[must_use]
    pub fn new(
        store: Arc<dyn RealtimeStore>,
        registry: Arc<MetricRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            prefix: None,
        }
    }

    /// Namespaces written keys.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }

    /// Records one sample. `timestamp` defaults to now.
    ///
    /// Returns the keys written, one per sample-fed window.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMetric` for an unregistered name, `InvalidMetric` for
    /// a type mismatch, a non-finite or out-of-bounds value, or an
    /// undeclared dimension, and store errors as they occur.
    pub fn record(
        &self,
        name: &MetricName,
        metric_type: MetricType,
        value: f64,
        dimensions: DimensionCollection,
        timestamp: Option<i64>,
    ) -> Result<Vec<Key>> {
        let definition = self.registry.require(name)?;
        if definition.metric_type != metric_type {
            return Err(MetricsError::invalid_metric(
                name.as_str(),
                format!(
                    "recorded as {metric_type} but registered as {}",
                    definition.metric_type
                ),
            ));
        }
        definition.check_value(value)?;
        definition.check_dimensions(&dimensions)?;

        let timestamp = timestamp.unwrap_or_else(|| self.clock.now_millis());
        let mut written = Vec::new();

        for window in AggregationWindow::ALL.into_iter().filter(|w| w.is_sample_fed()) {
            let key = Key::at(name.clone(), metric_type, window, timestamp, dimensions.clone());
            let key = match &self.prefix {
                Some(prefix) => key.with_prefix(prefix.as_str())?,
                None => key,
            };
            self.store.record(&key, Sample::new(timestamp, value))?;
            written.push(key);
        }

        debug!(metric = %name, value, timestamp, "recorded sample");
        Ok(written)
    }

    /// Records one sample using the registered type of `name`.
    ///
    /// # Errors
    ///
    /// As for [`record`](Self::record).
    pub fn record_value(
        &self,
        name: &MetricName,
        value: f64,
        dimensions: DimensionCollection,
        timestamp: Option<i64>,
    ) -> Result<Vec<Key>> {
        let metric_type = self.registry.require(name)?.metric_type;
        self.record(name, metric_type, value, dimensions, timestamp)
    }
}
