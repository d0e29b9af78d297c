//! Exporters building exposition families from stored data.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::exposition::{self, ExpositionFamily};
use crate::key::Key;
use crate::registry::{MetricDefinition, MetricRegistry};
use crate::repository::Repository;
use crate::storage::RealtimeStore;
use crate::types::AggregationWindow;

/// Source of exposition families.
pub trait Exporter {
    /// Collects one family per registered metric that has data.
    ///
    /// # Errors
    ///
    /// Returns store errors as they occur.
    fn collect(&self) -> Result<Vec<ExpositionFamily>>;

    /// Collects and renders exposition text.
    ///
    /// # Errors
    ///
    /// As for [`collect`](Self::collect).
    fn render(&self) -> Result<String> {
        Ok(exposition::render(&self.collect()?))
    }
}

/// Exposes the latest raw sample of each series in the current Realtime
/// slot, falling back to the previous slot when the current one is empty.
#[derive(Debug, Clone)]
pub struct RealtimeExporter {
    store: Arc<dyn RealtimeStore>,
    registry: Arc<MetricRegistry>,
    clock: Arc<dyn Clock>,
    prefix: Option<String>,
}

impl RealtimeExporter {
    /// Creates an exporter over `store`.
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

    /// Reads keys under `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }

    fn keys_in_slot(&self, definition: &MetricDefinition, slot: i64) -> Result<Vec<Key>> {
        let pattern = Key::pattern_for_metric(
            self.prefix.as_deref(),
            &definition.name,
            definition.metric_type,
            AggregationWindow::Realtime,
        );
        let mut keys = Vec::new();
        for encoded in self.store.list_keys(&pattern)? {
            match Key::decode(&encoded) {
                Ok(key) if key.slot() == slot => keys.push(key),
                Ok(_) => {}
                Err(e) => warn!(key = %encoded, error = %e, "skipping malformed key"),
            }
        }
        Ok(keys)
    }

    fn family(&self, definition: &MetricDefinition, slot: i64) -> Result<ExpositionFamily> {
        let mut keys = self.keys_in_slot(definition, slot)?;
        if keys.is_empty() {
            keys = self.keys_in_slot(definition, slot - 1)?;
        }

        let mut family = ExpositionFamily::new(
            definition.name.as_str(),
            definition.help.as_str(),
            "gauge",
        );
        for key in keys {
            let samples = self.store.read(&key)?;
            // Samples are ordered by timestamp, ties in arrival order.
            if let Some(latest) = samples.iter().filter(|s| s.metadata.is_none()).next_back() {
                family.push_scalar(key.dimensions(), latest.value);
            }
        }
        Ok(family)
    }
}

impl Exporter for RealtimeExporter {
    fn collect(&self) -> Result<Vec<ExpositionFamily>> {
        let slot = AggregationWindow::Realtime.slot(self.clock.now_millis());
        let mut families = Vec::new();
        for definition in self.registry.iter() {
            let family = self.family(definition, slot)?;
            if !family.samples.is_empty() {
                families.push(family);
            }
        }
        debug!(families = families.len(), slot, "collected realtime families");
        Ok(families)
    }
}

/// Exposes the latest stored aggregate of each series from the widest
/// window holding data for the metric.
#[derive(Debug, Clone)]
pub struct AggregatedExporter {
    repository: Arc<dyn Repository>,
    registry: Arc<MetricRegistry>,
}

impl AggregatedExporter {
    /// Creates an exporter over `repository`.
    #[must_use]
    pub fn new(repository: Arc<dyn Repository>, registry: Arc<MetricRegistry>) -> Self {
        Self {
            repository,
            registry,
        }
    }

    fn family(&self, definition: &MetricDefinition) -> Result<Option<ExpositionFamily>> {
        for window in AggregationWindow::ALL.into_iter().rev() {
            let latest: Vec<_> = self
                .repository
                .latest(&definition.name, window)?
                .into_iter()
                .filter(|m| m.metric_type == definition.metric_type)
                .collect();
            if latest.is_empty() {
                continue;
            }

            let mut family = ExpositionFamily::new(
                definition.name.as_str(),
                definition.help.as_str(),
                definition.metric_type.exposition_type(),
            );
            for metric in &latest {
                family.push_value(metric.metric_type, &metric.dimensions, &metric.value);
            }
            debug!(metric = %definition.name, %window, series = latest.len(), "exporting window");
            return Ok(Some(family));
        }
        Ok(None)
    }
}

impl Exporter for AggregatedExporter {
    fn collect(&self) -> Result<Vec<ExpositionFamily>> {
        let mut families = Vec::new();
        for definition in self.registry.iter() {
            if let Some(family) = self.family(definition)? {
                families.push(family);
            }
        }
        Ok(families)
    }
}
