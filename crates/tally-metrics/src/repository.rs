//! Long-term storage of finalized aggregates.
//!
//! A [`Repository`] holds one [`Metric`] per series slot. Writes are
//! upserts keyed by [`SeriesSlot`], so re-running a slot replaces its
//! aggregates instead of appending to them.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dimension::DimensionCollection;
use crate::error::{MetricsError, Result};
use crate::persist::JsonStore;
use crate::storage::DEFAULT_LOCK_TIMEOUT;
use crate::types::{AggregationWindow, Metric, MetricName, MetricType, SeriesSlot, TimeRange};

/// Filters for [`Repository::query`]. Unset filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    /// Exact metric name.
    pub name: Option<MetricName>,
    /// Metric type.
    pub metric_type: Option<MetricType>,
    /// Window granularity.
    pub window: Option<AggregationWindow>,
    /// Dimensions the metric must carry (subset match).
    pub dimensions: DimensionCollection,
    /// Time range over the metric timestamp.
    pub range: Option<TimeRange>,
}

impl MetricQuery {
    /// A query matching every metric.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one metric name.
    #[must_use]
    pub fn name(mut self, name: MetricName) -> Self {
        self.name = Some(name);
        self
    }

    /// Restricts to one metric type.
    #[must_use]
    pub const fn metric_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = Some(metric_type);
        self
    }

    /// Restricts to one window.
    #[must_use]
    pub const fn window(mut self, window: AggregationWindow) -> Self {
        self.window = Some(window);
        self
    }

    /// Requires these dimensions to be present with equal values.
    #[must_use]
    pub fn dimensions(mut self, dimensions: DimensionCollection) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Restricts to timestamps within `range`.
    #[must_use]
    pub const fn range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Checks a metric against every set filter.
    #[must_use]
    pub fn matches(&self, metric: &Metric) -> bool {
        self.name.as_ref().is_none_or(|n| *n == metric.name)
            && self.metric_type.is_none_or(|t| t == metric.metric_type)
            && self.window.is_none_or(|w| w == metric.window)
            && self.range.is_none_or(|r| r.contains(metric.timestamp))
            && metric.dimensions.contains_all(&self.dimensions)
    }
}

/// Queryable store of finalized aggregates.
pub trait Repository: Send + Sync + Debug {
    /// Inserts or replaces the aggregate with the same identity.
    fn upsert(&self, metric: Metric) -> Result<()>;

    /// Fetches one aggregate by identity.
    fn get(&self, id: &SeriesSlot) -> Result<Option<Metric>>;

    /// Returns matching aggregates sorted by name, dimensions and timestamp.
    fn query(&self, query: &MetricQuery) -> Result<Vec<Metric>>;

    /// The aggregate with the greatest timestamp for each series of a
    /// metric in one window, sorted by dimensions.
    fn latest(&self, name: &MetricName, window: AggregationWindow) -> Result<Vec<Metric>>;

    /// Deletes aggregates of `window` with timestamps strictly before
    /// `before`. Returns the number deleted.
    fn prune(&self, window: AggregationWindow, before: i64) -> Result<usize>;

    /// Number of stored aggregates.
    fn len(&self) -> Result<usize>;

    /// Returns `true` if nothing is stored.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Makes buffered state durable. A no-op for stores without snapshots.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

type MetricMap = BTreeMap<SeriesSlot, Metric>;

/// Thread-safe in-memory repository. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    data: Arc<RwLock<MetricMap>>,
    lock_timeout: Duration,
    snapshot: Option<JsonStore>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            snapshot: None,
        }
    }

    /// Opens a repository persisted under `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if an existing snapshot cannot be read.
    pub fn open(dir: &Path) -> Result<Self> {
        let snapshot = JsonStore::new(dir, "repository");
        // Map keys must be strings in JSON, so the snapshot is a plain list.
        let metrics: Vec<Metric> = snapshot.load()?;
        debug!(metrics = metrics.len(), "loaded repository snapshot");
        Ok(Self {
            data: Arc::new(RwLock::new(
                metrics.into_iter().map(|m| (m.id(), m)).collect(),
            )),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            snapshot: Some(snapshot),
        })
    }

    /// Sets the bound on lock acquisition.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn timeout_err(&self, operation: &'static str) -> MetricsError {
        MetricsError::StoreTimeout {
            operation,
            timeout_ms: self.lock_timeout.as_millis() as u64,
        }
    }

    fn read_guard(&self, operation: &'static str) -> Result<RwLockReadGuard<'_, MetricMap>> {
        self.data
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.timeout_err(operation))
    }

    fn write_guard(&self, operation: &'static str) -> Result<RwLockWriteGuard<'_, MetricMap>> {
        self.data
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.timeout_err(operation))
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository for MemoryRepository {
    fn upsert(&self, metric: Metric) -> Result<()> {
        let id = metric.id();
        let replaced = self.write_guard("upsert")?.insert(id, metric).is_some();
        debug!(replaced, "upserted metric");
        Ok(())
    }

    fn get(&self, id: &SeriesSlot) -> Result<Option<Metric>> {
        Ok(self.read_guard("get")?.get(id).cloned())
    }

    fn query(&self, query: &MetricQuery) -> Result<Vec<Metric>> {
        let mut results: Vec<Metric> = self
            .read_guard("query")?
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.dimensions.cmp(&b.dimensions))
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        Ok(results)
    }

    fn latest(&self, name: &MetricName, window: AggregationWindow) -> Result<Vec<Metric>> {
        let data = self.read_guard("latest")?;
        let mut latest: BTreeMap<&DimensionCollection, &Metric> = BTreeMap::new();
        for metric in data
            .values()
            .filter(|m| m.name == *name && m.window == window)
        {
            latest
                .entry(&metric.dimensions)
                .and_modify(|best| {
                    if metric.timestamp > best.timestamp {
                        *best = metric;
                    }
                })
                .or_insert(metric);
        }
        Ok(latest.into_values().cloned().collect())
    }

    fn prune(&self, window: AggregationWindow, before: i64) -> Result<usize> {
        let mut data = self.write_guard("prune")?;
        let len = data.len();
        data.retain(|id, metric| id.window != window || metric.timestamp >= before);
        let deleted = len - data.len();
        debug!(%window, before, deleted, "pruned repository");
        Ok(deleted)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.read_guard("len")?.len())
    }

    fn flush(&self) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let data = self.read_guard("flush")?;
        let metrics: Vec<&Metric> = data.values().collect();
        snapshot.save(&metrics)
    }
}
