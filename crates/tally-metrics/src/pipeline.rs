//! The window → type → metric rollup pipeline.
//!
//! A [`Pipeline`] owns three nested processors:
//!
//! - [`WindowProcessor`] runs one window slot: every metric type, then the
//!   merge into coarser windows, then the state update.
//! - [`TypeProcessor`] lists the series of one type in the slot and fans them
//!   out over scoped worker threads.
//! - [`MetricProcessor`] reduces one series slot and upserts the aggregate.
//!
//! Series-level failures (malformed keys, invalid aggregates) are logged and
//! skipped. Anything else aborts the run, is counted in the window state and
//! propagates. Aggregates are upserted, so a failed run can be re-run.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{RetentionConfig, TallyConfig};
use crate::error::{MetricsError, Result};
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::key::Key;
use crate::merger::{MergeOutcome, MetricMerger};
use crate::registry::{MetricDefinition, MetricRegistry};
use crate::repository::Repository;
use crate::state::{StateManager, StateStore, WindowState};
use crate::storage::RealtimeStore;
use crate::types::{AggregationWindow, Metric, MetricType, PartialAggregate};

/// A stage of the pipeline.
pub trait Processor<Item> {
    /// What the stage produces.
    type Output;

    /// Processes one item.
    ///
    /// # Errors
    ///
    /// Stage-specific; see the implementors.
    fn process(&self, item: Item) -> Result<Self::Output>;
}

/// Lifecycle of one window slot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Not started.
    Pending,
    /// In progress.
    Running,
    /// Finished without error.
    Succeeded,
    /// Aborted by an error.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Reduces one series slot into a persisted aggregate.
#[derive(Debug, Clone)]
pub struct MetricProcessor {
    store: Arc<dyn RealtimeStore>,
    repository: Arc<dyn Repository>,
    handlers: Arc<HandlerRegistry>,
    registry: Arc<MetricRegistry>,
}

impl MetricProcessor {
    /// Creates a metric processor.
    #[must_use]
    pub fn new(
        store: Arc<dyn RealtimeStore>,
        repository: Arc<dyn Repository>,
        handlers: Arc<HandlerRegistry>,
        registry: Arc<MetricRegistry>,
    ) -> Self {
        Self {
            store,
            repository,
            handlers,
            registry,
        }
    }

    /// The registered definition, or defaults when the series outlived its
    /// registration or changed type.
    fn definition(&self, key: &Key) -> Cow<'_, MetricDefinition> {
        match self.registry.get(key.name()) {
            Some(def) if def.metric_type == key.metric_type() => Cow::Borrowed(def),
            _ => Cow::Owned(MetricDefinition::new(key.name().clone(), key.metric_type())),
        }
    }
}

impl<'a> Processor<&'a Key> for MetricProcessor {
    type Output = Option<Metric>;

    /// Returns `None` when the series has no samples in the slot.
    fn process(&self, key: &'a Key) -> Result<Option<Metric>> {
        let samples = self.store.read(key)?;
        if samples.is_empty() {
            return Ok(None);
        }

        let definition = self.definition(key);
        let ctx = HandlerContext::new(&definition, key.window());
        let handler = self.handlers.get(key.metric_type())?;

        let parts: Vec<PartialAggregate> =
            samples.iter().filter_map(|s| s.metadata.clone()).collect();

        let (value, sample_count, last_sample_at) = if parts.is_empty() {
            let last = samples.iter().map(|s| s.timestamp).max().unwrap_or_default();
            (handler.aggregate(&ctx, &samples)?, samples.len() as u64, last)
        } else if parts.len() == samples.len() {
            let count = parts.iter().map(|p| p.sample_count).sum();
            let last = parts.iter().map(|p| p.last_sample_at).max().unwrap_or_default();
            (handler.combine(&ctx, &parts)?, count, last)
        } else {
            return Err(MetricsError::invalid_metric(
                key.name().as_str(),
                "slot mixes raw samples with rollup contributions",
            ));
        };

        let metric = Metric {
            name: key.name().clone(),
            metric_type: key.metric_type(),
            value,
            timestamp: key.window().slot_start(key.slot()),
            dimensions: key.dimensions().clone(),
            window: key.window(),
            slot: key.slot(),
            sample_count,
            last_sample_at,
        };
        self.repository.upsert(metric.clone())?;
        debug!(key = %key, sample_count, "aggregated series");
        Ok(Some(metric))
    }
}

/// One metric type in one window slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRun {
    /// Metric type to process.
    pub metric_type: MetricType,
    /// Window granularity.
    pub window: AggregationWindow,
    /// Slot number.
    pub slot: i64,
}

/// Outcome of processing one metric type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeReport {
    /// The processed type.
    pub metric_type: MetricType,
    /// Aggregates produced, in key order.
    pub metrics: Vec<Metric>,
    /// Keys that produced an aggregate.
    pub touched_keys: Vec<String>,
    /// Series skipped on a series-level error.
    pub skipped: usize,
}

/// Lists and processes every series of one type in one slot.
#[derive(Debug, Clone)]
pub struct TypeProcessor {
    store: Arc<dyn RealtimeStore>,
    metric_processor: MetricProcessor,
    prefix: Option<String>,
    workers: usize,
}

type SeriesResult = (String, Result<Option<Metric>>);

impl TypeProcessor {
    /// Creates a type processor with one worker.
    #[must_use]
    pub fn new(store: Arc<dyn RealtimeStore>, metric_processor: MetricProcessor) -> Self {
        Self {
            store,
            metric_processor,
            prefix: None,
            workers: 1,
        }
    }

    /// Restricts listing to keys under `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }

    /// Sets the number of worker threads. Zero is treated as one.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    fn process_all(&self, keys: &[Key]) -> Vec<SeriesResult> {
        let run = |key: &Key| (key.encode(), self.metric_processor.process(key));

        if self.workers <= 1 || keys.len() <= 1 {
            // Sequential runs stop at the first error that is not series-level.
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                let result = run(key);
                let fatal = matches!(&result.1, Err(e) if !e.is_series_level());
                results.push(result);
                if fatal {
                    break;
                }
            }
            return results;
        }

        let chunk_size = keys.len().div_ceil(self.workers);
        thread::scope(|scope| {
            let handles: Vec<_> = keys
                .chunks(chunk_size)
                .map(|chunk| scope.spawn(move || chunk.iter().map(run).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

impl Processor<TypeRun> for TypeProcessor {
    type Output = TypeReport;

    fn process(&self, run: TypeRun) -> Result<TypeReport> {
        let pattern =
            Key::pattern_for(self.prefix.as_deref(), run.metric_type, run.window, run.slot);
        let mut report = TypeReport {
            metric_type: run.metric_type,
            metrics: Vec::new(),
            touched_keys: Vec::new(),
            skipped: 0,
        };

        let mut keys = Vec::new();
        for encoded in self.store.list_keys(&pattern)? {
            match Key::decode(&encoded) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    warn!(key = %encoded, error = %e, "skipping malformed key");
                    report.skipped += 1;
                }
            }
        }

        for (encoded, result) in self.process_all(&keys) {
            match result {
                Ok(Some(metric)) => {
                    report.metrics.push(metric);
                    report.touched_keys.push(encoded);
                }
                Ok(None) => {}
                Err(e) if e.is_series_level() => {
                    warn!(key = %encoded, error = %e, "skipping series");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            metric_type = %run.metric_type,
            window = %run.window,
            slot = run.slot,
            processed = report.metrics.len(),
            skipped = report.skipped,
            "processed type"
        );
        Ok(report)
    }
}

/// One window slot to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRun {
    /// Window granularity.
    pub window: AggregationWindow,
    /// Slot number.
    pub slot: i64,
    /// Merge again even if the slot was already merged.
    pub force: bool,
}

/// Outcome of a successful window slot run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowReport {
    /// Window granularity.
    pub window: AggregationWindow,
    /// Slot number.
    pub slot: i64,
    /// Final status.
    pub status: RunStatus,
    /// Series aggregated.
    pub series_processed: usize,
    /// Series skipped on a series-level error.
    pub series_skipped: usize,
    /// Keys that produced an aggregate.
    pub touched_keys: usize,
    /// Merge into coarser windows, when the window has any.
    pub merge: Option<MergeOutcome>,
    /// Wall time of the run.
    pub duration_ms: u64,
}

/// Runs every metric type of one window slot, merges, and records state.
#[derive(Debug, Clone)]
pub struct WindowProcessor {
    type_processor: TypeProcessor,
    merger: MetricMerger,
    state: StateManager,
    registry: Arc<MetricRegistry>,
}

impl WindowProcessor {
    /// Creates a window processor.
    #[must_use]
    pub fn new(
        type_processor: TypeProcessor,
        merger: MetricMerger,
        state: StateManager,
        registry: Arc<MetricRegistry>,
    ) -> Self {
        Self {
            type_processor,
            merger,
            state,
            registry,
        }
    }

    fn run(&self, run: WindowRun, started: Instant) -> Result<WindowReport> {
        let mut metrics = Vec::new();
        let mut skipped = 0;
        let mut touched = 0;

        for metric_type in MetricType::ALL {
            if !self.registry.has_type(metric_type) {
                continue;
            }
            let report = self.type_processor.process(TypeRun {
                metric_type,
                window: run.window,
                slot: run.slot,
            })?;
            skipped += report.skipped;
            touched += report.touched_keys.len();
            metrics.extend(report.metrics);
        }

        let merge = if run.window == AggregationWindow::Realtime {
            None
        } else {
            Some(self.merger.merge(run.window, run.slot, &metrics, run.force)?)
        };

        self.state.success(run.window, run.slot)?;

        Ok(WindowReport {
            window: run.window,
            slot: run.slot,
            status: RunStatus::Succeeded,
            series_processed: metrics.len(),
            series_skipped: skipped,
            touched_keys: touched,
            merge,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl Processor<WindowRun> for WindowProcessor {
    type Output = WindowReport;

    fn process(&self, run: WindowRun) -> Result<WindowReport> {
        let started = Instant::now();
        info!(window = %run.window, slot = run.slot, status = %RunStatus::Running, "starting run");

        match self.run(run, started) {
            Ok(report) => {
                info!(
                    window = %run.window,
                    slot = run.slot,
                    processed = report.series_processed,
                    skipped = report.series_skipped,
                    duration_ms = report.duration_ms,
                    "run succeeded"
                );
                Ok(report)
            }
            Err(e) => {
                error!(window = %run.window, slot = run.slot, error = %e, "run failed");
                if let Err(state_err) = self.state.failure(run.window, run.slot) {
                    error!(window = %run.window, error = %state_err, "failed to record run error");
                }
                Err(e)
            }
        }
    }
}

/// Result of one slot in a pending batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotOutcome {
    /// Window granularity.
    pub window: AggregationWindow,
    /// Slot number.
    pub slot: i64,
    /// Final status; `pending` when an earlier failure stopped the batch.
    pub status: RunStatus,
    /// Report of a successful run.
    pub report: Option<WindowReport>,
    /// Error message of a failed run.
    pub error: Option<String>,
}

/// Which storage a prune applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneTarget {
    /// The real-time store and merge markers.
    Realtime,
    /// The repository of finalized aggregates.
    Repository,
    /// Both.
    All,
}

impl FromStr for PruneTarget {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "realtime" => Ok(Self::Realtime),
            "repository" => Ok(Self::Repository),
            "all" => Ok(Self::All),
            other => Err(MetricsError::UnknownVariant {
                kind: "prune target",
                value: other.to_string(),
            }),
        }
    }
}

/// Counts of what a prune removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Window pruned.
    pub window: Option<AggregationWindow>,
    /// Cutoff timestamp; data strictly before it was removed.
    pub cutoff: i64,
    /// Samples removed from the real-time store.
    pub samples: usize,
    /// Aggregates removed from the repository.
    pub metrics: usize,
    /// Merge markers removed.
    pub markers: usize,
}

/// The assembled rollup pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    window_processor: WindowProcessor,
    state: StateManager,
    store: Arc<dyn RealtimeStore>,
    repository: Arc<dyn Repository>,
    retention: RetentionConfig,
}

impl Pipeline {
    /// Starts assembling a pipeline over the given stores.
    #[must_use]
    pub fn builder(
        store: Arc<dyn RealtimeStore>,
        repository: Arc<dyn Repository>,
        state_store: Arc<dyn StateStore>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            store,
            repository,
            state_store,
            clock: Arc::new(SystemClock),
            registry: MetricRegistry::default(),
            handlers: HandlerRegistry::standard(),
            prefix: None,
            workers: 1,
            prune_merged_sources: false,
            retention: RetentionConfig::default(),
        }
    }

    /// The state manager.
    #[must_use]
    pub const fn state(&self) -> &StateManager {
        &self.state
    }

    /// Processes one window slot.
    ///
    /// # Errors
    ///
    /// Returns `SlotOutOfRange` for a slot whose bounds overflow a
    /// timestamp. Otherwise propagates the first error that is not
    /// series-level, after recording it in the window state.
    pub fn run(&self, window: AggregationWindow, slot: i64, force: bool) -> Result<WindowReport> {
        if !window.slot_range().contains(&slot) {
            return Err(MetricsError::SlotOutOfRange {
                window: window.to_string(),
                slot,
            });
        }
        self.window_processor
            .process(WindowRun { window, slot, force })
    }

    /// Processes the most recent completed slot of `window`.
    ///
    /// # Errors
    ///
    /// As for [`run`](Self::run).
    pub fn run_latest(&self, window: AggregationWindow, force: bool) -> Result<WindowReport> {
        let slot = window.slot(self.state.now()) - 1;
        self.run(window, slot, force)
    }

    /// Processes every pending slot of `window`, oldest first.
    ///
    /// Without `continue_on_error` the first failure stops the batch and the
    /// remaining slots are reported as pending.
    ///
    /// # Errors
    ///
    /// Fails only if the pending slots cannot be computed. Run failures are
    /// reported per slot.
    pub fn run_pending(
        &self,
        window: AggregationWindow,
        force: bool,
        continue_on_error: bool,
    ) -> Result<Vec<SlotOutcome>> {
        let slots = self.state.pending(window)?;
        let mut outcomes = Vec::with_capacity(slots.len());
        let mut stopped = false;

        for slot in slots {
            if stopped {
                outcomes.push(SlotOutcome {
                    window,
                    slot,
                    status: RunStatus::Pending,
                    report: None,
                    error: None,
                });
                continue;
            }
            match self.run(window, slot, force) {
                Ok(report) => outcomes.push(SlotOutcome {
                    window,
                    slot,
                    status: RunStatus::Succeeded,
                    report: Some(report),
                    error: None,
                }),
                Err(e) => {
                    outcomes.push(SlotOutcome {
                        window,
                        slot,
                        status: RunStatus::Failed,
                        report: None,
                        error: Some(e.to_string()),
                    });
                    stopped = !continue_on_error;
                }
            }
        }
        Ok(outcomes)
    }

    /// Removes data of `window` older than its retention.
    ///
    /// # Errors
    ///
    /// Fails if a store is unavailable.
    pub fn prune(&self, window: AggregationWindow, target: PruneTarget) -> Result<PruneReport> {
        let cutoff = self.retention.cutoff(window, self.state.now());
        let mut report = PruneReport {
            window: Some(window),
            cutoff,
            ..PruneReport::default()
        };

        if matches!(target, PruneTarget::Realtime | PruneTarget::All) {
            report.samples = self.store.prune(window, cutoff)?;
            report.markers = self.state.prune_markers(window, cutoff)?;
        }
        if matches!(target, PruneTarget::Repository | PruneTarget::All) {
            report.metrics = self.repository.prune(window, cutoff)?;
        }

        info!(
            %window,
            cutoff,
            samples = report.samples,
            metrics = report.metrics,
            markers = report.markers,
            "pruned window"
        );
        Ok(report)
    }

    /// State of every window, finest first.
    ///
    /// # Errors
    ///
    /// Fails if the state store is unavailable.
    pub fn status(&self) -> Result<Vec<(AggregationWindow, WindowState)>> {
        AggregationWindow::ALL
            .into_iter()
            .map(|w| Ok((w, self.state.state(w)?)))
            .collect()
    }

    /// Flushes every store.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if a snapshot cannot be written.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()?;
        self.repository.flush()?;
        self.state.flush()
    }
}

/// Assembles a [`Pipeline`].
#[derive(Debug)]
pub struct PipelineBuilder {
    store: Arc<dyn RealtimeStore>,
    repository: Arc<dyn Repository>,
    state_store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    registry: MetricRegistry,
    handlers: HandlerRegistry,
    prefix: Option<String>,
    workers: usize,
    prune_merged_sources: bool,
    retention: RetentionConfig,
}

impl PipelineBuilder {
    /// Applies prefix, workers, merge and retention settings from a config.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the metric definitions are invalid.
    pub fn config(mut self, config: &TallyConfig) -> Result<Self> {
        self.registry = config.registry()?;
        self.prefix = config.prefix().map(str::to_string);
        self.workers = config.pipeline.workers;
        self.prune_merged_sources = config.pipeline.prune_merged_sources;
        self.retention = config.retention;
        Ok(self)
    }

    /// Sets the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the metric registry.
    #[must_use]
    pub fn registry(mut self, registry: MetricRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the handler table.
    #[must_use]
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }

    /// Sets the worker count per type.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Removes source keys after a merge.
    #[must_use]
    pub const fn prune_merged_sources(mut self, prune: bool) -> Self {
        self.prune_merged_sources = prune;
        self
    }

    /// Sets retention.
    #[must_use]
    pub const fn retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Wires the processors together.
    #[must_use]
    pub fn build(self) -> Pipeline {
        let prefix = self.prefix.as_deref();
        let registry = Arc::new(self.registry);
        let state = StateManager::new(self.state_store, self.clock)
            .with_prefix(prefix)
            .with_retention(self.retention);

        let metric_processor = MetricProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.repository),
            Arc::new(self.handlers),
            Arc::clone(&registry),
        );
        let type_processor = TypeProcessor::new(Arc::clone(&self.store), metric_processor)
            .with_prefix(prefix)
            .with_workers(self.workers);
        let merger = MetricMerger::new(Arc::clone(&self.store), state.clone())
            .with_prefix(prefix)
            .prune_sources(self.prune_merged_sources);

        Pipeline {
            window_processor: WindowProcessor::new(type_processor, merger, state.clone(), registry),
            state,
            store: self.store,
            repository: self.repository,
            retention: self.retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dimension::DimensionCollection;
    use crate::repository::{MemoryRepository, MetricQuery};
    use crate::state::MemoryStateStore;
    use crate::storage::MemoryStore;
    use crate::types::{MetricName, MetricValue, Sample};
    use std::sync::atomic::{AtomicBool, Ordering};

    const HOUR: i64 = 3_600_000;

    const BAD_KEY: &str = "tally:logins:counter:hourly:9:novalue";

    /// Delegates to a memory store, failing reads, failing listings that
    /// contain a marker, or listing an undecodable key on demand.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
        fail_listing: parking_lot::Mutex<Option<String>>,
        list_bad_key: AtomicBool,
    }

    impl RealtimeStore for FlakyStore {
        fn record(&self, key: &Key, sample: Sample) -> Result<()> {
            self.inner.record(key, sample)
        }

        fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
            if self
                .fail_listing
                .lock()
                .as_deref()
                .is_some_and(|marker| pattern.contains(marker))
            {
                return Err(MetricsError::StoreUnavailable {
                    reason: "injected".to_string(),
                });
            }
            let mut keys = self.inner.list_keys(pattern)?;
            if self.list_bad_key.load(Ordering::SeqCst)
                && crate::glob::glob_match(pattern, BAD_KEY)
            {
                keys.push(BAD_KEY.to_string());
            }
            Ok(keys)
        }

        fn read(&self, key: &Key) -> Result<Vec<Sample>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(MetricsError::StoreUnavailable {
                    reason: "injected".to_string(),
                });
            }
            self.inner.read(key)
        }

        fn prune(&self, window: AggregationWindow, before: i64) -> Result<usize> {
            self.inner.prune(window, before)
        }

        fn remove(&self, key: &Key) -> Result<usize> {
            self.inner.remove(key)
        }
    }

    struct Fixture {
        pipeline: Pipeline,
        store: Arc<FlakyStore>,
        repository: MemoryRepository,
        clock: ManualClock,
    }

    fn registry() -> MetricRegistry {
        MetricRegistry::builder()
            .register(MetricDefinition::new(
                MetricName::new("logins").unwrap(),
                MetricType::Counter,
            ))
            .unwrap()
            .register(
                MetricDefinition::new(MetricName::new("temp").unwrap(), MetricType::Gauge)
                    .bounds(Some(0.0), Some(100.0)),
            )
            .unwrap()
            .build()
    }

    fn fixture(workers: usize) -> Fixture {
        let store = Arc::new(FlakyStore::default());
        let repository = MemoryRepository::new();
        let clock = ManualClock::new(10 * HOUR + 30);
        let pipeline = Pipeline::builder(
            Arc::clone(&store) as Arc<dyn RealtimeStore>,
            Arc::new(repository.clone()),
            Arc::new(MemoryStateStore::new()),
        )
        .clock(Arc::new(clock.clone()))
        .registry(registry())
        .prefix(Some("tally"))
        .workers(workers)
        .build();
        Fixture {
            pipeline,
            store,
            repository,
            clock,
        }
    }

    fn key(name: &str, metric_type: MetricType, platform: &str, ts: i64) -> Key {
        Key::at(
            MetricName::new(name).unwrap(),
            metric_type,
            AggregationWindow::Hourly,
            ts,
            DimensionCollection::from_pairs([("platform", platform)]).unwrap(),
        )
        .with_prefix("tally")
        .unwrap()
    }

    mod metric_processor_tests {
        use super::*;

        #[test]
        fn empty_series_yields_none() {
            let f = fixture(1);
            let report = f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();
            assert_eq!(report.series_processed, 0);
            assert_eq!(f.repository.len().unwrap(), 0);
        }

        #[test]
        fn metric_timestamp_is_slot_start() {
            let f = fixture(1);
            let k = key("logins", MetricType::Counter, "ios", 9 * HOUR + 500);
            f.store.record(&k, Sample::new(9 * HOUR + 500, 2.0)).unwrap();
            f.store.record(&k, Sample::new(9 * HOUR + 900, 3.0)).unwrap();

            f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();
            let stored = f.repository.get(&k.series_slot()).unwrap().unwrap();
            assert_eq!(stored.timestamp, 9 * HOUR);
            assert_eq!(stored.value, MetricValue::Scalar(5.0));
            assert_eq!(stored.sample_count, 2);
            assert_eq!(stored.last_sample_at, 9 * HOUR + 900);
        }

        #[test]
        fn mixed_samples_are_skipped() {
            let f = fixture(1);
            let k = key("logins", MetricType::Counter, "ios", 9 * HOUR);
            f.store.record(&k, Sample::new(9 * HOUR, 1.0)).unwrap();
            let partial = PartialAggregate {
                value: MetricValue::Scalar(1.0),
                sample_count: 1,
                last_sample_at: 9 * HOUR,
            };
            f.store.record(&k, Sample::partial(9 * HOUR + 1, partial)).unwrap();

            let report = f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();
            assert_eq!(report.series_skipped, 1);
        }
    }

    mod type_processor_tests {
        use super::*;

        #[test]
        fn invalid_series_is_skipped_and_others_succeed() {
            let f = fixture(1);
            f.store
                .record(
                    &key("temp", MetricType::Gauge, "a", 9 * HOUR),
                    Sample::new(9 * HOUR, 500.0),
                )
                .unwrap();
            f.store
                .record(&key("temp", MetricType::Gauge, "b", 9 * HOUR), Sample::new(9 * HOUR, 50.0))
                .unwrap();

            let report = f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();
            assert_eq!(report.series_processed, 1);
            assert_eq!(report.series_skipped, 1);
        }

        #[test]
        fn malformed_keys_are_skipped() {
            let f = fixture(1);
            f.store
                .record(
                    &key("logins", MetricType::Counter, "ios", 9 * HOUR),
                    Sample::new(9 * HOUR, 1.0),
                )
                .unwrap();
            f.store.list_bad_key.store(true, Ordering::SeqCst);

            let report = f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();
            assert_eq!(report.series_processed, 1);
            assert_eq!(report.series_skipped, 1);
        }

        #[test]
        fn workers_produce_same_results_as_sequential() {
            let sequential = fixture(1);
            let parallel = fixture(4);
            for f in [&sequential, &parallel] {
                for i in 0..25 {
                    let k = key("logins", MetricType::Counter, &format!("p{i}"), 9 * HOUR);
                    f.store.record(&k, Sample::new(9 * HOUR, f64::from(i))).unwrap();
                }
                f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();
            }
            let a = sequential.repository.query(&MetricQuery::new()).unwrap();
            let b = parallel.repository.query(&MetricQuery::new()).unwrap();
            assert_eq!(a.len(), 25);
            assert_eq!(a, b);
        }
    }

    mod window_processor_tests {
        use super::*;

        #[test]
        fn success_updates_state_and_merges() {
            let f = fixture(1);
            let k = key("logins", MetricType::Counter, "ios", 9 * HOUR);
            f.store.record(&k, Sample::new(9 * HOUR, 1.0)).unwrap();

            let report = f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();
            assert_eq!(report.status, RunStatus::Succeeded);
            assert_eq!(report.merge.unwrap().contributions, 1);

            let state = f.pipeline.state().state(AggregationWindow::Hourly).unwrap();
            assert_eq!(state.last_slot, Some(9));
            assert_eq!(state.last_success, Some(10 * HOUR + 30));
            assert!(f.pipeline.state().is_merged(AggregationWindow::Hourly, 9).unwrap());
        }

        #[test]
        fn realtime_window_does_not_merge() {
            let f = fixture(1);
            let report = f.pipeline.run(AggregationWindow::Realtime, 5, false).unwrap();
            assert!(report.merge.is_none());
        }

        #[test]
        fn store_failure_counts_error_and_keeps_last_success() {
            let f = fixture(1);
            let k = key("logins", MetricType::Counter, "ios", 9 * HOUR);
            f.store.record(&k, Sample::new(9 * HOUR, 1.0)).unwrap();
            f.store.fail_reads.store(true, Ordering::SeqCst);

            let err = f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap_err();
            assert!(err.is_transient());
            let state = f.pipeline.state().state(AggregationWindow::Hourly).unwrap();
            assert_eq!(state.error_count, 1);
            assert_eq!(state.last_success, None);
        }

        #[test]
        fn out_of_range_slot_is_rejected_before_running() {
            let f = fixture(1);
            let err = f
                .pipeline
                .run(AggregationWindow::Hourly, i64::MAX, false)
                .unwrap_err();
            assert!(matches!(err, MetricsError::SlotOutOfRange { slot: i64::MAX, .. }));
            let state = f.pipeline.state().state(AggregationWindow::Hourly).unwrap();
            assert_eq!(state.error_count, 0);
        }

        #[test]
        fn rerun_overwrites_aggregates() {
            let f = fixture(1);
            let k = key("logins", MetricType::Counter, "ios", 9 * HOUR);
            f.store.record(&k, Sample::new(9 * HOUR, 1.0)).unwrap();
            f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();
            f.store.record(&k, Sample::new(9 * HOUR + 1, 1.0)).unwrap();
            f.pipeline.run(AggregationWindow::Hourly, 9, false).unwrap();

            assert_eq!(f.repository.len().unwrap(), 1);
            let stored = f.repository.get(&k.series_slot()).unwrap().unwrap();
            assert_eq!(stored.value, MetricValue::Scalar(2.0));
        }
    }

    mod pending_tests {
        use super::*;

        #[test]
        fn pending_batch_aborts_on_first_failure() {
            let f = fixture(1);
            f.pipeline.run(AggregationWindow::Hourly, 6, false).unwrap();
            f.store
                .record(
                    &key("logins", MetricType::Counter, "ios", 7 * HOUR),
                    Sample::new(7 * HOUR, 1.0),
                )
                .unwrap();
            f.store.fail_reads.store(true, Ordering::SeqCst);

            let outcomes = f
                .pipeline
                .run_pending(AggregationWindow::Hourly, false, false)
                .unwrap();
            let statuses: Vec<RunStatus> = outcomes.iter().map(|o| o.status).collect();
            assert_eq!(
                statuses,
                vec![RunStatus::Failed, RunStatus::Pending, RunStatus::Pending]
            );
        }

        #[test]
        fn pending_batch_continues_when_asked() {
            let f = fixture(1);
            f.pipeline.run(AggregationWindow::Hourly, 6, false).unwrap();
            f.store
                .record(
                    &key("logins", MetricType::Counter, "ios", 7 * HOUR),
                    Sample::new(7 * HOUR, 1.0),
                )
                .unwrap();
            f.store.fail_reads.store(true, Ordering::SeqCst);

            let outcomes = f
                .pipeline
                .run_pending(AggregationWindow::Hourly, false, true)
                .unwrap();
            // Slots without keys never read, so only slot 7 fails.
            let statuses: Vec<RunStatus> = outcomes.iter().map(|o| o.status).collect();
            assert_eq!(
                statuses,
                vec![RunStatus::Failed, RunStatus::Succeeded, RunStatus::Succeeded]
            );
        }

        #[test]
        fn slot_failed_in_continued_batch_stays_pending() {
            let f = fixture(1);
            f.pipeline.run(AggregationWindow::Hourly, 6, false).unwrap();
            *f.store.fail_listing.lock() = Some(":hourly:8:".to_string());

            let outcomes = f
                .pipeline
                .run_pending(AggregationWindow::Hourly, false, true)
                .unwrap();
            let batch: Vec<(i64, RunStatus)> =
                outcomes.iter().map(|o| (o.slot, o.status)).collect();
            assert_eq!(
                batch,
                vec![
                    (7, RunStatus::Succeeded),
                    (8, RunStatus::Failed),
                    (9, RunStatus::Succeeded),
                ]
            );
            assert_eq!(f.pipeline.state().pending(AggregationWindow::Hourly).unwrap(), vec![8]);

            *f.store.fail_listing.lock() = None;
            let retry = f
                .pipeline
                .run_pending(AggregationWindow::Hourly, false, false)
                .unwrap();
            assert_eq!(retry.len(), 1);
            assert_eq!((retry[0].slot, retry[0].status), (8, RunStatus::Succeeded));
            assert!(f.pipeline.state().pending(AggregationWindow::Hourly).unwrap().is_empty());
        }

        #[test]
        fn run_latest_uses_last_completed_slot() {
            let f = fixture(1);
            f.clock.set(5 * HOUR + 10);
            let report = f.pipeline.run_latest(AggregationWindow::Hourly, false).unwrap();
            assert_eq!(report.slot, 4);
        }
    }

    mod prune_tests {
        use super::*;

        #[test]
        fn prune_uses_retention_cutoff() {
            let f = fixture(1);
            let old = key("logins", MetricType::Counter, "ios", 0);
            f.store.record(&old, Sample::new(0, 1.0)).unwrap();
            f.pipeline.run(AggregationWindow::Hourly, 0, false).unwrap();

            f.clock.set(8 * 24 * HOUR);
            let report = f
                .pipeline
                .prune(AggregationWindow::Hourly, PruneTarget::All)
                .unwrap();
            assert_eq!(report.samples, 1);
            assert_eq!(report.metrics, 1);
            assert_eq!(report.markers, 1);
            assert_eq!(report.cutoff, 24 * HOUR);
        }

        #[test]
        fn prune_target_parses() {
            assert_eq!("all".parse::<PruneTarget>().unwrap(), PruneTarget::All);
            assert!("disk".parse::<PruneTarget>().is_err());
        }
    }
}
