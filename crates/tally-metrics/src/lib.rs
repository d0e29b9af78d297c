//! Metrics aggregation and rollup engine.
#![forbid(unsafe_code)]
//!
//! `tally-metrics` records raw samples of named, dimensioned metrics,
//! aggregates them into fixed time windows and rolls finer windows up into
//! coarser ones.
//!
//! # Features
//!
//! - **Six metric types**: counter, gauge, average, rate, histogram, summary
//! - **Window cascade**: realtime and hourly slots fed by samples, hourly
//!   rolled into daily, daily into weekly and monthly
//! - **Restartable runs**: per-window state, pending slot discovery and
//!   merge-once markers
//! - **Exposition**: Prometheus text format for realtime and aggregated data
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tally_metrics::{
//!     AggregationWindow, DimensionCollection, ManualClock, MemoryRepository,
//!     MemoryStateStore, MemoryStore, MetricDefinition, MetricName, MetricRegistry,
//!     MetricType, Pipeline, Recorder,
//! };
//!
//! let logins = MetricName::new("logins").unwrap();
//! let registry = MetricRegistry::builder()
//!     .register(MetricDefinition::new(logins.clone(), MetricType::Counter))
//!     .unwrap()
//!     .build();
//! let clock = Arc::new(ManualClock::new(0));
//! let store = MemoryStore::new();
//!
//! let recorder =
//!     Recorder::new(Arc::new(store.clone()), Arc::new(registry.clone()), clock.clone());
//! recorder
//!     .record(&logins, MetricType::Counter, 1.0, DimensionCollection::new(), None)
//!     .unwrap();
//!
//! clock.set(3_600_000);
//! let pipeline = Pipeline::builder(
//!     Arc::new(store),
//!     Arc::new(MemoryRepository::new()),
//!     Arc::new(MemoryStateStore::new()),
//! )
//! .registry(registry)
//! .clock(clock)
//! .build();
//!
//! let report = pipeline.run_latest(AggregationWindow::Hourly, false).unwrap();
//! assert_eq!(report.series_processed, 1);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod clock;
pub mod config;
pub mod dimension;
pub mod error;
pub mod exporter;
pub mod exposition;
pub mod glob;
pub mod handlers;
pub mod key;
pub mod merger;
pub mod persist;
pub mod pipeline;
pub mod recorder;
pub mod registry;
pub mod repository;
pub mod state;
pub mod storage;
pub mod types;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PipelineConfig, RetentionConfig, StoreConfig, TallyConfig};
pub use dimension::{Dimension, DimensionCollection};
pub use error::{MetricsError, Result};
pub use exporter::{AggregatedExporter, Exporter, RealtimeExporter};
pub use exposition::{ExpositionFamily, ExpositionSample};
pub use handlers::{HandlerContext, HandlerRegistry, MetricHandler};
pub use key::Key;
pub use merger::{MergeOutcome, MetricMerger};
pub use pipeline::{
    MetricProcessor, Pipeline, PipelineBuilder, Processor, PruneReport, PruneTarget, RunStatus,
    SlotOutcome, TypeProcessor, TypeReport, TypeRun, WindowProcessor, WindowReport, WindowRun,
};
pub use recorder::Recorder;
pub use registry::{MetricDefinition, MetricRegistry};
pub use repository::{MemoryRepository, MetricQuery, Repository};
pub use state::{MemoryStateStore, StateManager, StateOp, StateStore, WindowState};
pub use storage::{MemoryStore, MetricStore, RealtimeStore};
pub use types::{
    AggregationWindow, Metric, MetricName, MetricType, MetricValue, PartialAggregate, Sample,
    SeriesSlot, TimeRange,
};
