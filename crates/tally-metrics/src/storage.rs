//! Real-time sample storage addressed by [`Key`].
//!
//! This module provides the [`RealtimeStore`] trait the pipeline reads from
//! and [`MemoryStore`], a thread-safe in-memory implementation with bounded
//! lock waits and optional JSON snapshots.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{MetricsError, Result};
use crate::glob::glob_match;
use crate::key::Key;
use crate::persist::JsonStore;
use crate::types::{AggregationWindow, Sample};

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// A sample-addressed key-value space.
///
/// Implementations must make each call atomic: a failed call leaves no
/// partial write behind.
pub trait RealtimeStore: Send + Sync + Debug {
    /// Appends a sample under `key`.
    ///
    /// Raw samples are appended in timestamp order; samples sharing a
    /// timestamp keep their arrival order. A rollup contribution replaces
    /// any existing contribution with the same timestamp.
    fn record(&self, key: &Key, sample: Sample) -> Result<()>;

    /// Lists stored keys matching a glob pattern, sorted.
    fn list_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Reads every sample stored under `key`. Absent keys read as empty.
    fn read(&self, key: &Key) -> Result<Vec<Sample>>;

    /// Deletes samples of `window` keys with timestamps strictly before
    /// `before`. Returns the number of samples deleted.
    fn prune(&self, window: AggregationWindow, before: i64) -> Result<usize>;

    /// Deletes one key. Returns the number of samples deleted.
    fn remove(&self, key: &Key) -> Result<usize>;

    /// Makes buffered state durable. A no-op for stores without snapshots.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

type SampleMap = BTreeMap<String, Vec<Sample>>;

/// Thread-safe in-memory real-time store.
///
/// Clones share the same data. Lock waits are bounded by the configured
/// timeout and surface as [`MetricsError::StoreTimeout`].
#[derive(Debug)]
pub struct MetricStore {
    data: Arc<RwLock<SampleMap>>,
    lock_timeout: Duration,
    snapshot: Option<JsonStore>,
}

/// The in-memory store under its role name.
pub type MemoryStore = MetricStore;

impl MetricStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            snapshot: None,
        }
    }

    /// Opens a store persisted under `dir`, loading any existing snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if an existing snapshot cannot be read.
    pub fn open(dir: &Path) -> Result<Self> {
        let snapshot = JsonStore::new(dir, "realtime");
        let data: SampleMap = snapshot.load()?;
        debug!(keys = data.len(), "loaded real-time store snapshot");
        Ok(Self {
            data: Arc::new(RwLock::new(data)),
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

    /// Number of stored keys.
    ///
    /// # Errors
    ///
    /// Returns `StoreTimeout` if the lock cannot be taken in time.
    pub fn key_count(&self) -> Result<usize> {
        Ok(self.read_guard("key_count")?.len())
    }

    fn timeout_err(&self, operation: &'static str) -> MetricsError {
        MetricsError::StoreTimeout {
            operation,
            timeout_ms: self.lock_timeout.as_millis() as u64,
        }
    }

    fn read_guard(&self, operation: &'static str) -> Result<RwLockReadGuard<'_, SampleMap>> {
        self.data
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.timeout_err(operation))
    }

    fn write_guard(&self, operation: &'static str) -> Result<RwLockWriteGuard<'_, SampleMap>> {
        self.data
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.timeout_err(operation))
    }
}

impl RealtimeStore for MetricStore {
    fn record(&self, key: &Key, sample: Sample) -> Result<()> {
        let encoded = key.encode();
        let mut data = self.write_guard("record")?;
        let samples = data.entry(encoded).or_default();

        // First index past every sample at or before this timestamp.
        let insert_pos = samples.partition_point(|s| s.timestamp <= sample.timestamp);
        let replaces = sample.metadata.is_some()
            && insert_pos > 0
            && samples[insert_pos - 1].timestamp == sample.timestamp
            && samples[insert_pos - 1].metadata.is_some();

        if replaces {
            samples[insert_pos - 1] = sample;
        } else {
            samples.insert(insert_pos, sample);
        }

        debug!(key = %key, samples = samples.len(), replaced = replaces, "recorded sample");
        Ok(())
    }

    fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let data = self.read_guard("list_keys")?;
        Ok(data
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    fn read(&self, key: &Key) -> Result<Vec<Sample>> {
        let data = self.read_guard("read")?;
        Ok(data.get(&key.encode()).cloned().unwrap_or_default())
    }

    fn prune(&self, window: AggregationWindow, before: i64) -> Result<usize> {
        let mut data = self.write_guard("prune")?;
        let mut deleted = 0;

        data.retain(|encoded, samples| {
            match Key::decode(encoded) {
                Ok(key) if key.window() == window => {
                    let len = samples.len();
                    samples.retain(|s| s.timestamp >= before);
                    deleted += len - samples.len();
                    !samples.is_empty()
                }
                // Other windows, and keys this build cannot decode, are left alone.
                _ => true,
            }
        });

        debug!(%window, before, deleted, "pruned real-time store");
        Ok(deleted)
    }

    fn remove(&self, key: &Key) -> Result<usize> {
        let mut data = self.write_guard("remove")?;
        Ok(data.remove(&key.encode()).map_or(0, |v| v.len()))
    }

    fn flush(&self) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let data = self.read_guard("flush")?;
        snapshot.save(&*data)
    }
}

impl Clone for MetricStore {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            lock_timeout: self.lock_timeout,
            snapshot: self.snapshot.clone(),
        }
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}
