//! Per-window processing state and pending-slot recovery.
//!
//! State lives in a [`StateStore`], a flat key-value space, under these
//! keys:
//!
//! ```text
//! {prefix}:state:{window}:last_success   unix millis of the last successful run
//! {prefix}:state:{window}:error_count    failed runs since the store was created
//! {prefix}:state:{window}:last_slot      highest slot processed successfully
//! {prefix}:state:{window}:failed:{slot}  slot whose last run failed
//! {prefix}:merged:{window}:{slot}        fingerprint of the last merge
//! ```
//!
//! A failed slot stays pending until a run of it succeeds, even when later
//! slots have moved `last_slot` past it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::error::{MetricsError, Result};
use crate::glob::glob_match;
use crate::persist::JsonStore;
use crate::storage::DEFAULT_LOCK_TIMEOUT;
use crate::types::AggregationWindow;

/// One write in a [`StateStore::batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOp {
    /// Sets a key.
    Set {
        /// Key to write.
        key: String,
        /// New value.
        value: String,
    },
    /// Adds to an integer key, treating a missing key as zero.
    Incr {
        /// Key to increment.
        key: String,
        /// Amount to add.
        by: i64,
    },
    /// Removes a key.
    Delete {
        /// Key to remove.
        key: String,
    },
}

/// Flat string key-value store for processing state.
pub trait StateStore: Send + Sync + Debug {
    /// Reads a key.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a key.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Adds `by` to an integer key and returns the new value.
    fn incr(&self, key: &str, by: i64) -> Result<i64>;

    /// Removes a key. Returns `true` if it existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Applies every op or none of them.
    fn batch(&self, ops: Vec<StateOp>) -> Result<()>;

    /// Lists keys matching a glob pattern, sorted.
    fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Makes buffered state durable. A no-op for stores without snapshots.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

type StateMap = BTreeMap<String, String>;

fn parse_int(key: &str, value: &str) -> Result<i64> {
    value.parse::<i64>().map_err(|e| MetricsError::Persistence {
        reason: format!("state key '{key}' holds non-integer '{value}': {e}"),
    })
}

fn apply(map: &mut StateMap, op: StateOp) -> Result<()> {
    match op {
        StateOp::Set { key, value } => {
            map.insert(key, value);
        }
        StateOp::Incr { key, by } => {
            let current = map.get(&key).map_or(Ok(0), |v| parse_int(&key, v))?;
            map.insert(key, (current + by).to_string());
        }
        StateOp::Delete { key } => {
            map.remove(&key);
        }
    }
    Ok(())
}

/// In-memory state store. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    data: Arc<Mutex<StateMap>>,
    lock_timeout: Duration,
    snapshot: Option<JsonStore>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(BTreeMap::new())),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            snapshot: None,
        }
    }

    /// Opens a store persisted under `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if an existing snapshot cannot be read.
    pub fn open(dir: &Path) -> Result<Self> {
        let snapshot = JsonStore::new(dir, "state");
        let data: StateMap = snapshot.load()?;
        Ok(Self {
            data: Arc::new(Mutex::new(data)),
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

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, StateMap>> {
        self.data
            .try_lock_for(self.lock_timeout)
            .ok_or(MetricsError::StoreTimeout {
                operation,
                timeout_ms: self.lock_timeout.as_millis() as u64,
            })
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock("get")?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock("set")?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut data = self.lock("incr")?;
        apply(
            &mut data,
            StateOp::Incr {
                key: key.to_string(),
                by,
            },
        )?;
        data.get(key).map_or(Ok(0), |v| parse_int(key, v))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock("delete")?.remove(key).is_some())
    }

    fn batch(&self, ops: Vec<StateOp>) -> Result<()> {
        let mut data = self.lock("batch")?;
        // Staged on a copy so a failing op leaves nothing behind.
        let mut staged = data.clone();
        for op in ops {
            apply(&mut staged, op)?;
        }
        *data = staged;
        Ok(())
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .lock("keys")?
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    fn flush(&self) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let data = self.lock("flush")?;
        snapshot.save(&*data)
    }
}

/// Processing state of one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Unix millis of the last successful run.
    pub last_success: Option<i64>,
    /// Failed runs recorded so far.
    pub error_count: u64,
    /// Highest slot processed successfully.
    pub last_slot: Option<i64>,
}

impl WindowState {
    /// Milliseconds since the last successful run.
    #[must_use]
    pub fn since_last_success(&self, now: i64) -> Option<i64> {
        self.last_success.map(|ts| now - ts)
    }
}

/// Records run outcomes and derives the slots still to process.
#[derive(Debug, Clone)]
pub struct StateManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    prefix: Option<String>,
    retention: RetentionConfig,
}

impl StateManager {
    /// Creates a manager with default retention and no prefix.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            prefix: None,
            retention: RetentionConfig::default(),
        }
    }

    /// Namespaces every state key.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }

    /// Sets the retention that bounds how far back pending slots reach.
    #[must_use]
    pub const fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Current time from the injected clock.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// The configured retention.
    #[must_use]
    pub const fn retention(&self) -> &RetentionConfig {
        &self.retention
    }

    fn key(&self, parts: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{parts}"),
            None => parts.to_string(),
        }
    }

    fn state_key(&self, window: AggregationWindow, field: &str) -> String {
        self.key(&format!("state:{window}:{field}"))
    }

    fn failed_key(&self, window: AggregationWindow, slot: i64) -> String {
        self.state_key(window, &format!("failed:{slot}"))
    }

    fn merged_key(&self, window: AggregationWindow, slot: i64) -> String {
        self.key(&format!("merged:{window}:{slot}"))
    }

    fn read_int(&self, key: &str) -> Result<Option<i64>> {
        self.store
            .get(key)?
            .map(|v| parse_int(key, &v))
            .transpose()
    }

    /// Reads the state of one window. Missing entries read as defaults.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable or holds corrupt values.
    pub fn state(&self, window: AggregationWindow) -> Result<WindowState> {
        let error_count = self
            .read_int(&self.state_key(window, "error_count"))?
            .unwrap_or(0);
        Ok(WindowState {
            last_success: self.read_int(&self.state_key(window, "last_success"))?,
            error_count: u64::try_from(error_count).unwrap_or(0),
            last_slot: self.read_int(&self.state_key(window, "last_slot"))?,
        })
    }

    /// Records a successful run of `slot`.
    ///
    /// `last_slot` only moves forward: re-running an older slot does not
    /// make later slots pending again. Clears the slot's failure marker and
    /// keeps the error count.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub fn success(&self, window: AggregationWindow, slot: i64) -> Result<()> {
        let now = self.now();
        let last_slot = self
            .read_int(&self.state_key(window, "last_slot"))?
            .map_or(slot, |prev| prev.max(slot));

        self.store.batch(vec![
            StateOp::Set {
                key: self.state_key(window, "last_success"),
                value: now.to_string(),
            },
            StateOp::Set {
                key: self.state_key(window, "last_slot"),
                value: last_slot.to_string(),
            },
            StateOp::Delete {
                key: self.failed_key(window, slot),
            },
        ])?;
        debug!(%window, slot, last_slot, "recorded success");
        Ok(())
    }

    /// Records a failed run. Returns the new error count.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub fn error(&self, window: AggregationWindow) -> Result<u64> {
        let count = self.store.incr(&self.state_key(window, "error_count"), 1)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Records a failed run of `slot` and keeps it pending. Returns the new
    /// error count.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub fn failure(&self, window: AggregationWindow, slot: i64) -> Result<u64> {
        self.store.batch(vec![
            StateOp::Incr {
                key: self.state_key(window, "error_count"),
                by: 1,
            },
            StateOp::Set {
                key: self.failed_key(window, slot),
                value: self.now().to_string(),
            },
        ])?;
        let count = self.state(window)?.error_count;
        debug!(%window, slot, error_count = count, "recorded failure");
        Ok(count)
    }

    /// Slots whose last run failed, ascending.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub fn failed_slots(&self, window: AggregationWindow) -> Result<Vec<i64>> {
        let mut slots: Vec<i64> = self
            .store
            .keys(&self.state_key(window, "failed:*"))?
            .iter()
            .filter_map(|key| key.rsplit(':').next()?.parse().ok())
            .collect();
        slots.sort_unstable();
        Ok(slots)
    }

    /// Slots still to process, oldest first.
    ///
    /// Covers every slot after the last processed one, or from the slot of
    /// the last success when no slot was recorded, up to the most recent
    /// completed slot, plus every slot whose last run failed. Never reaches
    /// back past retention. With no recorded state only the most recent
    /// completed slot and failed slots are pending.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable or holds corrupt values.
    pub fn pending(&self, window: AggregationWindow) -> Result<Vec<i64>> {
        let now = self.now();
        let last_complete = window.slot(now) - 1;
        let floor = window.slot(self.retention.cutoff(window, now));
        let state = self.state(window)?;

        let first = match (state.last_slot, state.last_success) {
            (Some(slot), _) => slot + 1,
            (None, Some(ts)) => window.slot(ts),
            (None, None) => last_complete,
        };

        let mut pending: Vec<i64> = self
            .failed_slots(window)?
            .into_iter()
            .filter(|slot| (floor..=last_complete).contains(slot))
            .chain(first.max(floor)..=last_complete)
            .collect();
        pending.sort_unstable();
        pending.dedup();
        info!(%window, pending = pending.len(), "computed pending slots");
        Ok(pending)
    }

    /// Marks `slot` of `window` as rolled up, remembering the fingerprint of
    /// the aggregates that were merged.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub fn mark_merged(
        &self,
        window: AggregationWindow,
        slot: i64,
        fingerprint: &str,
    ) -> Result<()> {
        self.store.set(&self.merged_key(window, slot), fingerprint)
    }

    /// Fingerprint recorded by the last merge of `slot`, if any.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub fn merged_fingerprint(
        &self,
        window: AggregationWindow,
        slot: i64,
    ) -> Result<Option<String>> {
        self.store.get(&self.merged_key(window, slot))
    }

    /// Returns `true` if `slot` of `window` was already rolled up.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub fn is_merged(&self, window: AggregationWindow, slot: i64) -> Result<bool> {
        Ok(self.store.get(&self.merged_key(window, slot))?.is_some())
    }

    /// Drops merge and failure markers of slots that start before `before`.
    /// Returns the number dropped.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub fn prune_markers(&self, window: AggregationWindow, before: i64) -> Result<usize> {
        let cutoff = window.slot(before);
        let mut keys = self.store.keys(&self.key(&format!("merged:{window}:*")))?;
        keys.extend(self.store.keys(&self.state_key(window, "failed:*"))?);

        let mut ops = Vec::new();
        for key in keys {
            let slot = key.rsplit(':').next().and_then(|s| s.parse::<i64>().ok());
            if slot.is_some_and(|slot| slot < cutoff) {
                ops.push(StateOp::Delete { key });
            }
        }
        let dropped = ops.len();
        self.store.batch(ops)?;
        Ok(dropped)
    }

    /// Flushes the backing store.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the snapshot cannot be written.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}
