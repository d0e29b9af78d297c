//! Rolls a finer window's aggregates into coarser windows.
//!
//! Each aggregate of `(window, slot)` is written into every rollup target as
//! a contribution sample timestamped at the child slot start. Writing the
//! same child again replaces its contribution. The state store keeps a
//! fingerprint of the last merged aggregates per slot, so an unchanged slot
//! is not merged again unless forced while a slot updated by late samples is.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MetricsError, Result};
use crate::key::Key;
use crate::state::StateManager;
use crate::storage::RealtimeStore;
use crate::types::{AggregationWindow, Metric, Sample};

/// Result of merging one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Contribution samples written.
    pub contributions: usize,
    /// The slot was already merged with the same aggregates and the run was
    /// not forced.
    pub skipped: bool,
    /// Source keys removed after merging.
    pub removed_sources: usize,
}

/// Writes rollup contributions into the real-time store.
#[derive(Debug, Clone)]
pub struct MetricMerger {
    store: Arc<dyn RealtimeStore>,
    state: StateManager,
    prefix: Option<String>,
    prune_sources: bool,
}

impl MetricMerger {
    /// Creates a merger writing into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn RealtimeStore>, state: StateManager) -> Self {
        Self {
            store,
            state,
            prefix: None,
            prune_sources: false,
        }
    }

    /// Namespaces contribution keys.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }

    /// Removes source keys once their contributions are stored.
    #[must_use]
    pub const fn prune_sources(mut self, prune: bool) -> Self {
        self.prune_sources = prune;
        self
    }

    fn key_for(&self, metric: &Metric, window: AggregationWindow, timestamp: i64) -> Result<Key> {
        let key = Key::at(
            metric.name.clone(),
            metric.metric_type,
            window,
            timestamp,
            metric.dimensions.clone(),
        );
        match &self.prefix {
            Some(prefix) => key.with_prefix(prefix.as_str()),
            None => Ok(key),
        }
    }

    /// Merges the aggregates of `(window, slot)` into its rollup targets.
    ///
    /// # Errors
    ///
    /// Fails if the store or state store is unavailable. Contributions
    /// written before a failure stay in place; a re-run overwrites them.
    pub fn merge(
        &self,
        window: AggregationWindow,
        slot: i64,
        metrics: &[Metric],
        force: bool,
    ) -> Result<MergeOutcome> {
        let targets = window.rollup_targets();
        if targets.is_empty() {
            return Ok(MergeOutcome::default());
        }

        let fingerprint = fingerprint(metrics)?;
        if !force {
            match self.state.merged_fingerprint(window, slot)? {
                Some(previous) if previous == fingerprint => {
                    info!(%window, slot, "slot already merged, skipping");
                    return Ok(MergeOutcome {
                        skipped: true,
                        ..MergeOutcome::default()
                    });
                }
                Some(_) => info!(%window, slot, "slot changed since its last merge, merging again"),
                None => {}
            }
        }

        let child_start = window.slot_start(slot);
        let mut outcome = MergeOutcome::default();

        for metric in metrics {
            for &target in targets {
                let key = self.key_for(metric, target, child_start)?;
                self.store
                    .record(&key, Sample::partial(child_start, metric.to_partial()))?;
                outcome.contributions += 1;
                debug!(
                    metric = %metric.name,
                    %target,
                    parent_slot = key.slot(),
                    "wrote contribution"
                );
            }
        }

        self.state.mark_merged(window, slot, &fingerprint)?;

        if self.prune_sources {
            for metric in metrics {
                let source = self.key_for(metric, window, child_start)?;
                if self.store.remove(&source)? > 0 {
                    outcome.removed_sources += 1;
                }
            }
        }

        info!(
            %window,
            slot,
            contributions = outcome.contributions,
            removed_sources = outcome.removed_sources,
            "merged slot"
        );
        Ok(outcome)
    }
}

/// Order-independent digest of a slot's aggregates.
fn fingerprint(metrics: &[Metric]) -> Result<String> {
    let mut entries = metrics
        .iter()
        .map(serde_json::to_vec)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MetricsError::Persistence {
            reason: format!("failed to encode aggregate: {e}"),
        })?;
    entries.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tally_merge_v1");
    for entry in &entries {
        hasher.update(&(entry.len() as u64).to_le_bytes());
        hasher.update(entry);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
