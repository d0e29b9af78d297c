//! Engine configuration.
//!
//! Loaded from TOML. Every section is optional:
//! - `[store]`: key prefix and lock bounds
//! - `[pipeline]`: worker count and merge behaviour
//! - `[retention]`: per-window retention overrides in days
//! - `[[metrics]]`: metric definitions that make up the registry

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};
use crate::key::validate_prefix;
use crate::registry::{MetricDefinition, MetricRegistry};
use crate::types::AggregationWindow;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Namespace prefix for real-time keys and state entries.
    pub prefix: Option<String>,
    /// Upper bound on waiting for a store lock, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Upper bound on waiting for another process to release the data
    /// directory, in milliseconds.
    pub data_lock_wait_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: Some("tally".to_string()),
            lock_timeout_ms: 2_000,
            data_lock_wait_ms: 30_000,
        }
    }
}

impl StoreConfig {
    /// The lock bound as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// The data directory wait as a [`Duration`].
    #[must_use]
    pub const fn data_lock_wait(&self) -> Duration {
        Duration::from_millis(self.data_lock_wait_ms)
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads per type. `1` processes series sequentially.
    pub workers: usize,
    /// Remove source keys once their slot has been rolled up.
    pub prune_merged_sources: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            prune_merged_sources: false,
        }
    }
}

/// Retention overrides in days. Unset windows keep their defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Realtime window retention.
    pub realtime_days: Option<u32>,
    /// Hourly window retention.
    pub hourly_days: Option<u32>,
    /// Daily window retention.
    pub daily_days: Option<u32>,
    /// Weekly window retention.
    pub weekly_days: Option<u32>,
    /// Monthly window retention.
    pub monthly_days: Option<u32>,
}

impl RetentionConfig {
    /// Retention of `window` in milliseconds.
    #[must_use]
    pub fn millis(&self, window: AggregationWindow) -> i64 {
        let days = match window {
            AggregationWindow::Realtime => self.realtime_days,
            AggregationWindow::Hourly => self.hourly_days,
            AggregationWindow::Daily => self.daily_days,
            AggregationWindow::Weekly => self.weekly_days,
            AggregationWindow::Monthly => self.monthly_days,
        };
        days.map_or_else(
            || window.default_retention_millis(),
            |d| i64::from(d) * MILLIS_PER_DAY,
        )
    }

    /// Cutoff before which data of `window` is prunable at `now`.
    #[must_use]
    pub fn cutoff(&self, window: AggregationWindow, now: i64) -> i64 {
        now - self.millis(window)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TallyConfig {
    /// Store settings.
    pub store: StoreConfig,
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
    /// Retention overrides.
    pub retention: RetentionConfig,
    /// Metric definitions.
    pub metrics: Vec<MetricDefinition>,
}

impl TallyConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| MetricsError::Config {
            reason: format!("failed to read config file '{}': {e}", path.display()),
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| MetricsError::Config {
            reason: format!("invalid TOML: {e}"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if let Some(prefix) = &self.store.prefix {
            validate_prefix(prefix)?;
        }

        if self.store.lock_timeout_ms == 0 {
            return Err(MetricsError::Config {
                reason: "store.lock_timeout_ms must be greater than 0".to_string(),
            });
        }

        if self.pipeline.workers == 0 {
            return Err(MetricsError::Config {
                reason: "pipeline.workers must be greater than 0".to_string(),
            });
        }

        for window in AggregationWindow::ALL {
            if self.retention.millis(window) < window.duration_millis() {
                return Err(MetricsError::Config {
                    reason: format!("retention for {window} is shorter than one slot"),
                });
            }
        }

        // Builds the registry to surface invalid or duplicate definitions.
        self.registry().map(|_| ())
    }

    /// The key prefix, if any. An empty prefix counts as none.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.store.prefix.as_deref().filter(|p| !p.is_empty())
    }

    /// Builds the metric registry from the declared definitions.
    ///
    /// # Errors
    ///
    /// Returns `Config` on an invalid or duplicate definition.
    pub fn registry(&self) -> Result<MetricRegistry> {
        Ok(MetricRegistry::builder()
            .register_all(self.metrics.iter().cloned())?
            .build())
    }
}
