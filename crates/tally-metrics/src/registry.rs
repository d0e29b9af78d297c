//! Metric definitions and the registry built from them at startup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dimension::DimensionCollection;
use crate::error::{MetricsError, Result};
use crate::types::{MetricName, MetricType};

/// Histogram bucket bounds used when a definition declares none.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Summary quantiles used when a definition declares none.
pub const DEFAULT_QUANTILES: [f64; 5] = [0.5, 0.75, 0.9, 0.95, 0.99];

/// Declaration of one metric series type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Metric name.
    pub name: MetricName,
    /// Reduction kind.
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    /// `# HELP` text.
    #[serde(default)]
    pub help: String,
    /// Inclusive lower bound for values and scalar aggregates.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound for values and scalar aggregates.
    #[serde(default)]
    pub max: Option<f64>,
    /// Histogram upper bounds, ascending.
    #[serde(default)]
    pub buckets: Vec<f64>,
    /// Summary quantiles, ascending.
    #[serde(default)]
    pub quantiles: Vec<f64>,
    /// Allowed dimension names. `None` allows any.
    #[serde(default)]
    pub dimensions: Option<Vec<String>>,
}

impl MetricDefinition {
    /// Creates a definition with no bounds and default buckets/quantiles.
    #[must_use]
    pub fn new(name: MetricName, metric_type: MetricType) -> Self {
        Self {
            name,
            metric_type,
            help: String::new(),
            min: None,
            max: None,
            buckets: Vec::new(),
            quantiles: Vec::new(),
            dimensions: None,
        }
    }

    /// Sets the help text.
    #[must_use]
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    /// Sets the inclusive value bounds.
    #[must_use]
    pub fn bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Sets the histogram bucket bounds.
    #[must_use]
    pub fn buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    /// Sets the summary quantiles.
    #[must_use]
    pub fn quantiles(mut self, quantiles: Vec<f64>) -> Self {
        self.quantiles = quantiles;
        self
    }

    /// Restricts the dimension names a sample may carry.
    #[must_use]
    pub fn allowed_dimensions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dimensions = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Bucket bounds in effect: declared or default.
    #[must_use]
    pub fn effective_buckets(&self) -> &[f64] {
        if self.buckets.is_empty() {
            &DEFAULT_BUCKETS
        } else {
            &self.buckets
        }
    }

    /// Quantiles in effect: declared or default.
    #[must_use]
    pub fn effective_quantiles(&self) -> &[f64] {
        if self.quantiles.is_empty() {
            &DEFAULT_QUANTILES
        } else {
            &self.quantiles
        }
    }

    /// Checks a scalar against the declared bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetric` naming the violated bound, or on a
    /// non-finite value.
    pub fn check_value(&self, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(MetricsError::invalid_metric(
                self.name.as_str(),
                format!("value {value} is not finite"),
            ));
        }
        if let Some(min) = self.min.filter(|min| value < *min) {
            return Err(MetricsError::invalid_metric(
                self.name.as_str(),
                format!("value {value} below min {min}"),
            ));
        }
        if let Some(max) = self.max.filter(|max| value > *max) {
            return Err(MetricsError::invalid_metric(
                self.name.as_str(),
                format!("value {value} above max {max}"),
            ));
        }
        Ok(())
    }

    /// Checks sample dimensions against the allowed names.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetric` on an undeclared dimension name.
    pub fn check_dimensions(&self, dims: &DimensionCollection) -> Result<()> {
        let Some(allowed) = &self.dimensions else {
            return Ok(());
        };
        if let Some((name, _)) = dims.iter().find(|(n, _)| !allowed.iter().any(|a| a == n)) {
            return Err(MetricsError::invalid_metric(
                self.name.as_str(),
                format!("dimension '{name}' is not declared"),
            ));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| MetricsError::Config {
            reason: format!("metric {}: {reason}", self.name),
        };

        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(invalid(format!("min {min} exceeds max {max}")));
            }
        }
        if !strictly_ascending(&self.buckets) {
            return Err(invalid("buckets must be finite and strictly ascending".into()));
        }
        if !strictly_ascending(&self.quantiles)
            || self.quantiles.iter().any(|q| !(0.0..=1.0).contains(q))
        {
            return Err(invalid(
                "quantiles must be strictly ascending within [0, 1]".into(),
            ));
        }
        if let Some(names) = &self.dimensions {
            for name in names {
                crate::dimension::Dimension::new(name.as_str(), "")
                    .map_err(|e| invalid(e.to_string()))?;
            }
        }
        Ok(())
    }
}

fn strictly_ascending(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite()) && values.windows(2).all(|w| w[0] < w[1])
}

/// Immutable set of metric definitions consulted by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    definitions: BTreeMap<MetricName, MetricDefinition>,
}

impl MetricRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> MetricRegistryBuilder {
        MetricRegistryBuilder::default()
    }

    /// Looks up a definition by name.
    #[must_use]
    pub fn get(&self, name: &MetricName) -> Option<&MetricDefinition> {
        self.definitions.get(name)
    }

    /// Looks up a definition by name, failing if it is not registered.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMetric` when the name is not registered.
    pub fn require(&self, name: &MetricName) -> Result<&MetricDefinition> {
        self.get(name).ok_or_else(|| MetricsError::UnknownMetric {
            name: name.to_string(),
        })
    }

    /// All definitions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.definitions.values()
    }

    /// Definitions of one metric type.
    pub fn of_type(&self, metric_type: MetricType) -> impl Iterator<Item = &MetricDefinition> {
        self.definitions
            .values()
            .filter(move |d| d.metric_type == metric_type)
    }

    /// Returns `true` if any definition has the given type.
    #[must_use]
    pub fn has_type(&self, metric_type: MetricType) -> bool {
        self.of_type(metric_type).next().is_some()
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Collects definitions before freezing them into a [`MetricRegistry`].
#[derive(Debug, Default)]
pub struct MetricRegistryBuilder {
    definitions: BTreeMap<MetricName, MetricDefinition>,
}

impl MetricRegistryBuilder {
    /// Registers a definition.
    ///
    /// # Errors
    ///
    /// Returns `Config` on an invalid definition or a duplicate name.
    pub fn register(mut self, definition: MetricDefinition) -> Result<Self> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.name) {
            return Err(MetricsError::Config {
                reason: format!("metric {} registered twice", definition.name),
            });
        }
        self.definitions.insert(definition.name.clone(), definition);
        Ok(self)
    }

    /// Registers every definition in order.
    ///
    /// # Errors
    ///
    /// Stops at the first invalid or duplicate definition.
    pub fn register_all<I>(self, definitions: I) -> Result<Self>
    where
        I: IntoIterator<Item = MetricDefinition>,
    {
        definitions.into_iter().try_fold(self, Self::register)
    }

    /// Freezes the registry.
    #[must_use]
    pub fn build(self) -> MetricRegistry {
        MetricRegistry {
            definitions: self.definitions,
        }
    }
}
