//! Per-type reduction of samples into aggregates.
//!
//! Each [`MetricType`] has one [`MetricHandler`]. A handler reduces raw
//! samples of one series slot with [`aggregate`](MetricHandler::aggregate),
//! and folds finer-window aggregates into a coarser slot with
//! [`combine`](MetricHandler::combine).

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{MetricsError, Result};
use crate::registry::MetricDefinition;
use crate::types::{
    AggregationWindow, Bucket, HistogramValue, MetricType, MetricValue, PartialAggregate,
    Quantile, Sample, SummaryValue,
};

/// What a handler knows about the series it reduces.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    /// Definition supplying bounds, buckets and quantiles.
    pub definition: &'a MetricDefinition,
    /// Window whose slot is being reduced.
    pub window: AggregationWindow,
}

impl<'a> HandlerContext<'a> {
    /// Creates a context.
    #[must_use]
    pub const fn new(definition: &'a MetricDefinition, window: AggregationWindow) -> Self {
        Self { definition, window }
    }

    fn metric(&self) -> &str {
        self.definition.name.as_str()
    }

    fn insufficient(&self) -> MetricsError {
        MetricsError::InsufficientData {
            reason: format!("no samples for {} in {} slot", self.metric(), self.window),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> MetricsError {
        MetricsError::invalid_metric(self.metric(), reason)
    }

    /// Validates a finished aggregate: every number finite, scalars within
    /// the definition's bounds.
    fn finish(&self, value: MetricValue) -> Result<MetricValue> {
        if !value.is_finite() {
            return Err(self.invalid("aggregate is not finite"));
        }
        if let MetricValue::Scalar(v) = value {
            self.definition.check_value(v)?;
        }
        Ok(value)
    }
}

/// Reduction rules for one metric type.
pub trait MetricHandler: Send + Sync + Debug {
    /// The type this handler reduces.
    fn metric_type(&self) -> MetricType;

    /// Reduces raw samples of one slot to an aggregate.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` on empty input and `InvalidMetric` when
    /// the result is non-finite or out of bounds.
    fn aggregate(&self, ctx: &HandlerContext<'_>, samples: &[Sample]) -> Result<MetricValue>;

    /// Folds finer-window aggregates into one aggregate for a coarser slot.
    ///
    /// # Errors
    ///
    /// As for [`aggregate`](Self::aggregate), plus `InvalidMetric` when the
    /// parts have incompatible shapes.
    fn combine(&self, ctx: &HandlerContext<'_>, parts: &[PartialAggregate]) -> Result<MetricValue>;
}

/// Sums samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterHandler;

impl MetricHandler for CounterHandler {
    fn metric_type(&self) -> MetricType {
        MetricType::Counter
    }

    fn aggregate(&self, ctx: &HandlerContext<'_>, samples: &[Sample]) -> Result<MetricValue> {
        if samples.is_empty() {
            return Err(ctx.insufficient());
        }
        ctx.finish(MetricValue::Scalar(samples.iter().map(|s| s.value).sum()))
    }

    fn combine(&self, ctx: &HandlerContext<'_>, parts: &[PartialAggregate]) -> Result<MetricValue> {
        if parts.is_empty() {
            return Err(ctx.insufficient());
        }
        ctx.finish(MetricValue::Scalar(parts.iter().map(|p| p.value.scalar()).sum()))
    }
}

/// Keeps the latest value.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaugeHandler;

impl MetricHandler for GaugeHandler {
    fn metric_type(&self) -> MetricType {
        MetricType::Gauge
    }

    fn aggregate(&self, ctx: &HandlerContext<'_>, samples: &[Sample]) -> Result<MetricValue> {
        // `>=` lets a later sample win a timestamp tie.
        let latest = samples
            .iter()
            .reduce(|best, s| if s.timestamp >= best.timestamp { s } else { best })
            .ok_or_else(|| ctx.insufficient())?;
        ctx.finish(MetricValue::Scalar(latest.value))
    }

    fn combine(&self, ctx: &HandlerContext<'_>, parts: &[PartialAggregate]) -> Result<MetricValue> {
        let latest = parts
            .iter()
            .reduce(|best, p| {
                if p.last_sample_at >= best.last_sample_at {
                    p
                } else {
                    best
                }
            })
            .ok_or_else(|| ctx.insufficient())?;
        ctx.finish(MetricValue::Scalar(latest.value.scalar()))
    }
}

/// Arithmetic mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageHandler;

impl MetricHandler for AverageHandler {
    fn metric_type(&self) -> MetricType {
        MetricType::Average
    }

    fn aggregate(&self, ctx: &HandlerContext<'_>, samples: &[Sample]) -> Result<MetricValue> {
        if samples.is_empty() {
            return Err(ctx.insufficient());
        }
        let sum: f64 = samples.iter().map(|s| s.value).sum();
        ctx.finish(MetricValue::Scalar(sum / samples.len() as f64))
    }

    fn combine(&self, ctx: &HandlerContext<'_>, parts: &[PartialAggregate]) -> Result<MetricValue> {
        let total: u64 = parts.iter().map(|p| p.sample_count).sum();
        if total == 0 {
            return Err(ctx.insufficient());
        }
        let weighted: f64 = parts
            .iter()
            .map(|p| p.value.scalar() * p.sample_count as f64)
            .sum();
        ctx.finish(MetricValue::Scalar(weighted / total as f64))
    }
}

/// Samples per second over the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateHandler;

impl MetricHandler for RateHandler {
    fn metric_type(&self) -> MetricType {
        MetricType::Rate
    }

    fn aggregate(&self, ctx: &HandlerContext<'_>, samples: &[Sample]) -> Result<MetricValue> {
        if samples.is_empty() {
            return Err(ctx.insufficient());
        }
        ctx.finish(MetricValue::Scalar(
            samples.len() as f64 / ctx.window.duration_secs(),
        ))
    }

    fn combine(&self, ctx: &HandlerContext<'_>, parts: &[PartialAggregate]) -> Result<MetricValue> {
        if parts.is_empty() {
            return Err(ctx.insufficient());
        }
        let total: u64 = parts.iter().map(|p| p.sample_count).sum();
        ctx.finish(MetricValue::Scalar(total as f64 / ctx.window.duration_secs()))
    }
}

/// Buckets values over fixed upper bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramHandler;

impl MetricHandler for HistogramHandler {
    fn metric_type(&self) -> MetricType {
        MetricType::Histogram
    }

    fn aggregate(&self, ctx: &HandlerContext<'_>, samples: &[Sample]) -> Result<MetricValue> {
        if samples.is_empty() {
            return Err(ctx.insufficient());
        }
        let bounds = ctx.definition.effective_buckets();
        let mut buckets: Vec<Bucket> = bounds
            .iter()
            .map(|&upper_bound| Bucket {
                upper_bound,
                count: 0,
            })
            .collect();

        for sample in samples {
            // Values above the last bound land in the implicit +Inf bucket.
            let idx = bounds.partition_point(|b| *b < sample.value);
            if let Some(bucket) = buckets.get_mut(idx) {
                bucket.count += 1;
            }
        }

        ctx.finish(MetricValue::Histogram(HistogramValue {
            buckets,
            count: samples.len() as u64,
            sum: samples.iter().map(|s| s.value).sum(),
        }))
    }

    fn combine(&self, ctx: &HandlerContext<'_>, parts: &[PartialAggregate]) -> Result<MetricValue> {
        let mut histograms = parts.iter().map(|p| match &p.value {
            MetricValue::Histogram(h) => Ok(h),
            _ => Err(ctx.invalid("rollup part is not a histogram")),
        });
        let first = histograms.next().ok_or_else(|| ctx.insufficient())??;
        let mut merged = first.clone();

        for histogram in histograms {
            let histogram = histogram?;
            let same_bounds = histogram.buckets.len() == merged.buckets.len()
                && histogram
                    .buckets
                    .iter()
                    .zip(&merged.buckets)
                    .all(|(a, b)| a.upper_bound.total_cmp(&b.upper_bound).is_eq());
            if !same_bounds {
                return Err(ctx.invalid("histogram bucket boundaries differ between parts"));
            }
            for (into, from) in merged.buckets.iter_mut().zip(&histogram.buckets) {
                into.count += from.count;
            }
            merged.count += histogram.count;
            merged.sum += histogram.sum;
        }

        ctx.finish(MetricValue::Histogram(merged))
    }
}

/// Quantiles by the nearest-rank method, plus count and sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryHandler;

/// Nearest-rank quantile of ascending `sorted` values: the value at rank
/// `ceil(q * n)`, clamped to `[1, n]`.
fn nearest_rank(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    let rank = ((q * n as f64).ceil() as usize).clamp(1, n);
    sorted[rank - 1]
}

impl MetricHandler for SummaryHandler {
    fn metric_type(&self) -> MetricType {
        MetricType::Summary
    }

    fn aggregate(&self, ctx: &HandlerContext<'_>, samples: &[Sample]) -> Result<MetricValue> {
        if samples.is_empty() {
            return Err(ctx.insufficient());
        }
        let mut sorted: Vec<f64> = samples.iter().map(|s| s.value).collect();
        sorted.sort_by(f64::total_cmp);

        let quantiles = ctx
            .definition
            .effective_quantiles()
            .iter()
            .map(|&quantile| Quantile {
                quantile,
                value: nearest_rank(&sorted, quantile),
            })
            .collect();

        ctx.finish(MetricValue::Summary(SummaryValue {
            quantiles,
            count: sorted.len() as u64,
            sum: sorted.iter().sum(),
        }))
    }

    /// Count and sum add exactly. Quantiles are approximated by the
    /// count-weighted mean of each part's quantile.
    fn combine(&self, ctx: &HandlerContext<'_>, parts: &[PartialAggregate]) -> Result<MetricValue> {
        let summaries = parts
            .iter()
            .map(|p| match &p.value {
                MetricValue::Summary(s) => Ok(s),
                _ => Err(ctx.invalid("rollup part is not a summary")),
            })
            .collect::<Result<Vec<_>>>()?;

        let first = summaries.first().ok_or_else(|| ctx.insufficient())?;
        let count: u64 = summaries.iter().map(|s| s.count).sum();
        if count == 0 {
            return Err(ctx.insufficient());
        }
        let sum: f64 = summaries.iter().map(|s| s.sum).sum();

        let mut quantiles = Vec::with_capacity(first.quantiles.len());
        for (i, q) in first.quantiles.iter().enumerate() {
            let mut weighted = 0.0;
            for summary in &summaries {
                let part = summary
                    .quantiles
                    .get(i)
                    .filter(|p| p.quantile.total_cmp(&q.quantile).is_eq())
                    .ok_or_else(|| ctx.invalid("summary quantiles differ between parts"))?;
                weighted += part.value * summary.count as f64;
            }
            quantiles.push(Quantile {
                quantile: q.quantile,
                value: weighted / count as f64,
            });
        }
        if summaries.iter().any(|s| s.quantiles.len() != quantiles.len()) {
            return Err(ctx.invalid("summary quantiles differ between parts"));
        }

        ctx.finish(MetricValue::Summary(SummaryValue {
            quantiles,
            count,
            sum,
        }))
    }
}

/// Immutable mapping from metric type to handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<MetricType, Arc<dyn MetricHandler>>,
}

impl HandlerRegistry {
    /// An empty registry; every lookup fails until handlers are added.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in handler for every metric type.
    #[must_use]
    pub fn standard() -> Self {
        Self::empty()
            .with(CounterHandler)
            .with(GaugeHandler)
            .with(HistogramHandler)
            .with(SummaryHandler)
            .with(AverageHandler)
            .with(RateHandler)
    }

    /// Adds or replaces the handler for its type.
    #[must_use]
    pub fn with(mut self, handler: impl MetricHandler + 'static) -> Self {
        self.handlers.insert(handler.metric_type(), Arc::new(handler));
        self
    }

    /// Resolves the handler for a type.
    ///
    /// # Errors
    ///
    /// Returns `HandlerNotFound` when the type has no handler.
    pub fn get(&self, metric_type: MetricType) -> Result<&dyn MetricHandler> {
        self.handlers
            .get(&metric_type)
            .map(AsRef::as_ref)
            .ok_or_else(|| MetricsError::HandlerNotFound {
                metric_type: metric_type.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricName;

    fn def(metric_type: MetricType) -> MetricDefinition {
        MetricDefinition::new(MetricName::new("m").unwrap(), metric_type)
    }

    fn samples(values: &[f64]) -> Vec<Sample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(i as i64, *v))
            .collect()
    }

    fn scalar(value: &MetricValue) -> f64 {
        match value {
            MetricValue::Scalar(v) => *v,
            other => panic!("expected scalar, got {other:?}"),
        }
    }

    fn part(value: MetricValue, sample_count: u64, last_sample_at: i64) -> PartialAggregate {
        PartialAggregate {
            value,
            sample_count,
            last_sample_at,
        }
    }

    mod counter_tests {
        use super::*;

        #[test]
        fn sums_samples() {
            let d = def(MetricType::Counter);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let value = CounterHandler.aggregate(&ctx, &samples(&[1.0, 2.0, 3.5])).unwrap();
            assert!((scalar(&value) - 6.5).abs() < f64::EPSILON);
        }

        #[test]
        fn combine_sums_parts() {
            let d = def(MetricType::Counter);
            let ctx = HandlerContext::new(&d, AggregationWindow::Daily);
            let parts = [
                part(MetricValue::Scalar(3.0), 3, 10),
                part(MetricValue::Scalar(4.0), 4, 20),
            ];
            let value = CounterHandler.combine(&ctx, &parts).unwrap();
            assert!((scalar(&value) - 7.0).abs() < f64::EPSILON);
        }

        #[test]
        fn max_bound_is_enforced_on_the_aggregate() {
            let d = def(MetricType::Counter).bounds(None, Some(5.0));
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let err = CounterHandler.aggregate(&ctx, &samples(&[4.0, 4.0])).unwrap_err();
            assert!(err.to_string().contains("above max 5"));
        }

        #[test]
        fn non_finite_aggregate_is_invalid() {
            let d = def(MetricType::Counter);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let err = CounterHandler.aggregate(&ctx, &samples(&[f64::MAX, f64::MAX])).unwrap_err();
            assert!(matches!(err, MetricsError::InvalidMetric { .. }));
        }
    }

    mod gauge_tests {
        use super::*;

        #[test]
        fn latest_by_timestamp_wins() {
            let d = def(MetricType::Gauge);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let input = [Sample::new(30, 3.0), Sample::new(10, 1.0), Sample::new(20, 2.0)];
            let value = GaugeHandler.aggregate(&ctx, &input).unwrap();
            assert!((scalar(&value) - 3.0).abs() < f64::EPSILON);
        }

        #[test]
        fn timestamp_tie_goes_to_later_input() {
            let d = def(MetricType::Gauge);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let input = [Sample::new(10, 1.0), Sample::new(10, 2.0)];
            let value = GaugeHandler.aggregate(&ctx, &input).unwrap();
            assert!((scalar(&value) - 2.0).abs() < f64::EPSILON);
        }

        #[test]
        fn combine_takes_most_recent_part() {
            let d = def(MetricType::Gauge);
            let ctx = HandlerContext::new(&d, AggregationWindow::Daily);
            let parts = [
                part(MetricValue::Scalar(9.0), 1, 500),
                part(MetricValue::Scalar(4.0), 1, 100),
            ];
            let value = GaugeHandler.combine(&ctx, &parts).unwrap();
            assert!((scalar(&value) - 9.0).abs() < f64::EPSILON);
        }
    }

    mod average_rate_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn average_is_arithmetic_mean() {
            let d = def(MetricType::Average);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let value = AverageHandler.aggregate(&ctx, &samples(&[1.0, 2.0, 6.0])).unwrap();
            assert!((scalar(&value) - 3.0).abs() < f64::EPSILON);
        }

        #[test]
        fn average_combine_weights_by_count() {
            let d = def(MetricType::Average);
            let ctx = HandlerContext::new(&d, AggregationWindow::Daily);
            let parts = [
                part(MetricValue::Scalar(1.0), 3, 0),
                part(MetricValue::Scalar(5.0), 1, 0),
            ];
            let value = AverageHandler.combine(&ctx, &parts).unwrap();
            assert!((scalar(&value) - 2.0).abs() < f64::EPSILON);
        }

        #[test]
        fn rate_divides_by_window_seconds() {
            let d = def(MetricType::Rate);
            let ctx = HandlerContext::new(&d, AggregationWindow::Realtime);
            let value = RateHandler.aggregate(&ctx, &samples(&[0.0; 30])).unwrap();
            assert!((scalar(&value) - 0.5).abs() < f64::EPSILON);
        }

        #[test]
        fn rate_combine_uses_parent_duration() {
            let d = def(MetricType::Rate);
            let ctx = HandlerContext::new(&d, AggregationWindow::Daily);
            let parts = [
                part(MetricValue::Scalar(0.01), 36, 0),
                part(MetricValue::Scalar(0.01), 36, 0),
            ];
            let expected = 72.0 / 86_400.0;
            assert!((scalar(&RateHandler.combine(&ctx, &parts).unwrap()) - expected).abs() < 1e-12);
        }

        #[test_case(MetricType::Counter)]
        #[test_case(MetricType::Gauge)]
        #[test_case(MetricType::Histogram)]
        #[test_case(MetricType::Summary)]
        #[test_case(MetricType::Average)]
        #[test_case(MetricType::Rate)]
        fn empty_input_is_insufficient(metric_type: MetricType) {
            let d = def(metric_type);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let registry = HandlerRegistry::standard();
            let handler = registry.get(metric_type).unwrap();
            assert!(matches!(
                handler.aggregate(&ctx, &[]),
                Err(MetricsError::InsufficientData { .. })
            ));
            assert!(matches!(
                handler.combine(&ctx, &[]),
                Err(MetricsError::InsufficientData { .. })
            ));
        }
    }

    mod histogram_tests {
        use super::*;

        fn histogram(value: MetricValue) -> HistogramValue {
            match value {
                MetricValue::Histogram(h) => h,
                other => panic!("expected histogram, got {other:?}"),
            }
        }

        #[test]
        fn buckets_are_inclusive_upper_bounds() {
            let d = def(MetricType::Histogram).buckets(vec![1.0, 5.0]);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let h = histogram(
                HistogramHandler
                    .aggregate(&ctx, &samples(&[0.5, 1.0, 3.0, 5.0, 9.0]))
                    .unwrap(),
            );
            let counts: Vec<u64> = h.buckets.iter().map(|b| b.count).collect();
            assert_eq!(counts, vec![2, 2]);
            assert_eq!(h.count, 5);
            assert!((h.sum - 18.5).abs() < f64::EPSILON);
        }

        #[test]
        fn default_buckets_apply() {
            let d = def(MetricType::Histogram);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let h = histogram(HistogramHandler.aggregate(&ctx, &samples(&[0.2])).unwrap());
            assert_eq!(h.buckets.len(), crate::registry::DEFAULT_BUCKETS.len());
        }

        #[test]
        fn combine_adds_bucketwise() {
            let d = def(MetricType::Histogram).buckets(vec![1.0, 5.0]);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let a = HistogramHandler.aggregate(&ctx, &samples(&[0.5, 3.0])).unwrap();
            let b = HistogramHandler.aggregate(&ctx, &samples(&[0.7, 7.0])).unwrap();

            let daily = HandlerContext::new(&d, AggregationWindow::Daily);
            let merged = histogram(
                HistogramHandler
                    .combine(&daily, &[part(a, 2, 0), part(b, 2, 0)])
                    .unwrap(),
            );
            let counts: Vec<u64> = merged.buckets.iter().map(|b| b.count).collect();
            assert_eq!(counts, vec![2, 1]);
            assert_eq!(merged.count, 4);
            assert!((merged.sum - 11.2).abs() < 1e-9);
        }

        #[test]
        fn combine_rejects_mismatched_bounds() {
            let narrow = def(MetricType::Histogram).buckets(vec![1.0]);
            let wide = def(MetricType::Histogram).buckets(vec![1.0, 2.0]);
            let narrow_ctx = HandlerContext::new(&narrow, AggregationWindow::Hourly);
            let wide_ctx = HandlerContext::new(&wide, AggregationWindow::Hourly);
            let a = HistogramHandler.aggregate(&narrow_ctx, &samples(&[0.5])).unwrap();
            let b = HistogramHandler.aggregate(&wide_ctx, &samples(&[0.5])).unwrap();

            let ctx = HandlerContext::new(&wide, AggregationWindow::Daily);
            let err = HistogramHandler
                .combine(&ctx, &[part(a, 1, 0), part(b, 1, 0)])
                .unwrap_err();
            assert!(matches!(err, MetricsError::InvalidMetric { .. }));
        }
    }

    mod summary_tests {
        use super::*;
        use test_case::test_case;

        fn summary(value: MetricValue) -> SummaryValue {
            match value {
                MetricValue::Summary(s) => s,
                other => panic!("expected summary, got {other:?}"),
            }
        }

        #[test]
        fn median_of_one_to_hundred_is_fifty() {
            let d = def(MetricType::Summary).quantiles(vec![0.5, 0.99]);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let values: Vec<f64> = (1..=100).rev().map(f64::from).collect();
            let s = summary(SummaryHandler.aggregate(&ctx, &samples(&values)).unwrap());

            assert!((s.quantiles[0].value - 50.0).abs() < f64::EPSILON);
            assert!((s.quantiles[1].value - 99.0).abs() < f64::EPSILON);
            assert_eq!(s.count, 100);
            assert!((s.sum - 5050.0).abs() < f64::EPSILON);
        }

        #[test_case(0.0, 1.0 ; "zero clamps to first")]
        #[test_case(1.0, 4.0 ; "one is the max")]
        #[test_case(0.25, 1.0 ; "exact rank")]
        #[test_case(0.26, 2.0 ; "rank rounds up")]
        fn nearest_rank_edges(q: f64, expected: f64) {
            assert!((nearest_rank(&[1.0, 2.0, 3.0, 4.0], q) - expected).abs() < f64::EPSILON);
        }

        #[test]
        fn combine_weights_quantiles_by_count() {
            let d = def(MetricType::Summary).quantiles(vec![0.5]);
            let ctx = HandlerContext::new(&d, AggregationWindow::Hourly);
            let a = SummaryHandler.aggregate(&ctx, &samples(&[2.0, 2.0, 2.0])).unwrap();
            let b = SummaryHandler.aggregate(&ctx, &samples(&[6.0])).unwrap();

            let daily = HandlerContext::new(&d, AggregationWindow::Daily);
            let s = summary(
                SummaryHandler
                    .combine(&daily, &[part(a, 3, 0), part(b, 1, 0)])
                    .unwrap(),
            );
            assert_eq!(s.count, 4);
            assert!((s.sum - 12.0).abs() < f64::EPSILON);
            assert!((s.quantiles[0].value - 3.0).abs() < f64::EPSILON);
        }

        #[test]
        fn combine_rejects_scalar_parts() {
            let d = def(MetricType::Summary);
            let ctx = HandlerContext::new(&d, AggregationWindow::Daily);
            let err = SummaryHandler
                .combine(&ctx, &[part(MetricValue::Scalar(1.0), 1, 0)])
                .unwrap_err();
            assert!(matches!(err, MetricsError::InvalidMetric { .. }));
        }
    }

    mod registry_tests {
        use super::*;

        #[test]
        fn standard_covers_every_type() {
            let registry = HandlerRegistry::standard();
            for metric_type in MetricType::ALL {
                assert_eq!(registry.get(metric_type).unwrap().metric_type(), metric_type);
            }
        }

        #[test]
        fn missing_handler_is_typed_error() {
            let registry = HandlerRegistry::empty().with(CounterHandler);
            assert!(matches!(
                registry.get(MetricType::Gauge),
                Err(MetricsError::HandlerNotFound { metric_type }) if metric_type == "gauge"
            ));
        }
    }
}
