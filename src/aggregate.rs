// ============================================================================
// CROSS-CYCLE AGGREGATOR
// ============================================================================
// Accumulates the entities of several collection reports by dimension set and
// finalizes them into one report, applying each metric's calculation kind.
// Callers own a `Collections` exclusively; nothing here is synchronized.
// ============================================================================

use ahash::AHashMap;
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

use crate::catalog::{self, CalculationKind};
use crate::config::UnknownMetricPolicy;
use crate::model::{Dimension, MetricsReport, SimpleMetric, StatsEntity};

// ----------------------------------------------------------------------------
// 6.1 Dimension Fingerprint
// ----------------------------------------------------------------------------

/// Stable hash of a dimension set.
///
/// Dimensions are hashed in name/value order, so two entities carrying the
/// same pairs in a different sequence land in the same bucket.
pub fn fingerprint(dimensions: &[Dimension]) -> u64 {
    let mut pairs: Vec<(&str, &str)> = dimensions
        .iter()
        .map(|d| (d.name.as_str(), d.value.as_str()))
        .collect();
    pairs.sort_unstable();

    let mut hasher = Xxh3::new();
    for (name, value) in pairs {
        hasher.update(name.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(value.as_bytes());
        hasher.update(&[0x1e]);
    }
    hasher.digest()
}

// ----------------------------------------------------------------------------
// 6.2 Accumulation State
// ----------------------------------------------------------------------------

/// Running sums for one dimension set.
#[derive(Debug, Clone, Default)]
pub struct PerDimension {
    /// Dimensions as first seen
    pub dimensions: Vec<Dimension>,
    /// Metric name to running sum, in first-seen order
    pub running_sum: Vec<(String, f64)>,
    index: AHashMap<String, usize>,
}

impl PerDimension {
    fn new(dimensions: Vec<Dimension>) -> Self {
        Self {
            dimensions,
            ..Self::default()
        }
    }

    fn add(&mut self, metric: &SimpleMetric) {
        match self.index.get(&metric.name) {
            Some(&slot) => self.running_sum[slot].1 += metric.value,
            None => {
                self.index.insert(metric.name.clone(), self.running_sum.len());
                self.running_sum.push((metric.name.clone(), metric.value));
            }
        }
    }

    pub fn sum(&self, name: &str) -> Option<f64> {
        self.index.get(name).map(|&slot| self.running_sum[slot].1)
    }
}

/// State for one reporting window.
#[derive(Debug, Clone, Default)]
pub struct Collections {
    /// Number of reports accumulated
    pub count: usize,
    data: AHashMap<u64, PerDimension>,
    order: Vec<u64>,
}

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of distinct dimension sets seen.
    pub fn buckets(&self) -> usize {
        self.data.len()
    }

    pub fn bucket(&self, dimensions: &[Dimension]) -> Option<&PerDimension> {
        self.data.get(&fingerprint(dimensions))
    }

    /// Add one report: bump the report count and sum every metric into the
    /// bucket of its entity's dimension set.
    pub fn accumulate(&mut self, report: &MetricsReport) {
        self.count += 1;
        for entity in &report.entities {
            self.accumulate_entity(entity);
        }
    }

    fn accumulate_entity(&mut self, entity: &StatsEntity) {
        let key = fingerprint(&entity.dimensions);
        let bucket = self.data.entry(key).or_insert_with(|| {
            self.order.push(key);
            PerDimension::new(entity.dimensions.clone())
        });
        for metric in &entity.metrics {
            bucket.add(metric);
        }
    }
}

/// Fold any number of reports into `collections`.
pub fn accumulate<'a, I>(collections: &mut Collections, reports: I)
where
    I: IntoIterator<Item = &'a MetricsReport>,
{
    for report in reports {
        collections.accumulate(report);
    }
}

// ----------------------------------------------------------------------------
// 6.3 Finalize
// ----------------------------------------------------------------------------

/// Produce the report for a window. Buckets keep their first-seen order.
pub fn finalize(collections: &Collections, policy: UnknownMetricPolicy) -> MetricsReport {
    let mut dropped = 0usize;
    let entities = collections
        .order
        .iter()
        .filter_map(|key| collections.data.get(key))
        .map(|bucket| {
            let metrics = bucket
                .running_sum
                .iter()
                .filter_map(|(name, value)| {
                    let kind = catalog::lookup(name).or(match policy {
                        UnknownMetricPolicy::Average => Some(CalculationKind::Avg),
                        UnknownMetricPolicy::Drop => None,
                    });
                    match kind {
                        Some(kind) => Some(SimpleMetric::new(
                            name.clone(),
                            kind.apply(*value, collections.count),
                        )),
                        None => {
                            dropped += 1;
                            debug!(
                                target: "nginx_telemetry::aggregate",
                                metric = %name,
                                "Dropping metric without a calculation kind"
                            );
                            None
                        }
                    }
                })
                .collect();
            StatsEntity::new(bucket.dimensions.clone(), metrics)
        })
        .collect();

    if dropped > 0 {
        debug!(target: "nginx_telemetry::aggregate", dropped, "Finalized report with unknown metrics");
    }

    MetricsReport::new(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn report(dims: &[(&str, &str)], metrics: &[(&str, f64)]) -> MetricsReport {
        MetricsReport::new(vec![StatsEntity::new(
            dims.iter().map(|(n, v)| Dimension::new(*n, *v)).collect(),
            metrics.iter().map(|(n, v)| SimpleMetric::new(*n, *v)).collect(),
        )])
    }

    fn finalized_value(collections: &Collections, name: &str) -> Option<f64> {
        finalize(collections, UnknownMetricPolicy::Drop)
            .entities
            .iter()
            .find_map(|e| e.metric(name))
    }

    #[test]
    fn test_fingerprint_is_order_insensitive() {
        let a = vec![Dimension::new("hostname", "web"), Dimension::new("zone", "api")];
        let b = vec![Dimension::new("zone", "api"), Dimension::new("hostname", "web")];
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = vec![Dimension::new("zone", "web"), Dimension::new("hostname", "api")];
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_fingerprint_separates_name_and_value() {
        let a = vec![Dimension::new("ab", "c")];
        let b = vec![Dimension::new("a", "bc")];
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_reordered_dims_share_bucket() {
        let mut collections = Collections::new();
        collections.accumulate(&report(&[("a", "1"), ("b", "2")], &[("nginx.http.request.count", 5.0)]));
        collections.accumulate(&report(&[("b", "2"), ("a", "1")], &[("nginx.http.request.count", 7.0)]));
        assert_eq!(collections.buckets(), 1);
        assert_eq!(finalized_value(&collections, "nginx.http.request.count"), Some(12.0));
    }

    #[test]
    fn test_avg_divides_by_report_count() {
        let mut collections = Collections::new();
        for v in [10.0, 20.0, 30.0] {
            collections.accumulate(&report(&[("h", "x")], &[("system.cpu.user", v)]));
        }
        assert_eq!(finalized_value(&collections, "system.cpu.user"), Some(20.0));
    }

    #[test]
    fn test_boolean_majority_vote() {
        let mut up = Collections::new();
        for v in [1.0, 1.0, 1.0, 0.0] {
            up.accumulate(&report(&[("h", "x")], &[("nginx.status", v)]));
        }
        assert_eq!(finalized_value(&up, "nginx.status"), Some(1.0));

        let mut down = Collections::new();
        for v in [1.0, 0.0, 0.0, 0.0] {
            down.accumulate(&report(&[("h", "x")], &[("nginx.status", v)]));
        }
        assert_eq!(finalized_value(&down, "nginx.status"), Some(0.0));
    }

    #[test]
    fn test_slab_slot_rules() {
        let mut collections = Collections::new();
        for _ in 0..2 {
            collections.accumulate(&report(
                &[("zone", "z")],
                &[("plus.slab.slots.8.reqs", 4.0), ("plus.slab.slots.8.used", 4.0)],
            ));
        }
        assert_eq!(finalized_value(&collections, "plus.slab.slots.8.reqs"), Some(8.0));
        assert_eq!(finalized_value(&collections, "plus.slab.slots.8.used"), Some(4.0));
    }

    #[test]
    fn test_unknown_metric_policy() {
        let mut collections = Collections::new();
        collections.accumulate(&report(&[("h", "x")], &[("custom.thing", 4.0)]));
        collections.accumulate(&report(&[("h", "x")], &[("custom.thing", 2.0)]));

        assert_eq!(finalized_value(&collections, "custom.thing"), None);

        let averaged = finalize(&collections, UnknownMetricPolicy::Average);
        assert_eq!(averaged.entities[0].metric("custom.thing"), Some(3.0));
    }

    #[test]
    fn test_accumulate_many_reports() {
        let reports: Vec<_> = (0..3)
            .map(|_| report(&[("h", "x")], &[("nginx.http.conn.accepted", 2.0)]))
            .collect();
        let mut collections = Collections::new();
        accumulate(&mut collections, &reports);
        assert_eq!(collections.count, 3);
        assert_eq!(
            collections.bucket(&[Dimension::new("h", "x")]).and_then(|b| b.sum("nginx.http.conn.accepted")),
            Some(6.0)
        );
    }

    proptest! {
        #[test]
        fn prop_sum_is_n_times_v(n in 1usize..50, v in 0.0f64..1e6) {
            let mut collections = Collections::new();
            for _ in 0..n {
                collections.accumulate(&report(&[("h", "x")], &[("nginx.http.request.count", v)]));
            }
            let got = finalized_value(&collections, "nginx.http.request.count").unwrap_or(f64::NAN);
            prop_assert!((got - n as f64 * v).abs() <= 1e-6 * (1.0 + n as f64 * v));
        }

        #[test]
        fn prop_avg_is_mean(values in proptest::collection::vec(0.0f64..1e6, 1..40)) {
            let mut collections = Collections::new();
            for v in &values {
                collections.accumulate(&report(&[("h", "x")], &[("system.mem.used", *v)]));
            }
            let expected = values.iter().sum::<f64>() / values.len() as f64;
            let got = finalized_value(&collections, "system.mem.used").unwrap_or(f64::NAN);
            prop_assert!((got - expected).abs() <= 1e-6 * (1.0 + expected));
        }
    }
}
