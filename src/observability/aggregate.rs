//! Aggregation metrics, labelled by object type

use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct AggregateMetrics;

impl AggregateMetrics {
    pub fn record_partition(object_type: &str, events: u64, dropped: u64, rows: usize) {
        let label = object_type.to_string();
        ::metrics::counter!(phase_metric!(counter, "aggregate", "events_resolved"), "object_type" => label.clone())
            .increment(events);
        ::metrics::counter!(phase_metric!(counter, "aggregate", "events_dropped"), "object_type" => label.clone())
            .increment(dropped);
        ::metrics::histogram!(phase_metric!(histogram, "aggregate", "rows_per_partition"), "object_type" => label)
            .record(rows as f64);
    }

    pub fn catalog_failure(object_type: &str) {
        ::metrics::counter!(phase_metric!(counter, "aggregate", "catalog_failures"), "object_type" => object_type.to_string())
            .increment(1);
    }
}

impl PhaseMetrics for AggregateMetrics {
    fn register_metrics() {
        let _ = ::metrics::counter!(phase_metric!(counter, "aggregate", "events_resolved"));
        let _ = ::metrics::counter!(phase_metric!(counter, "aggregate", "events_dropped"));
        let _ = ::metrics::counter!(phase_metric!(counter, "aggregate", "catalog_failures"));
        let _ = ::metrics::histogram!(phase_metric!(histogram, "aggregate", "rows_per_partition"));
    }

    fn phase_name() -> &'static str {
        "aggregate"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "aggregate", "events_resolved"),
                metric_type: MetricType::Counter,
                help: "Events whose key resolved through the catalog snapshot",
                labels: vec!["object_type"],
            },
            MetricDoc {
                name: phase_metric!(counter, "aggregate", "events_dropped"),
                metric_type: MetricType::Counter,
                help: "Events dropped because their key is absent from the catalog snapshot",
                labels: vec!["object_type"],
            },
            MetricDoc {
                name: phase_metric!(counter, "aggregate", "catalog_failures"),
                metric_type: MetricType::Counter,
                help: "Object types skipped because their catalog snapshot could not be loaded",
                labels: vec!["object_type"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "aggregate", "rows_per_partition"),
                metric_type: MetricType::Histogram,
                help: "Aggregated rows emitted per (date, object type)",
                labels: vec!["object_type"],
            },
        ]
    }
}
