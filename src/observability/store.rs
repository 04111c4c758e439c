//! Metrics store writer metrics

use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_replace(table: &str, deleted: usize, inserted: usize, duration_secs: f64) {
        let label = table.to_string();
        ::metrics::counter!(phase_metric!(counter, "store", "rows_deleted"), "table" => label.clone())
            .increment(deleted as u64);
        ::metrics::counter!(phase_metric!(counter, "store", "rows_inserted"), "table" => label.clone())
            .increment(inserted as u64);
        ::metrics::histogram!(phase_metric!(histogram, "store", "replace_duration_seconds"), "table" => label)
            .record(duration_secs);
    }

    pub fn replace_error(table: &str) {
        ::metrics::counter!(phase_metric!(counter, "store", "replace_errors"), "table" => table.to_string())
            .increment(1);
    }
}

impl PhaseMetrics for StoreMetrics {
    fn register_metrics() {
        let _ = ::metrics::counter!(phase_metric!(counter, "store", "rows_deleted"));
        let _ = ::metrics::counter!(phase_metric!(counter, "store", "rows_inserted"));
        let _ = ::metrics::counter!(phase_metric!(counter, "store", "replace_errors"));
        let _ = ::metrics::histogram!(phase_metric!(histogram, "store", "replace_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "store"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "store", "rows_deleted"),
                metric_type: MetricType::Counter,
                help: "Rows removed before reloading a date",
                labels: vec!["table"],
            },
            MetricDoc {
                name: phase_metric!(counter, "store", "rows_inserted"),
                metric_type: MetricType::Counter,
                help: "Rows bulk-inserted for a date",
                labels: vec!["table"],
            },
            MetricDoc {
                name: phase_metric!(counter, "store", "replace_errors"),
                metric_type: MetricType::Counter,
                help: "Delete+insert units rolled back",
                labels: vec!["table"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "store", "replace_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Duration of one delete+insert transaction",
                labels: vec!["table"],
            },
        ]
    }
}
