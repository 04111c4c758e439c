//! Matomo outlink collector metrics

use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct MatomoMetrics;

impl MatomoMetrics {
    pub fn request_success(duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "matomo", "requests_success")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "matomo", "request_duration_seconds"))
            .record(duration_secs);
    }

    pub fn request_error() {
        ::metrics::counter!(phase_metric!(counter, "matomo", "requests_error")).increment(1);
    }

    pub fn entries_skipped(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "matomo", "entries_skipped")).increment(count as u64);
    }
}

impl PhaseMetrics for MatomoMetrics {
    fn register_metrics() {
        let _ = ::metrics::counter!(phase_metric!(counter, "matomo", "requests_success"));
        let _ = ::metrics::counter!(phase_metric!(counter, "matomo", "requests_error"));
        let _ = ::metrics::counter!(phase_metric!(counter, "matomo", "entries_skipped"));
        let _ = ::metrics::histogram!(phase_metric!(histogram, "matomo", "request_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "matomo"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "matomo", "requests_success"),
                metric_type: MetricType::Counter,
                help: "Outlink queries answered by the analytics API",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "matomo", "requests_error"),
                metric_type: MetricType::Counter,
                help: "Outlink queries that failed or timed out and were counted as zero",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "matomo", "entries_skipped"),
                metric_type: MetricType::Counter,
                help: "Catalog entries without a remote URL, not queried",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "matomo", "request_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Latency of one outlink query",
                labels: vec![],
            },
        ]
    }
}
