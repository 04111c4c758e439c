//! Archive queue metrics: claims, releases and archives left in `ongoing`

use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct QueueMetrics;

impl QueueMetrics {
    pub fn archives_claimed(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "queue", "archives_claimed")).increment(count as u64);
    }

    pub fn archives_released(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "queue", "archives_released")).increment(count as u64);
    }

    pub fn invalid_keys(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "queue", "invalid_keys")).increment(count as u64);
    }

    pub fn archives_stuck(count: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "queue", "archives_stuck")).set(count as f64);
    }
}

impl PhaseMetrics for QueueMetrics {
    fn register_metrics() {
        let _ = ::metrics::counter!(phase_metric!(counter, "queue", "archives_claimed"));
        let _ = ::metrics::counter!(phase_metric!(counter, "queue", "archives_released"));
        let _ = ::metrics::counter!(phase_metric!(counter, "queue", "invalid_keys"));
        let _ = ::metrics::gauge!(phase_metric!(gauge, "queue", "archives_stuck"));
    }

    fn phase_name() -> &'static str {
        "queue"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "queue", "archives_claimed"),
                metric_type: MetricType::Counter,
                help: "Archives moved from new to ongoing",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "queue", "archives_released"),
                metric_type: MetricType::Counter,
                help: "Archives moved from ongoing to processed",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "queue", "invalid_keys"),
                metric_type: MetricType::Counter,
                help: "Objects under the queue prefixes whose name carries no ddmmyyyy date",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(gauge, "queue", "archives_stuck"),
                metric_type: MetricType::Gauge,
                help: "Archives found in ongoing at the start of a run",
                labels: vec![],
            },
        ]
    }
}
